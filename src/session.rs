use crate::clock::Clock;
use crate::config::SessionConfig;
use crate::guard::{FullscreenGuard, PresentationSurface, ProctoringEvent};
use crate::store::{DeadlineKind, SessionStore};
use crate::submit::{AnswerDraft, Receipt, SubmissionClient, SubmitError};
use crate::timer::PersistentTimer;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;

/// Exactly one phase is active per session at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SessionPhase {
    Gate,
    Instructions,
    InProgress,
    Submitting,
    Finished,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Finished | SessionPhase::Aborted)
    }
}

/// Everything that can drive the machine. All mutation goes through
/// [`SessionStateMachine::dispatch`]; no component mutates phase directly.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Delivered by the polling loop; duplicate ticks are harmless no-ops.
    Tick,
    /// Candidate asks to begin the exam. Accepted only in Instructions.
    StartRequested,
    /// Candidate asks to end early; requires confirmation.
    EndRequested,
    EndConfirmed,
    EndCancelled,
    /// The surrounding UI updated an answer. Accepted only while InProgress.
    AnswerChanged { question_id: String, payload: Value },
    /// An externally observed proctoring event (the guard's own drain runs
    /// on every tick; this path is for signals the embedding sees first).
    Proctor(ProctoringEvent),
    /// Candidate asks to re-enter the enforced presentation mode.
    ReacquireRequested,
    /// Unrecoverable local error reported by the embedding.
    Fault(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("presentation mode unavailable: {0}")]
    Presentation(String),
    #[error("submission rejected: {0}")]
    SubmitRejected(String),
    #[error("submission retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("unrecoverable local error: {0}")]
    Fault(String),
}

/// Pushed to subscribers on observable changes. Remaining-time notices are
/// emitted only when the whole-second value actually changes, so duplicate
/// ticks stay silent.
#[derive(Debug, Clone)]
pub enum SessionNotice {
    PhaseChanged(SessionPhase),
    DwellRemainingChanged(Duration),
    RemainingChanged(Duration),
    ViolationRecorded {
        count: u32,
        event: ProctoringEvent,
    },
    /// The enforced presentation mode could not be (re)entered and policy
    /// says to continue without it.
    DegradedProctoring {
        reason: String,
    },
    SubmitRetryScheduled {
        failed_attempts: u32,
        retry_at: DateTime<Utc>,
    },
    Finished(Receipt),
    Aborted(SessionError),
}

/// Orchestrates Gate → Instructions → InProgress → Submitting → Finished,
/// owns every transition rule, and keeps all side effects on transition
/// boundaries.
///
/// Construction is resume-aware: a persisted exam deadline puts the
/// machine straight back into InProgress, and a persisted dwell deadline
/// means a refresh cannot restart the Gate wait.
pub struct SessionStateMachine<S, C, P, B>
where
    S: SessionStore,
    C: Clock + Clone,
    P: PresentationSurface,
    B: SubmissionClient,
{
    session_id: String,
    config: SessionConfig,
    clock: C,
    timer: PersistentTimer<C, S>,
    guard: FullscreenGuard<P, C>,
    client: B,
    phase: SessionPhase,
    draft: AnswerDraft,
    pending_submission: Option<AnswerDraft>,
    violation_count: u32,
    end_confirm_pending: bool,
    degraded: bool,
    attempts_made: u32,
    next_attempt_at: Option<DateTime<Utc>>,
    last_dwell_secs: Option<i64>,
    last_remaining_secs: Option<i64>,
    final_log: Vec<ProctoringEvent>,
    receipt: Option<Receipt>,
    error: Option<SessionError>,
    listeners: Vec<Box<dyn FnMut(&SessionNotice)>>,
}

impl<S, C, P, B> SessionStateMachine<S, C, P, B>
where
    S: SessionStore,
    C: Clock + Clone,
    P: PresentationSurface,
    B: SubmissionClient,
{
    pub fn new(
        session_id: impl Into<String>,
        config: SessionConfig,
        store: S,
        clock: C,
        surface: P,
        client: B,
    ) -> Result<Self, SessionError> {
        let session_id = session_id.into();
        let timer = PersistentTimer::new(clock.clone(), store);
        let guard = FullscreenGuard::new(surface, clock.clone());

        let mut machine = Self {
            session_id,
            config,
            clock,
            timer,
            guard,
            client,
            phase: SessionPhase::Gate,
            draft: AnswerDraft::new(),
            pending_submission: None,
            violation_count: 0,
            end_confirm_pending: false,
            degraded: false,
            attempts_made: 0,
            next_attempt_at: None,
            last_dwell_secs: None,
            last_remaining_secs: None,
            final_log: Vec::new(),
            receipt: None,
            error: None,
            listeners: Vec::new(),
        };

        let resumed = machine
            .timer
            .deadline(&machine.session_id, DeadlineKind::Exam)
            .map_err(|e| SessionError::Storage(e.to_string()))?
            .is_some();

        if resumed {
            // Mid-exam restart: prior violations still count, the guard is
            // re-armed, and the very next tick settles expiry.
            machine.violation_count = machine
                .timer
                .store()
                .events(&machine.session_id)
                .map_err(|e| SessionError::Storage(e.to_string()))?
                .len() as u32;
            machine.phase = SessionPhase::InProgress;
            machine.arm_guard();
        } else {
            let dwell = Duration::seconds(machine.config.gate_dwell_secs as i64);
            machine
                .timer
                .start(&machine.session_id, DeadlineKind::Dwell, dwell)
                .map_err(|e| SessionError::Storage(e.to_string()))?;
        }

        Ok(machine)
    }

    /// Observable changes: phase, remaining time, violations, terminal
    /// Finished/Aborted notices.
    pub fn subscribe(&mut self, listener: impl FnMut(&SessionNotice) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Synchronous state update; returns the phase after the event.
    pub fn dispatch(&mut self, event: SessionEvent) -> SessionPhase {
        if self.phase.is_terminal() {
            return self.phase;
        }

        match event {
            SessionEvent::Tick => self.on_tick(),
            SessionEvent::StartRequested => self.on_start_requested(),
            SessionEvent::EndRequested => {
                if self.phase == SessionPhase::InProgress {
                    self.end_confirm_pending = true;
                }
            }
            SessionEvent::EndCancelled => {
                self.end_confirm_pending = false;
            }
            SessionEvent::EndConfirmed => {
                if self.phase == SessionPhase::InProgress && self.end_confirm_pending {
                    self.begin_submitting();
                }
            }
            SessionEvent::AnswerChanged {
                question_id,
                payload,
            } => {
                if self.phase == SessionPhase::InProgress {
                    self.draft.insert(question_id, payload);
                }
            }
            SessionEvent::Proctor(event) => {
                self.record_event(event);
                self.check_violation_threshold();
            }
            SessionEvent::ReacquireRequested => {
                if self.phase == SessionPhase::InProgress {
                    if let Err(e) = self.guard.reacquire() {
                        self.notify(SessionNotice::DegradedProctoring {
                            reason: e.to_string(),
                        });
                    }
                }
            }
            SessionEvent::Fault(reason) => {
                self.abort_with(SessionError::Fault(reason));
            }
        }

        self.phase
    }

    fn on_tick(&mut self) {
        match self.phase {
            SessionPhase::Gate => {
                let dwell = match self.timer.remaining(&self.session_id, DeadlineKind::Dwell) {
                    Ok(d) => d,
                    Err(e) => return self.abort_with(SessionError::Storage(e.to_string())),
                };
                if dwell <= Duration::zero() {
                    self.set_phase(SessionPhase::Instructions);
                } else if self.last_dwell_secs != Some(dwell.num_seconds()) {
                    self.last_dwell_secs = Some(dwell.num_seconds());
                    self.notify(SessionNotice::DwellRemainingChanged(dwell));
                }
            }
            SessionPhase::Instructions => {}
            SessionPhase::InProgress => {
                // Record everything observed this tick before evaluating
                // transitions, so a violation past the threshold cannot
                // swallow later events from the same batch.
                let drained = self.guard.drain();
                for event in drained {
                    self.record_event(event);
                }
                self.check_violation_threshold();
                if self.phase != SessionPhase::InProgress {
                    return;
                }

                let remaining = match self.timer.remaining(&self.session_id, DeadlineKind::Exam) {
                    Ok(d) => d,
                    Err(e) => return self.abort_with(SessionError::Storage(e.to_string())),
                };
                if remaining <= Duration::zero() {
                    // Includes the resumed-past-deadline case: zero on the
                    // first read is expiry, not "never started".
                    self.begin_submitting();
                } else if self.last_remaining_secs != Some(remaining.num_seconds()) {
                    self.last_remaining_secs = Some(remaining.num_seconds());
                    self.notify(SessionNotice::RemainingChanged(remaining));
                }
            }
            SessionPhase::Submitting => {
                let drained = self.guard.drain();
                for event in drained {
                    self.record_event(event);
                }
                if self.phase != SessionPhase::Submitting {
                    return;
                }
                if let Some(retry_at) = self.next_attempt_at {
                    if self.clock.now() >= retry_at {
                        self.next_attempt_at = None;
                        self.attempt_submit();
                    }
                }
            }
            SessionPhase::Finished | SessionPhase::Aborted => {}
        }
    }

    fn on_start_requested(&mut self) {
        if self.phase != SessionPhase::Instructions {
            return;
        }

        let exam = Duration::seconds(self.config.exam_secs as i64);
        if let Err(e) = self
            .timer
            .start(&self.session_id, DeadlineKind::Exam, exam)
        {
            return self.abort_with(SessionError::Storage(e.to_string()));
        }
        self.set_phase(SessionPhase::InProgress);
        self.arm_guard();
    }

    /// Arm, applying the `require_presentation` policy on refusal. The
    /// guard reports the failure; the decision lives here.
    fn arm_guard(&mut self) {
        if let Err(e) = self.guard.arm() {
            if self.config.require_presentation {
                self.abort_with(SessionError::Presentation(e.to_string()));
            } else {
                self.degraded = true;
                self.notify(SessionNotice::DegradedProctoring {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Append to the durable log and bump the count. Never transitions;
    /// threshold evaluation is a separate step.
    fn record_event(&mut self, event: ProctoringEvent) {
        if self.phase.is_terminal()
            || matches!(self.phase, SessionPhase::Gate | SessionPhase::Instructions)
        {
            return;
        }
        if let Err(e) = self
            .timer
            .store_mut()
            .append_event(&self.session_id, &event)
        {
            return self.abort_with(SessionError::Storage(e.to_string()));
        }
        self.violation_count += 1;
        self.notify(SessionNotice::ViolationRecorded {
            count: self.violation_count,
            event,
        });
    }

    fn check_violation_threshold(&mut self) {
        if self.phase == SessionPhase::InProgress
            && self.violation_count >= self.config.violation_threshold
        {
            self.begin_submitting();
        }
    }

    /// Snapshot the draft and enter Submitting. The snapshot is what every
    /// retry sends, so the payload is identical across attempts.
    fn begin_submitting(&mut self) {
        if self.phase != SessionPhase::InProgress {
            return;
        }
        self.pending_submission = Some(self.draft.clone());
        self.end_confirm_pending = false;
        self.set_phase(SessionPhase::Submitting);
        self.attempt_submit();
    }

    fn attempt_submit(&mut self) {
        let payload = self.pending_submission.clone().unwrap_or_default();
        self.attempts_made += 1;

        match self.client.submit(&self.session_id, &payload) {
            Ok(receipt) => self.finish(receipt),
            Err(SubmitError::Permanent(reason)) => {
                self.abort_with(SessionError::SubmitRejected(reason));
            }
            Err(SubmitError::Transient(reason)) => {
                if self.attempts_made >= self.config.retry.max_attempts {
                    self.abort_with(SessionError::RetriesExhausted {
                        attempts: self.attempts_made,
                        last: reason,
                    });
                } else {
                    let retry_at =
                        self.clock.now() + self.config.retry.backoff_after(self.attempts_made);
                    self.next_attempt_at = Some(retry_at);
                    self.notify(SessionNotice::SubmitRetryScheduled {
                        failed_attempts: self.attempts_made,
                        retry_at,
                    });
                }
            }
        }
    }

    fn finish(&mut self, receipt: Receipt) {
        self.final_log = self
            .timer
            .store()
            .events(&self.session_id)
            .unwrap_or_default();
        let _ = self.timer.clear(&self.session_id);
        self.guard.disarm();
        self.receipt = Some(receipt.clone());
        self.set_phase(SessionPhase::Finished);
        self.notify(SessionNotice::Finished(receipt));
    }

    fn abort_with(&mut self, error: SessionError) {
        if self.phase.is_terminal() {
            return;
        }
        self.final_log = self
            .timer
            .store()
            .events(&self.session_id)
            .unwrap_or_default();
        let _ = self.timer.clear(&self.session_id);
        self.guard.disarm();
        self.error = Some(error.clone());
        self.set_phase(SessionPhase::Aborted);
        self.notify(SessionNotice::Aborted(error));
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        self.phase = phase;
        self.notify(SessionNotice::PhaseChanged(phase));
    }

    fn notify(&mut self, notice: SessionNotice) {
        for listener in &mut self.listeners {
            listener(&notice);
        }
    }

    /// Mark every recorded violation as acknowledged, once the front end
    /// has surfaced them. Events are only flagged, never altered or
    /// removed; failures here are not worth ending an exam over.
    pub fn acknowledge_violations(&mut self) {
        let _ = self
            .timer
            .store_mut()
            .acknowledge_events(&self.session_id);
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn violation_count(&self) -> u32 {
        self.violation_count
    }

    pub fn end_confirm_pending(&self) -> bool {
        self.end_confirm_pending
    }

    /// True when proctoring could not be armed and policy let the session
    /// continue without it.
    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        self.receipt.as_ref()
    }

    pub fn error(&self) -> Option<&SessionError> {
        self.error.as_ref()
    }

    pub fn draft(&self) -> &AnswerDraft {
        &self.draft
    }

    /// Remaining exam time; zero before the exam starts or after teardown.
    pub fn remaining(&self) -> Duration {
        self.timer
            .remaining(&self.session_id, DeadlineKind::Exam)
            .unwrap_or_else(|_| Duration::zero())
    }

    pub fn dwell_remaining(&self) -> Duration {
        self.timer
            .remaining(&self.session_id, DeadlineKind::Dwell)
            .unwrap_or_else(|_| Duration::zero())
    }

    /// The session's proctoring log. After a terminal transition this is
    /// the snapshot taken before the persisted entries were cleared.
    pub fn proctoring_log(&self) -> Vec<ProctoringEvent> {
        if self.phase.is_terminal() {
            self.final_log.clone()
        } else {
            self.timer
                .store()
                .events(&self.session_id)
                .unwrap_or_default()
        }
    }
}

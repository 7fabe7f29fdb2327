use assert_matches::assert_matches;
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use invigil::clock::ManualClock;
use invigil::config::SessionConfig;
use invigil::guard::{ProctorEventKind, ScriptedSurface};
use invigil::session::{SessionError, SessionEvent, SessionPhase, SessionStateMachine};
use invigil::store::MemoryStore;
use invigil::submit::ScriptedClient;

/// End-to-end controller scenarios driven headlessly: the machine, the
/// deadline store, the guard, and the submission client wired together
/// exactly as an embedding would, with synthetic time.

type Machine = SessionStateMachine<MemoryStore, ManualClock, ScriptedSurface, ScriptedClient>;

struct Harness {
    clock: ManualClock,
    store: MemoryStore,
    surface: ScriptedSurface,
    client: ScriptedClient,
    machine: Machine,
}

fn harness(config: SessionConfig, client: ScriptedClient) -> Harness {
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
    let store = MemoryStore::new();
    let surface = ScriptedSurface::new();
    let machine = SessionStateMachine::new(
        "S1",
        config,
        store.clone(),
        clock.clone(),
        surface.clone(),
        client.clone(),
    )
    .unwrap();
    Harness {
        clock,
        store,
        surface,
        client,
        machine,
    }
}

fn config(exam_secs: u64) -> SessionConfig {
    SessionConfig {
        gate_dwell_secs: 60,
        exam_secs,
        ..SessionConfig::default()
    }
}

/// Gate wait, then start, for tests that exercise the exam itself.
fn begin_exam(h: &mut Harness) {
    h.clock.advance(Duration::seconds(60));
    assert_eq!(
        h.machine.dispatch(SessionEvent::Tick),
        SessionPhase::Instructions
    );
    assert_eq!(
        h.machine.dispatch(SessionEvent::StartRequested),
        SessionPhase::InProgress
    );
}

#[test]
fn scenario_a_expiry_forces_exactly_one_submission() {
    // 90-minute exam, left to run out.
    let mut h = harness(config(5400), ScriptedClient::succeeding());
    begin_exam(&mut h);

    h.machine.dispatch(SessionEvent::AnswerChanged {
        question_id: "q1".into(),
        payload: json!({"choice": "b"}),
    });

    // Just before the deadline nothing happens.
    h.clock.advance(Duration::seconds(5399));
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::InProgress);

    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::Finished);

    let submissions = h.client.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, "S1");
    assert_eq!(submissions[0].1.get("q1"), Some(&json!({"choice": "b"})));
}

#[test]
fn scenario_b_confirmed_end_submits_and_clears() {
    let mut h = harness(config(5400), ScriptedClient::succeeding());
    begin_exam(&mut h);

    h.clock.advance(Duration::seconds(10));
    h.machine.dispatch(SessionEvent::Tick);
    assert_eq!(h.machine.remaining(), Duration::seconds(5390));

    h.machine.dispatch(SessionEvent::EndRequested);
    assert_eq!(
        h.machine.dispatch(SessionEvent::EndConfirmed),
        SessionPhase::Finished
    );
    assert!(h.machine.receipt().is_some());

    // Teardown cleared the deadline: a fresh timer over the same store
    // sees nothing and a new start gets the full duration again.
    use invigil::store::DeadlineKind;
    use invigil::timer::PersistentTimer;
    let mut timer = PersistentTimer::new(h.clock.clone(), h.store.clone());
    assert_eq!(
        timer.remaining("S1", DeadlineKind::Exam).unwrap(),
        Duration::zero()
    );
    timer
        .start("S1", DeadlineKind::Exam, Duration::seconds(5400))
        .unwrap();
    assert_eq!(
        timer.remaining("S1", DeadlineKind::Exam).unwrap(),
        Duration::seconds(5400)
    );
}

#[test]
fn scenario_c_transient_failures_retry_with_identical_payload() {
    let mut h = harness(config(600), ScriptedClient::flaky(3));
    begin_exam(&mut h);

    h.machine.dispatch(SessionEvent::AnswerChanged {
        question_id: "q7".into(),
        payload: json!("final answer"),
    });
    h.machine.dispatch(SessionEvent::EndRequested);
    assert_eq!(
        h.machine.dispatch(SessionEvent::EndConfirmed),
        SessionPhase::Submitting
    );

    // Backoff after n failures is ~2^(n-1) * base, jittered by up to 10%;
    // stepping past each window triggers exactly the next attempt.
    for advance_secs in [3, 5, 9] {
        h.clock.advance(Duration::seconds(advance_secs));
        h.machine.dispatch(SessionEvent::Tick);
    }

    assert_eq!(h.machine.phase(), SessionPhase::Finished);
    let submissions = h.client.submissions();
    assert_eq!(submissions.len(), 4);
    let first = &submissions[0].1;
    assert!(submissions.iter().all(|(id, draft)| id == "S1" && draft == first));
    assert_eq!(first.get("q7"), Some(&json!("final answer")));
}

#[test]
fn scenario_c_ticks_inside_the_backoff_window_do_not_resubmit() {
    let mut h = harness(config(600), ScriptedClient::flaky(1));
    begin_exam(&mut h);

    h.machine.dispatch(SessionEvent::EndRequested);
    h.machine.dispatch(SessionEvent::EndConfirmed);
    assert_eq!(h.machine.phase(), SessionPhase::Submitting);
    assert_eq!(h.client.submissions().len(), 1);

    // Duplicate ticks with no time passing must not hammer the server.
    h.machine.dispatch(SessionEvent::Tick);
    h.machine.dispatch(SessionEvent::Tick);
    assert_eq!(h.client.submissions().len(), 1);

    h.clock.advance(Duration::seconds(3));
    h.machine.dispatch(SessionEvent::Tick);
    assert_eq!(h.machine.phase(), SessionPhase::Finished);
    assert_eq!(h.client.submissions().len(), 2);
}

#[test]
fn scenario_d_violation_threshold_forces_submit_but_keeps_recording() {
    // Flaky client keeps the machine in Submitting long enough for a
    // fourth violation to arrive after the forced transition.
    let mut h = harness(config(600), ScriptedClient::flaky(1));
    begin_exam(&mut h);

    for _ in 0..3 {
        h.surface.push_signal(ProctorEventKind::FullscreenExit);
    }
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::Submitting);
    assert_eq!(h.machine.violation_count(), 3);

    // Late event: recorded, no further transition.
    h.surface.push_signal(ProctorEventKind::FullscreenExit);
    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::Submitting);
    assert_eq!(h.machine.violation_count(), 4);

    h.clock.advance(Duration::seconds(3));
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::Finished);

    let log = h.machine.proctoring_log();
    assert_eq!(log.len(), 4);
    assert!(log
        .iter()
        .all(|e| e.kind == ProctorEventKind::FullscreenExit));
}

#[test]
fn events_survive_reacquire_without_loss() {
    let cfg = SessionConfig {
        violation_threshold: 10,
        ..config(600)
    };
    let mut h = harness(cfg, ScriptedClient::succeeding());
    begin_exam(&mut h);

    h.surface.push_signal(ProctorEventKind::FullscreenExit);
    h.surface.push_signal(ProctorEventKind::WindowBlur);
    h.machine.dispatch(SessionEvent::Tick);

    h.machine.dispatch(SessionEvent::ReacquireRequested);

    h.surface.push_signal(ProctorEventKind::TabHidden);
    h.clock.advance(Duration::seconds(1));
    h.machine.dispatch(SessionEvent::Tick);

    let log = h.machine.proctoring_log();
    assert_eq!(log.len(), 3);
    assert_eq!(
        log.iter().map(|e| e.kind).collect::<Vec<_>>(),
        vec![
            ProctorEventKind::FullscreenExit,
            ProctorEventKind::WindowBlur,
            ProctorEventKind::TabHidden,
        ]
    );
    assert_eq!(h.surface.enter_calls(), 2);

    // Acknowledging flags the entries without touching the log itself.
    h.machine.acknowledge_violations();
    let log = h.machine.proctoring_log();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|e| e.acknowledged));
}

#[test]
fn gate_dwell_survives_a_reload_without_restarting() {
    let mut h = harness(config(600), ScriptedClient::succeeding());

    h.clock.advance(Duration::seconds(30));
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::Gate);

    // "Reload": a new machine over the same store must not reset the wait.
    let mut reloaded: Machine = SessionStateMachine::new(
        "S1",
        config(600),
        h.store.clone(),
        h.clock.clone(),
        ScriptedSurface::new(),
        ScriptedClient::succeeding(),
    )
    .unwrap();

    assert_eq!(reloaded.dispatch(SessionEvent::Tick), SessionPhase::Gate);
    assert!(reloaded.dwell_remaining() <= Duration::seconds(30));

    h.clock.advance(Duration::seconds(30));
    assert_eq!(
        reloaded.dispatch(SessionEvent::Tick),
        SessionPhase::Instructions
    );
}

#[test]
fn mid_exam_restart_resumes_with_time_and_violations_intact() {
    let mut h = harness(config(600), ScriptedClient::succeeding());
    begin_exam(&mut h);

    h.surface.push_signal(ProctorEventKind::WindowBlur);
    h.surface.push_signal(ProctorEventKind::WindowBlur);
    h.machine.dispatch(SessionEvent::Tick);
    h.clock.advance(Duration::seconds(100));

    let surface = ScriptedSurface::new();
    let mut resumed: Machine = SessionStateMachine::new(
        "S1",
        config(600),
        h.store.clone(),
        h.clock.clone(),
        surface.clone(),
        ScriptedClient::succeeding(),
    )
    .unwrap();

    assert_eq!(resumed.phase(), SessionPhase::InProgress);
    assert_eq!(resumed.violation_count(), 2);
    assert_eq!(resumed.remaining(), Duration::seconds(500));
    // The guard was re-armed on resume.
    assert_eq!(surface.enter_calls(), 1);
}

#[test]
fn resume_past_the_deadline_goes_straight_to_submitting() {
    let mut h = harness(config(600), ScriptedClient::succeeding());
    begin_exam(&mut h);

    // Tab closed; the deadline passes while nothing is running.
    h.clock.advance(Duration::seconds(700));

    let client = ScriptedClient::succeeding();
    let mut resumed: Machine = SessionStateMachine::new(
        "S1",
        config(600),
        h.store.clone(),
        h.clock.clone(),
        ScriptedSurface::new(),
        client.clone(),
    )
    .unwrap();

    assert_eq!(resumed.phase(), SessionPhase::InProgress);
    assert_eq!(resumed.remaining(), Duration::zero());

    // The very next tick treats zero remaining as expiry, not "never
    // started", and drives the forced-submit path.
    assert_eq!(resumed.dispatch(SessionEvent::Tick), SessionPhase::Finished);
    assert_eq!(client.submissions().len(), 1);
}

#[test]
fn expiry_outranks_an_end_request_on_the_same_tick() {
    let mut h = harness(config(600), ScriptedClient::flaky(1));
    begin_exam(&mut h);

    h.clock.advance(Duration::seconds(600));
    assert_eq!(h.machine.dispatch(SessionEvent::Tick), SessionPhase::Submitting);

    // A late "end requested" for the same tick is ignored: the forced
    // submission is already in flight.
    h.machine.dispatch(SessionEvent::EndRequested);
    h.machine.dispatch(SessionEvent::EndConfirmed);
    assert_eq!(h.machine.phase(), SessionPhase::Submitting);
    assert_eq!(h.client.submissions().len(), 1);
}

#[test]
fn aborted_session_surfaces_the_error_and_clears_state() {
    let mut h = harness(config(600), ScriptedClient::rejecting("session finalized"));
    begin_exam(&mut h);

    h.machine.dispatch(SessionEvent::EndRequested);
    assert_eq!(
        h.machine.dispatch(SessionEvent::EndConfirmed),
        SessionPhase::Aborted
    );
    assert_matches!(h.machine.error(), Some(SessionError::SubmitRejected(_)));
    assert_eq!(h.machine.remaining(), Duration::zero());

    // Permanent rejections are never retried.
    assert_eq!(h.client.submissions().len(), 1);
}

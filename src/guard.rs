use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Integrity-relevant loss of the enforced presentation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum ProctorEventKind {
    FullscreenExit,
    TabHidden,
    WindowBlur,
}

impl ProctorEventKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FullscreenExit" => Some(Self::FullscreenExit),
            "TabHidden" => Some(Self::TabHidden),
            "WindowBlur" => Some(Self::WindowBlur),
            _ => None,
        }
    }
}

/// One observed violation. Append-only once recorded; `acknowledged` may
/// be flipped later, the event itself is never rewritten.
#[derive(Debug, Clone, PartialEq)]
pub struct ProctoringEvent {
    pub kind: ProctorEventKind,
    pub occurred_at: DateTime<Utc>,
    pub acknowledged: bool,
}

impl ProctoringEvent {
    pub fn new(kind: ProctorEventKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            occurred_at,
            acknowledged: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GuardError {
    /// The platform refused the enforced presentation mode. Whether to
    /// proceed degraded or abort is the caller's policy, not the guard's.
    #[error("presentation mode unavailable: {0}")]
    PresentationUnavailable(String),
}

/// Platform seam: how the enforced presentation mode is entered and left,
/// and where loss signals come from. The terminal harness maps focus loss
/// here; a browser embedding would map fullscreen/visibility changes.
pub trait PresentationSurface {
    fn enter(&mut self) -> Result<(), GuardError>;
    fn leave(&mut self);
    /// Signals observed since the last poll, in occurrence order.
    fn poll(&mut self) -> Vec<ProctorEventKind>;
}

/// Observes presentation-mode loss while armed and stamps each signal as a
/// [`ProctoringEvent`]. Decides nothing about consequences.
///
/// Disarm is guaranteed on every exit path: explicitly via [`disarm`],
/// implicitly on drop.
///
/// [`disarm`]: FullscreenGuard::disarm
pub struct FullscreenGuard<P: PresentationSurface, C: Clock> {
    surface: P,
    clock: C,
    armed: bool,
}

impl<P: PresentationSurface, C: Clock> FullscreenGuard<P, C> {
    pub fn new(surface: P, clock: C) -> Self {
        Self {
            surface,
            clock,
            armed: false,
        }
    }

    /// Request the enforced presentation mode and begin observation.
    pub fn arm(&mut self) -> Result<(), GuardError> {
        self.surface.enter()?;
        self.armed = true;
        Ok(())
    }

    pub fn disarm(&mut self) {
        if self.armed {
            self.surface.leave();
            self.armed = false;
        }
    }

    /// Re-enter the enforced mode after an exit. Does not erase anything
    /// already observed.
    pub fn reacquire(&mut self) -> Result<(), GuardError> {
        if !self.armed {
            return Ok(());
        }
        self.surface.enter()
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Signals observed since the previous drain, in occurrence order,
    /// stamped with the guard's clock. Empty while disarmed.
    pub fn drain(&mut self) -> Vec<ProctoringEvent> {
        if !self.armed {
            return Vec::new();
        }
        let now = self.clock.now();
        self.surface
            .poll()
            .into_iter()
            .map(|kind| ProctoringEvent::new(kind, now))
            .collect()
    }
}

impl<P: PresentationSurface, C: Clock> Drop for FullscreenGuard<P, C> {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Scripted surface for tests and the harness. Clones share state, so a
/// test can keep a handle while the guard owns another.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSurface {
    inner: Arc<Mutex<ScriptedInner>>,
}

#[derive(Debug, Default)]
struct ScriptedInner {
    deny_entry: bool,
    queued: VecDeque<ProctorEventKind>,
    enter_calls: usize,
    leave_calls: usize,
}

impl ScriptedSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny_entry(&self, deny: bool) {
        self.inner.lock().unwrap().deny_entry = deny;
    }

    pub fn push_signal(&self, kind: ProctorEventKind) {
        self.inner.lock().unwrap().queued.push_back(kind);
    }

    pub fn enter_calls(&self) -> usize {
        self.inner.lock().unwrap().enter_calls
    }

    pub fn leave_calls(&self) -> usize {
        self.inner.lock().unwrap().leave_calls
    }
}

impl PresentationSurface for ScriptedSurface {
    fn enter(&mut self) -> Result<(), GuardError> {
        let mut inner = self.inner.lock().unwrap();
        inner.enter_calls += 1;
        if inner.deny_entry {
            return Err(GuardError::PresentationUnavailable(
                "entry denied by surface".into(),
            ));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.inner.lock().unwrap().leave_calls += 1;
    }

    fn poll(&mut self) -> Vec<ProctorEventKind> {
        self.inner.lock().unwrap().queued.drain(..).collect()
    }
}

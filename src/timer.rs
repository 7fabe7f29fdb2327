use crate::clock::Clock;
use crate::store::{DeadlineKind, SessionDeadline, SessionStore, StoreError};
use chrono::{DateTime, Duration, Utc};

/// Deadline-based timer: remaining time is always derived from a stored
/// absolute end instant, never from decrementing a counter, so reload,
/// suspension, or a crash cannot grant extra time.
///
/// The timer does no scheduling; the caller polls [`remaining`] on its own
/// cadence (design target 1 Hz) and feeds the value to the state machine.
///
/// [`remaining`]: PersistentTimer::remaining
#[derive(Debug)]
pub struct PersistentTimer<C: Clock, S: SessionStore> {
    clock: C,
    store: S,
}

impl<C: Clock, S: SessionStore> PersistentTimer<C, S> {
    pub fn new(clock: C, store: S) -> Self {
        Self { clock, store }
    }

    /// Create the deadline unless one already exists for (session, kind);
    /// an existing one is returned unchanged, so re-entering the page can
    /// never reset the clock.
    pub fn start(
        &mut self,
        session_id: &str,
        kind: DeadlineKind,
        duration: Duration,
    ) -> Result<SessionDeadline, StoreError> {
        let now = self.clock.now();
        let candidate = SessionDeadline {
            session_id: session_id.to_string(),
            kind,
            ends_at: now + duration.max(Duration::zero()),
            created_at: now,
        };
        self.store.put_deadline_if_absent(&candidate)
    }

    /// `max(0, ends_at - now)`, recomputed from the wall clock on every
    /// call. Zero when the deadline has passed or none exists; a resumed
    /// session past its deadline therefore reads as immediate expiry.
    pub fn remaining(&self, session_id: &str, kind: DeadlineKind) -> Result<Duration, StoreError> {
        match self.store.get_deadline(session_id, kind)? {
            Some(deadline) => Ok((deadline.ends_at - self.clock.now()).max(Duration::zero())),
            None => Ok(Duration::zero()),
        }
    }

    pub fn deadline(
        &self,
        session_id: &str,
        kind: DeadlineKind,
    ) -> Result<Option<SessionDeadline>, StoreError> {
        self.store.get_deadline(session_id, kind)
    }

    /// Delete the session's persisted state. Terminal phases only.
    pub fn clear(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.store.clear_session(session_id)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}

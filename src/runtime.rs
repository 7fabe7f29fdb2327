use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::session::SessionEvent;

/// Unified event type consumed by the session runner
#[derive(Clone, Debug)]
pub enum RunnerEvent {
    Command(SessionEvent),
    Resize,
    Tick,
}

/// Source of front-end events (commands, resize, etc.)
pub trait SessionEventSource: Send + 'static {
    /// Block for up to `timeout` waiting for an event.
    /// Returns Ok(event) if an event arrives before the timeout, or Err(Timeout) if it expires.
    fn recv_timeout(&self, timeout: Duration) -> Result<RunnerEvent, RecvTimeoutError>;
}

/// Channel-backed event source; the embedding owns the sender half.
pub struct ChannelEventSource {
    rx: Receiver<RunnerEvent>,
}

impl ChannelEventSource {
    pub fn new(rx: Receiver<RunnerEvent>) -> Self {
        Self { rx }
    }
}

impl SessionEventSource for ChannelEventSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<RunnerEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Configurable ticker interface
pub trait Ticker: Send + Sync + 'static {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// The 1 Hz cadence the controller is designed around.
    pub fn one_hz() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Runner that advances the session one event/tick at a time. The single
/// polling loop drives both the timer tick and guard-event draining; the
/// controller needs no other scheduler.
pub struct Runner<E: SessionEventSource, T: Ticker> {
    event_source: E,
    ticker: T,
}

impl<E: SessionEventSource, T: Ticker> Runner<E, T> {
    pub fn new(event_source: E, ticker: T) -> Self {
        Self {
            event_source,
            ticker,
        }
    }

    /// Blocks up to tick interval and returns the next event, or Tick on timeout
    pub fn step(&self) -> RunnerEvent {
        match self.event_source.recv_timeout(self.ticker.interval()) {
            Ok(ev) => ev,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                RunnerEvent::Tick
            }
        }
    }
}

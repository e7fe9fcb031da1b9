//! Catch-up completion heuristics.

use std::fmt;
use std::time::{Duration, Instant};

/// Why a channel left catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionReason {
    /// The server said the backlog is exhausted.
    Signal,
    /// No event was accepted for the inactivity window.
    Inactivity,
    /// Catch-up ran past the hard timeout.
    Timeout,
    /// The connection failed mid catch-up.
    TransportFailure,
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompletionReason::Signal => "signal",
            CompletionReason::Inactivity => "inactivity",
            CompletionReason::Timeout => "timeout",
            CompletionReason::TransportFailure => "transport_failure",
        };
        f.write_str(s)
    }
}

/// Timing of one channel's catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpClock {
    /// When catch-up began.
    pub started: Instant,
    /// When the last event was accepted (starts equal to `started`).
    pub last_activity: Instant,
}

impl CatchUpClock {
    /// Starts a clock.
    pub fn start(now: Instant) -> Self {
        Self {
            started: now,
            last_activity: now,
        }
    }

    /// Records an accepted event.
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }
}

/// Decides when a catch-up has run its course without an explicit signal.
///
/// Timeouts are measured on the clock, not by counting frames, so they
/// still fire when delivery stalls completely.
#[derive(Debug, Clone, Copy)]
pub struct CompletionDetector {
    inactivity_timeout: Duration,
    catch_up_timeout: Duration,
}

impl CompletionDetector {
    /// Creates a detector.
    pub fn new(inactivity_timeout: Duration, catch_up_timeout: Duration) -> Self {
        Self {
            inactivity_timeout,
            catch_up_timeout,
        }
    }

    /// The inactivity window.
    pub fn inactivity_timeout(&self) -> Duration {
        self.inactivity_timeout
    }

    /// The hard timeout.
    pub fn catch_up_timeout(&self) -> Duration {
        self.catch_up_timeout
    }

    /// Evaluates a clock. The hard timeout is reported in preference to
    /// inactivity when both have elapsed.
    pub fn evaluate(&self, clock: &CatchUpClock, now: Instant) -> Option<CompletionReason> {
        if now.saturating_duration_since(clock.started) >= self.catch_up_timeout {
            Some(CompletionReason::Timeout)
        } else if now.saturating_duration_since(clock.last_activity) >= self.inactivity_timeout {
            Some(CompletionReason::Inactivity)
        } else {
            None
        }
    }
}

impl Default for CompletionDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(60))
    }
}

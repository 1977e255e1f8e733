//! Phase timers measured against the monotonic clock

use std::time::{Duration, Instant};

/// An epoch from which an interval is measured and a timeout that the
/// interval should not exceed. A timeout of `None` never expires.
///
/// Timers mark the start of a phase in a child's life: the process was
/// launched, termination was requested, an I/O call began blocking. The
/// babysitter consults them with a `now` it sampled once per sweep, so `now`
/// may be slightly older than a freshly started timer's epoch; the elapsed
/// interval saturates to zero in that case.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    epoch: Instant,
    timeout: Option<Duration>,
}

impl Timer {
    /// Start a timer now
    pub fn start(timeout: Option<Duration>) -> Self {
        Self::start_at(Instant::now(), timeout)
    }

    /// Start a timer from an explicit epoch
    pub fn start_at(epoch: Instant, timeout: Option<Duration>) -> Self {
        Self { epoch, timeout }
    }

    /// True once more than the configured timeout has elapsed since the epoch
    pub fn expired(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.saturating_duration_since(self.epoch) > timeout,
            None => false,
        }
    }
}

//! Reconnect delay schedule.

use std::time::Duration;

/// Exponential backoff with a cap and no retry limit.
///
/// The first delay is `initial`; each following delay doubles until it
/// reaches `max`. A session that completes its handshake calls
/// [`reset`](Backoff::reset) so the next outage starts over at `initial`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial.min(max),
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial.min(self.max);
    }
}

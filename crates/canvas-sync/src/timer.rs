//! Cancellable coalescing timer
//!
//! A timer is just an optional deadline. Whoever owns it decides when to
//! poll it against the clock, so tests can drive it with a paused tokio
//! clock instead of real sleeps.

use std::time::Duration;
use tokio::time::Instant;

/// Restartable single-shot deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescingTimer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl CoalescingTimer {
    /// Disarmed timer with the given quiet period
    #[inline]
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    /// (Re)start the countdown from `now`
    #[inline]
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    /// Make the timer due at `now`, skipping the quiet period
    #[inline]
    pub fn fire_now(&mut self, now: Instant) {
        self.deadline = Some(now);
    }

    /// Drop the pending deadline
    #[inline]
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[inline]
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Pending deadline, if armed
    #[inline]
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check if the deadline has passed without consuming it
    #[inline]
    #[must_use]
    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Consume the deadline if it has passed
    pub fn take_if_due(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.deadline = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rearm_pushes_deadline_out() {
        let mut timer = CoalescingTimer::new(Duration::from_millis(2000));
        let start = Instant::now();
        timer.arm(start);

        tokio::time::advance(Duration::from_millis(1500)).await;
        timer.arm(Instant::now());
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!timer.take_if_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(timer.take_if_due(Instant::now()));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_fire_now() {
        let mut timer = CoalescingTimer::new(Duration::from_secs(2));
        let now = Instant::now();
        timer.arm(now);
        timer.cancel();
        assert!(!timer.is_due(now + Duration::from_secs(5)));

        timer.fire_now(now);
        assert!(timer.take_if_due(now));
        assert!(!timer.take_if_due(now));
    }
}

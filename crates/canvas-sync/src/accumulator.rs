//! Pending-Mutation Accumulator
//!
//! Collects canvas attribute edits into one patch. A record overwrites any
//! earlier pending value for the same attribute and restarts the shared
//! timer. Taking the batch captures and clears the pending set in one step;
//! while that batch is in flight, new records start a fresh set that is
//! never merged into the request already sent.

use crate::timer::CoalescingTimer;
use canvas_model::{DocumentField, DocumentPatch, FieldValue};
use std::time::Duration;
use tokio::time::Instant;

/// Result of asking the accumulator for a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Take {
    /// Captured patch; the accumulator is now in flight
    Ready(DocumentPatch),
    /// A previous batch is still in flight
    Busy,
    /// Nothing due or nothing pending
    Empty,
}

/// Batched canvas attribute edits with a single coalescing timer
#[derive(Debug, Clone)]
pub struct PendingMutations {
    pending: DocumentPatch,
    timer: CoalescingTimer,
    in_flight: bool,
}

impl PendingMutations {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            pending: DocumentPatch::new(),
            timer: CoalescingTimer::new(debounce),
            in_flight: false,
        }
    }

    /// Merge a value into the pending set and restart the timer
    pub fn record(&mut self, field: DocumentField, value: FieldValue, now: Instant) {
        self.pending.insert(field, value);
        self.timer.arm(now);
    }

    /// Merge a value and make the batch due at once
    pub fn record_immediate(&mut self, field: DocumentField, value: FieldValue, now: Instant) {
        self.pending.insert(field, value);
        self.timer.fire_now(now);
    }

    /// Capture the pending set if its timer has fired
    pub fn take_due(&mut self, now: Instant) -> Take {
        if self.in_flight {
            return if self.timer.is_due(now) { Take::Busy } else { Take::Empty };
        }
        if !self.timer.take_if_due(now) {
            return Take::Empty;
        }
        self.capture()
    }

    /// Capture the pending set regardless of the timer
    pub fn take_now(&mut self) -> Take {
        if self.in_flight {
            return if self.pending.is_empty() { Take::Empty } else { Take::Busy };
        }
        self.timer.cancel();
        self.capture()
    }

    fn capture(&mut self) -> Take {
        if self.pending.is_empty() {
            return Take::Empty;
        }
        self.in_flight = true;
        Take::Ready(std::mem::take(&mut self.pending))
    }

    /// Mark the in-flight batch as finished
    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    /// Drop everything, including the in-flight marker
    pub fn clear(&mut self) {
        self.pending = DocumentPatch::new();
        self.timer.cancel();
        self.in_flight = false;
    }

    #[inline]
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Values recorded since the last capture
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &DocumentPatch {
        &self.pending
    }

    /// Deadline the scheduler should wake for; none while a batch is in flight
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        if self.in_flight {
            None
        } else {
            self.timer.deadline()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_model::LifecycleLane;
    use pretty_assertions::assert_eq;

    const DEBOUNCE: Duration = Duration::from_millis(2000);

    #[tokio::test(start_paused = true)]
    async fn last_write_wins_within_window() {
        let mut acc = PendingMutations::new(DEBOUNCE);
        acc.record(DocumentField::PrimaryFocus, FieldValue::text("a"), Instant::now());
        tokio::time::advance(Duration::from_millis(500)).await;
        acc.record(DocumentField::PrimaryFocus, FieldValue::text("ab"), Instant::now());
        acc.record(
            DocumentField::LifecycleLane,
            FieldValue::Lane(LifecycleLane::Milk),
            Instant::now(),
        );

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert_eq!(acc.take_due(Instant::now()), Take::Empty);
        tokio::time::advance(Duration::from_millis(1)).await;

        let Take::Ready(patch) = acc.take_due(Instant::now()) else {
            panic!("batch should be due");
        };
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.get(DocumentField::PrimaryFocus), Some(&FieldValue::text("ab")));
        assert!(acc.pending().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn records_during_flight_start_fresh_batch() {
        let mut acc = PendingMutations::new(DEBOUNCE);
        acc.record(DocumentField::ProductName, FieldValue::text("one"), Instant::now());
        let Take::Ready(first) = acc.take_now() else {
            panic!("batch should be ready");
        };

        acc.record(DocumentField::ProductName, FieldValue::text("two"), Instant::now());
        assert_eq!(first.get(DocumentField::ProductName), Some(&FieldValue::text("one")));
        assert!(acc.deadline().is_none());

        tokio::time::advance(DEBOUNCE).await;
        assert_eq!(acc.take_due(Instant::now()), Take::Busy);
        assert_eq!(acc.take_now(), Take::Busy);

        acc.finish();
        assert!(acc.deadline().is_some());
        let Take::Ready(second) = acc.take_due(Instant::now()) else {
            panic!("fresh batch should be due");
        };
        assert_eq!(second.get(DocumentField::ProductName), Some(&FieldValue::text("two")));
    }

    #[test]
    fn take_now_on_empty_is_empty() {
        let mut acc = PendingMutations::new(DEBOUNCE);
        assert_eq!(acc.take_now(), Take::Empty);
        assert!(!acc.is_in_flight());
    }

    #[test]
    fn record_immediate_is_due_now() {
        let mut acc = PendingMutations::new(DEBOUNCE);
        let now = Instant::now();
        acc.record_immediate(DocumentField::PortfolioNotes, FieldValue::text("n"), now);
        assert!(matches!(acc.take_due(now), Take::Ready(_)));
    }
}

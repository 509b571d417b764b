//! Tagged results of engine calls

use crate::error::SyncError;
use canvas_model::FieldPath;

/// Result of a mutation call
///
/// `Applied` means the change is persisted (or nothing needed persisting),
/// `Queued` means it is applied locally and a timer will persist it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T = ()> {
    Applied(T),
    Queued,
    Failed(SyncError),
}

impl<T> Outcome<T> {
    /// The applied value, if any
    #[inline]
    pub fn applied(self) -> Option<T> {
        match self {
            Outcome::Applied(value) => Some(value),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied(_))
    }

    #[inline]
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Outcome::Queued)
    }

    #[inline]
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }

    /// Borrow the failure, if any
    #[inline]
    #[must_use]
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            Outcome::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Convert to a `Result`; `Queued` becomes `Ok(None)`
    ///
    /// # Errors
    /// The wrapped [`SyncError`] for `Failed`.
    pub fn into_result(self) -> Result<Option<T>, SyncError> {
        match self {
            Outcome::Applied(value) => Ok(Some(value)),
            Outcome::Queued => Ok(None),
            Outcome::Failed(err) => Err(err),
        }
    }

    /// Map the applied value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Applied(value) => Outcome::Applied(f(value)),
            Outcome::Queued => Outcome::Queued,
            Outcome::Failed(err) => Outcome::Failed(err),
        }
    }
}

impl<T> From<Result<T, SyncError>> for Outcome<T> {
    fn from(result: Result<T, SyncError>) -> Self {
        match result {
            Ok(value) => Outcome::Applied(value),
            Err(err) => Outcome::Failed(err),
        }
    }
}

/// What one scheduler pass persisted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Fields saved successfully
    pub saved: Vec<FieldPath>,
    /// Fields whose save failed
    pub failed: Vec<FieldPath>,
    /// Attributes sent in the document batch, zero if no batch was sent
    pub batch_attributes: usize,
    /// The document batch failed and a reload was triggered
    pub batch_failed: bool,
    /// Fields that left the saved display window
    pub expired: usize,
}

impl FlushReport {
    /// Gateway calls made during the pass
    #[must_use]
    pub fn calls(&self) -> usize {
        self.saved.len() + self.failed.len() + usize::from(self.batch_attributes > 0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls() == 0 && self.expired == 0
    }

    pub(crate) fn merge(&mut self, other: FlushReport) {
        self.saved.extend(other.saved);
        self.failed.extend(other.failed);
        self.batch_attributes += other.batch_attributes;
        self.batch_failed |= other.batch_failed;
        self.expired += other.expired;
    }
}

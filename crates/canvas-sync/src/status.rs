//! Observable sync status
//!
//! Published through a `tokio::sync::watch` channel so presentation code can
//! render "Saving…" / "Last saved: …" and per-field indicators.

use crate::session::SaveStatus;
use canvas_model::FieldPath;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Snapshot of engine status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// A load or reload is in progress
    pub loading: bool,
    /// Any persistence call is outstanding
    pub saving: bool,
    /// Last time the gateway acknowledged a write
    pub last_persisted_at: Option<DateTime<Utc>>,
    /// Save status of every field with an open session
    pub fields: BTreeMap<FieldPath, SaveStatus>,
    /// Most recent failure, rendered for display
    pub last_error: Option<String>,
}

impl SyncStatus {
    /// Save status of a field; fields without a session are idle
    #[must_use]
    pub fn field(&self, path: &FieldPath) -> SaveStatus {
        self.fields.get(path).copied().unwrap_or_default()
    }

    /// Check if any field is showing an error
    #[must_use]
    pub fn has_field_errors(&self) -> bool {
        self.fields.values().any(|s| *s == SaveStatus::Error)
    }
}

/// Sending half of the status channel
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<SyncStatus>,
}

impl StatusPublisher {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    /// New receiver starting at the current status
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Publish `status`, waking receivers only if it changed
    pub fn publish(&self, status: SyncStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Current status
    #[must_use]
    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_model::DocumentField;

    #[tokio::test]
    async fn publish_only_wakes_on_change() {
        let publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();
        rx.mark_unchanged();

        publisher.publish(SyncStatus::default());
        assert!(!rx.has_changed().unwrap());

        let path = FieldPath::document(DocumentField::ProductName);
        let mut status = SyncStatus::default();
        status.fields.insert(path, SaveStatus::Error);
        publisher.publish(status);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().field(&path), SaveStatus::Error);
        assert!(publisher.current().has_field_errors());
    }
}

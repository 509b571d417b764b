//! Reconciliation Policy
//!
//! Two tiers:
//! - Field saves fail onto their edit session. The store keeps the local
//!   value and the user retries.
//! - Structural mutations and the canvas attribute batch fail into a reload.
//!   The reload waits until no structural call is outstanding, then
//!   replaces the tree with server truth and re-applies local intent that
//!   has not been persisted yet.

use crate::error::{GatewayError, MutationKind, SyncError, UploadError};
use crate::session::FieldSession;
use crate::store::{Change, DocumentStore};
use canvas_model::{DocumentPatch, FieldPath};
use std::collections::BTreeMap;

/// What the engine does after a failed persistence call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Put the field session into `error`; keep the local value
    ReportOnField,
    /// Replace the store with server truth
    Reload,
    /// Nothing was applied locally; just report
    ReportOnly,
}

impl Recovery {
    /// Recovery tier for a mutation kind
    #[must_use]
    pub fn for_kind(kind: MutationKind) -> Self {
        match kind {
            MutationKind::FieldSave => Recovery::ReportOnField,
            MutationKind::UploadAttachment => Recovery::ReportOnly,
            MutationKind::DocumentBatch
            | MutationKind::AddSection
            | MutationKind::RemoveSection
            | MutationKind::ReorderSections
            | MutationKind::AddItem
            | MutationKind::RemoveItem
            | MutationKind::RemoveAttachment => Recovery::Reload,
        }
    }
}

/// Wrap a gateway failure in the engine error for its tier
#[must_use]
pub fn classify(kind: MutationKind, path: Option<FieldPath>, source: GatewayError) -> SyncError {
    match (Recovery::for_kind(kind), path) {
        (Recovery::ReportOnField, Some(path)) => SyncError::FieldSave { path, source },
        (Recovery::ReportOnly, _) => SyncError::Upload(UploadError::Gateway(source)),
        _ => SyncError::StructuralSave { op: kind, source },
    }
}

/// Tracks outstanding structural calls and a pending reload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadGate {
    outstanding: usize,
    required: bool,
}

impl ReloadGate {
    /// A structural mutation was applied locally and its call is queued
    pub fn begin(&mut self) {
        self.outstanding += 1;
    }

    /// The call finished; `failed` marks the store as divergent
    pub fn end(&mut self, failed: bool) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if failed {
            self.required = true;
        }
    }

    /// Mark the store as divergent without an outstanding call
    pub fn require(&mut self) {
        self.required = true;
    }

    /// Reload is needed and nothing structural is outstanding
    #[inline]
    #[must_use]
    pub fn should_reload(&self) -> bool {
        self.required && self.outstanding == 0
    }

    #[inline]
    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Structural calls not yet finished
    #[inline]
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Server truth installed
    pub fn settle(&mut self) {
        self.required = false;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Re-apply unpersisted intent on top of a freshly installed tree
///
/// Sessions whose entity no longer exists are dropped. Returns the number
/// of fields written back.
pub fn reapply_local_intent(
    store: &mut DocumentStore,
    pending: &DocumentPatch,
    sessions: &mut BTreeMap<FieldPath, FieldSession>,
) -> usize {
    let mut written = 0;

    for (field, value) in pending.iter() {
        let change = Change::SetField {
            path: FieldPath::document(field),
            value: value.clone(),
        };
        if store.mutate(change).is_ok() {
            written += 1;
        }
    }

    sessions.retain(|path, session| {
        let Ok(server) = store.read(path) else {
            tracing::debug!(path = %path, "dropping session for removed entity");
            return false;
        };
        session.rebase(server);
        if session.holds_local_intent() {
            let change = Change::SetField {
                path: *path,
                value: session.buffer().clone(),
            };
            if store.mutate(change).is_ok() {
                written += 1;
            }
        }
        true
    });

    written
}

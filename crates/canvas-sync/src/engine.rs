//! Sync engine facade
//!
//! Owns one document session: the optimistic store, the field edit
//! sessions, the canvas attribute batch and the reload gate. Every local
//! mutation happens synchronously under a `parking_lot` lock that is never
//! held across an `.await`; gateway calls only see values captured while the
//! lock was held.
//!
//! # Scheduling
//!
//! Timers are deadlines, not tasks. A host either calls [`SyncEngine::run_due`]
//! itself or spawns [`SyncEngine::drive`], which sleeps until the next
//! deadline or until an edit wakes it.
//!
//! # Structural lane
//!
//! Add/remove/reorder calls (and uploads) go through one async lane per
//! document, so they reach the server in the order they were applied
//! locally. A reload after a failure runs only once that lane is drained.
//! A `load` waits for the call already on the wire; calls still queued
//! behind it are dropped unsent.

use crate::accumulator::{PendingMutations, Take};
use crate::config::SyncConfig;
use crate::error::{GatewayError, MutationKind, SyncError, UploadError};
use crate::gateway::{AttachmentUpload, DocumentGateway, ItemDraft, SectionDraft};
use crate::outcome::{FlushReport, Outcome};
use crate::reconcile::{self, Recovery, ReloadGate};
use crate::session::{Completion, FieldSession, FieldState, SaveStatus, SaveTicket, SessionError};
use crate::status::{StatusPublisher, SyncStatus};
use crate::store::{Change, DocumentStore};
use canvas_model::{
    Attachment, AttachmentId, Document, DocumentField, DocumentId, DocumentPatch, FieldPath,
    FieldValue, Item, ItemField, ItemId, ItemPatch, ModelError, Section, SectionField, SectionId,
    SectionPatch, TestingTarget,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Mutable engine state; only touched under the engine lock
#[derive(Debug)]
struct Inner {
    store: DocumentStore,
    sessions: BTreeMap<FieldPath, FieldSession>,
    batch: PendingMutations,
    gate: ReloadGate,
    /// Bumped by every load; results from an older epoch are discarded
    epoch: u64,
    /// Last session generation handed out
    generations: u64,
    document: Option<DocumentId>,
    loading: bool,
    last_persisted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Inner {
    fn status(&self) -> SyncStatus {
        let field_saving = self
            .sessions
            .values()
            .any(|s| s.state() == FieldState::Saving);
        SyncStatus {
            loading: self.loading,
            saving: field_saving || self.batch.is_in_flight() || self.gate.outstanding() > 0,
            last_persisted_at: self.last_persisted_at,
            fields: self
                .sessions
                .iter()
                .map(|(path, session)| (*path, session.status()))
                .collect(),
            last_error: self.last_error.clone(),
        }
    }

    fn persisted(&mut self) {
        self.last_persisted_at = Some(Utc::now());
    }

    fn failed(&mut self, err: &SyncError) {
        self.last_error = Some(err.to_string());
    }

    /// Drop sessions matching `pred` without touching the store
    fn drop_sessions(&mut self, pred: impl Fn(&FieldPath) -> bool) {
        self.sessions.retain(|path, _| !pred(path));
    }
}

/// Values captured for one scheduler pass
#[derive(Debug, Clone, Copy)]
struct Dispatch {
    document: DocumentId,
    epoch: u64,
}

/// A structural mutation applied locally and waiting for its gateway call
#[derive(Debug, Clone, Copy)]
struct Structural {
    kind: MutationKind,
    document: DocumentId,
    epoch: u64,
}

/// Optimistic sync engine for one canvas document
pub struct SyncEngine<G: DocumentGateway> {
    gateway: Arc<G>,
    config: SyncConfig,
    inner: Mutex<Inner>,
    lane: tokio::sync::Mutex<()>,
    status: StatusPublisher,
    wake: Notify,
    batch_done: Notify,
}

impl<G: DocumentGateway> std::fmt::Debug for SyncEngine<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .field("inner", &*self.inner.lock())
            .finish_non_exhaustive()
    }
}

impl<G: DocumentGateway> SyncEngine<G> {
    /// Create an engine with no document loaded
    ///
    /// # Errors
    /// [`SyncError::Config`] if the configuration is invalid.
    pub fn new(gateway: Arc<G>, config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let inner = Inner {
            store: DocumentStore::new(),
            sessions: BTreeMap::new(),
            batch: PendingMutations::new(config.batch_debounce()),
            gate: ReloadGate::default(),
            epoch: 0,
            generations: 0,
            document: None,
            loading: false,
            last_persisted_at: None,
            last_error: None,
        };
        Ok(Self {
            gateway,
            config,
            inner: Mutex::new(inner),
            lane: tokio::sync::Mutex::new(()),
            status: StatusPublisher::new(),
            wake: Notify::new(),
            batch_done: Notify::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn gateway(&self) -> &Arc<G> {
        &self.gateway
    }

    /// Current document snapshot
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<Document>> {
        self.inner.lock().store.snapshot()
    }

    /// Status stream
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    /// Save status of one field
    #[must_use]
    pub fn field_status(&self, path: &FieldPath) -> SaveStatus {
        self.inner
            .lock()
            .sessions
            .get(path)
            .map(FieldSession::status)
            .unwrap_or_default()
    }

    /// State of a field's edit session, if one is open
    #[must_use]
    pub fn session_state(&self, path: &FieldPath) -> Option<FieldState> {
        self.inner.lock().sessions.get(path).map(FieldSession::state)
    }

    /// Canvas attributes recorded but not yet sent
    #[must_use]
    pub fn pending_attributes(&self) -> DocumentPatch {
        self.inner.lock().batch.pending().clone()
    }

    fn publish(&self) {
        let status = self.inner.lock().status();
        self.status.publish(status);
    }

    fn open_session(&self, path: FieldPath, persisted: FieldValue) -> FieldSession {
        FieldSession::open(
            path,
            persisted,
            self.config.field_debounce(),
            self.config.saved_display(),
        )
    }

    fn ensure_session<'a>(
        &self,
        inner: &'a mut Inner,
        path: FieldPath,
    ) -> Result<&'a mut FieldSession, SyncError> {
        match inner.sessions.entry(path) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let persisted = inner.store.read(&path)?;
                inner.generations += 1;
                let session = self
                    .open_session(path, persisted)
                    .with_generation(inner.generations);
                Ok(entry.insert(session))
            }
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Fetch and install a document, replacing all prior state
    ///
    /// Sessions, the pending batch and every timer are discarded. Results of
    /// calls issued before the load are ignored when they complete. The fetch
    /// waits for a structural call already on the wire; queued ones are
    /// dropped unsent.
    ///
    /// # Errors
    /// [`SyncError::Load`] if the fetch fails; the store is left empty.
    pub async fn load(&self, id: DocumentId) -> Result<Arc<Document>, SyncError> {
        let epoch = {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            inner.store.clear();
            inner.sessions.clear();
            inner.batch.clear();
            inner.gate.reset();
            inner.document = Some(id);
            inner.loading = true;
            inner.last_error = None;
            inner.epoch
        };
        self.batch_done.notify_waiters();
        self.publish();
        tracing::info!(document = %id, "loading document");

        let _lane = self.lane.lock().await;
        if self.inner.lock().epoch != epoch {
            return Err(SyncError::Superseded);
        }
        let result = self.gateway.fetch_document(id).await;

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return Err(SyncError::Superseded);
            }
            inner.loading = false;
            match result {
                Ok(document) => Ok(inner.store.install(document)),
                Err(e) => {
                    let err = SyncError::Load(e);
                    inner.failed(&err);
                    Err(err)
                }
            }
        };

        match &outcome {
            Ok(document) => tracing::info!(
                document = %id,
                sections = document.sections.len(),
                "document loaded"
            ),
            Err(e) => tracing::warn!(document = %id, error = %e, "document load failed"),
        }
        self.publish();
        self.wake.notify_one();
        outcome
    }

    /// Load the current document again, discarding local state
    ///
    /// # Errors
    /// [`SyncError::NotLoaded`] if no load was ever requested, otherwise as [`Self::load`].
    pub async fn reload(&self) -> Result<Arc<Document>, SyncError> {
        let id = self.inner.lock().document.ok_or(SyncError::NotLoaded)?;
        self.load(id).await
    }

    // ------------------------------------------------------------------
    // Field edits
    // ------------------------------------------------------------------

    /// Apply a field edit locally and schedule its persistence
    ///
    /// Canvas attributes go to the batched accumulator; section and item
    /// fields go to an implicit edit session. Invalid values are rejected
    /// without touching the store.
    pub fn mutate_field(&self, path: FieldPath, value: FieldValue) -> Outcome {
        match path {
            FieldPath::Document { field } => self.record_attribute(field, value),
            _ => self.edit_field(path, value, true),
        }
    }

    /// Record what the canvas is currently testing
    pub fn set_currently_testing(&self, target: Option<TestingTarget>) -> Outcome {
        let exists = {
            let inner = self.inner.lock();
            match (inner.store.document(), target) {
                (Err(e), _) => return Outcome::Failed(e),
                (Ok(_), None) => Ok(()),
                (Ok(doc), Some(TestingTarget::Section(id))) => doc
                    .section(id)
                    .map(|_| ())
                    .ok_or_else(|| ModelError::not_found("section", id)),
                (Ok(doc), Some(TestingTarget::Item(id))) => doc
                    .item(id)
                    .map(|_| ())
                    .ok_or_else(|| ModelError::not_found("item", id)),
            }
        };
        if let Err(e) = exists {
            return Outcome::Failed(e.into());
        }
        let value = target.map_or(FieldValue::Empty, FieldValue::Testing);
        self.record_attribute(DocumentField::CurrentlyTesting, value)
    }

    fn record_attribute(&self, field: DocumentField, value: FieldValue) -> Outcome {
        let path = FieldPath::document(field);
        let now = Instant::now();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            path.check(value)
                .map_err(SyncError::from)
                .and_then(|value| {
                    inner.store.mutate(Change::SetField {
                        path,
                        value: value.clone(),
                    })?;
                    if self.config.auto_save {
                        inner.batch.record(field, value, now);
                    } else {
                        inner.batch.record_immediate(field, value, now);
                    }
                    Ok(())
                })
        };
        match result {
            Ok(()) => {
                tracing::debug!(path = %path, "attribute recorded");
                self.publish();
                self.wake.notify_one();
                Outcome::Queued
            }
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "attribute rejected");
                Outcome::Failed(e)
            }
        }
    }

    fn edit_field(&self, path: FieldPath, value: FieldValue, open: bool) -> Outcome {
        let now = Instant::now();
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.apply_input(inner, path, value, now, open)
        };
        match result {
            Ok(()) => {
                tracing::debug!(path = %path, "field edited");
                self.publish();
                self.wake.notify_one();
                Outcome::Queued
            }
            Err(e) => Outcome::Failed(e),
        }
    }

    fn apply_input(
        &self,
        inner: &mut Inner,
        path: FieldPath,
        value: FieldValue,
        now: Instant,
        open: bool,
    ) -> Result<(), SyncError> {
        let value = path.check(value)?;
        let session = if open {
            self.ensure_session(inner, path)?
        } else {
            inner
                .sessions
                .get_mut(&path)
                .ok_or(SessionError::NotEditing(path))?
        };
        let focused = session.is_focused();
        session.input(value.clone(), now)?;
        if open && !focused {
            // Programmatic edit: no focus to keep
            session.end();
        }
        inner.store.mutate(Change::SetField { path, value })?;
        Ok(())
    }

    /// Focus a field, opening its edit session
    pub fn begin_edit(&self, path: FieldPath) -> Outcome {
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            self.ensure_session(inner, path)
                .and_then(|session| session.begin().map_err(SyncError::from))
        };
        self.publish();
        result.into()
    }

    /// Keystroke on a focused field
    pub fn input(&self, path: FieldPath, value: FieldValue) -> Outcome {
        self.edit_field(path, value, false)
    }

    /// Escape: restore the last persisted value; no network call
    pub fn cancel_edit(&self, path: FieldPath) -> Outcome {
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.sessions.get_mut(&path) {
                None => Err(SyncError::from(SessionError::NotEditing(path))),
                Some(session) => match session.cancel() {
                    Err(e) => Err(e.into()),
                    Ok(restored) => {
                        if session.is_finished() {
                            inner.sessions.remove(&path);
                        }
                        inner
                            .store
                            .mutate(Change::SetField { path, value: restored })
                            .map(|_| ())
                    }
                },
            }
        };
        if result.is_ok() {
            tracing::debug!(path = %path, "edit cancelled");
        }
        self.publish();
        result.into()
    }

    /// Single-key commit (Enter): save now, skipping the debounce
    pub async fn commit(&self, path: FieldPath) -> Outcome {
        self.end_edit(path, "commit").await
    }

    /// Focus lost: save now if the buffer differs from the persisted value
    pub async fn blur(&self, path: FieldPath) -> Outcome {
        self.end_edit(path, "blur").await
    }

    async fn end_edit(&self, path: FieldPath, gesture: &'static str) -> Outcome {
        let mut deferred = false;
        let dispatch = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let ctx = Dispatch {
                document: match inner.store.document_id() {
                    Ok(id) => id,
                    Err(e) => return Outcome::Failed(e),
                },
                epoch: inner.epoch,
            };
            let Some(session) = inner.sessions.get_mut(&path) else {
                return Outcome::Applied(());
            };
            let ticket = if session.state() == FieldState::Editing && session.is_dirty() {
                match session.request_save() {
                    Ok(ticket) => {
                        deferred = ticket.is_none();
                        ticket
                    }
                    Err(e) => return Outcome::Failed(e.into()),
                }
            } else {
                None
            };
            session.end();
            if session.is_finished() {
                inner.sessions.remove(&path);
            }
            ticket.map(|ticket| (ctx, ticket))
        };
        self.publish();

        match dispatch {
            Some((ctx, ticket)) => {
                tracing::debug!(path = %path, gesture, "immediate field save");
                self.run_field_save(ctx, ticket).await
            }
            None if deferred => {
                tracing::debug!(path = %path, gesture, "save queued behind in-flight save");
                Outcome::Queued
            }
            None => Outcome::Applied(()),
        }
    }

    /// Resubmit the buffered value of a field in `error`
    pub async fn retry(&self, path: FieldPath) -> Outcome {
        let dispatch = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let document = match inner.store.document_id() {
                Ok(id) => id,
                Err(e) => return Outcome::Failed(e),
            };
            let epoch = inner.epoch;
            let Some(session) = inner.sessions.get_mut(&path) else {
                return Outcome::Failed(SessionError::NotEditing(path).into());
            };
            if session.state() != FieldState::Error {
                return Outcome::Failed(SyncError::illegal(
                    path,
                    session.state(),
                    FieldState::Saving,
                ));
            }
            match session.start_save() {
                Ok(ticket) => (Dispatch { document, epoch }, ticket),
                Err(e) => return Outcome::Failed(e.into()),
            }
        };
        let (ctx, ticket) = dispatch;
        self.publish();
        tracing::info!(path = %path, "retrying field save");
        self.run_field_save(ctx, ticket).await
    }

    /// Navigate away from a field
    ///
    /// A not-yet-due debounce is abandoned and the store shows the last
    /// persisted value again. A save already in flight runs to completion;
    /// the session stays open until then so focusing the field again resumes it.
    pub fn dispose(&self, path: FieldPath) -> Outcome {
        let result = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            match inner.sessions.get_mut(&path) {
                None => Ok(()),
                Some(session) => {
                    let unsent = session.holds_local_intent() && !session.is_in_flight();
                    let shown = session.dispose();
                    if session.is_finished() {
                        inner.sessions.remove(&path);
                    }
                    if unsent {
                        tracing::debug!(path = %path, "abandoning unsaved edit");
                    }
                    if inner.store.read(&path).is_ok_and(|current| current == shown) {
                        Ok(())
                    } else {
                        inner
                            .store
                            .mutate(Change::SetField { path, value: shown })
                            .map(|_| ())
                    }
                }
            }
        };
        self.publish();
        result.into()
    }

    async fn persist_field(&self, document: DocumentId, ticket: &SaveTicket) -> Result<(), GatewayError> {
        let value = ticket.value.clone();
        match ticket.path {
            FieldPath::Document { field } => {
                self.gateway
                    .patch_document(document, DocumentPatch::single(field, value))
                    .await
            }
            FieldPath::Section { id, field } => {
                self.gateway
                    .update_section(id, SectionPatch::single(field, value))
                    .await
            }
            FieldPath::Item { id, field } => {
                self.gateway
                    .update_item(id, ItemPatch::single(field, value))
                    .await
            }
        }
    }

    /// Send `ticket`, then any follow-up requested while it was in flight
    async fn run_field_save(&self, ctx: Dispatch, ticket: SaveTicket) -> Outcome {
        let mut ticket = ticket;
        loop {
            let (outcome, next) = self.save_once(ctx, &ticket).await;
            match next {
                Some(next) => {
                    tracing::debug!(path = %next.path, "sending follow-up save");
                    ticket = next;
                }
                None => return outcome,
            }
        }
    }

    async fn save_once(&self, ctx: Dispatch, ticket: &SaveTicket) -> (Outcome, Option<SaveTicket>) {
        let path = ticket.path;
        let result = self
            .persist_field(ctx.document, ticket)
            .await
            .map_err(|e| reconcile::classify(MutationKind::FieldSave, Some(path), e));

        let (outcome, next) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.epoch != ctx.epoch {
                return (Outcome::Failed(SyncError::Superseded), None);
            }
            if result.is_ok() {
                inner.persisted();
            }
            let reported = match &result {
                Ok(()) => Outcome::Applied(()),
                Err(err) => Outcome::Failed(err.clone()),
            };
            let decided = match inner.sessions.get_mut(&path) {
                Some(session) => match session.complete(ticket, result.clone(), Instant::now()) {
                    // Issued by a session that no longer exists; the live one owns the field
                    Completion::Stale => (reported, None),
                    _ if session.is_disposed() => {
                        let shown = session.persisted().clone();
                        if session.is_finished() {
                            inner.sessions.remove(&path);
                        }
                        if let Err(e) = inner.store.mutate(Change::SetField { path, value: shown }) {
                            tracing::debug!(path = %path, error = %e, "disposed field not restored");
                        }
                        (reported, None)
                    }
                    Completion::Saved | Completion::Failed => (reported, None),
                    Completion::Superseded => (Outcome::Queued, session.take_follow_up()),
                },
                // Dropped with its entity
                None => (reported, None),
            };
            if let Outcome::Failed(err) = &decided.0 {
                inner.failed(err);
            }
            decided
        };

        match &outcome {
            Outcome::Applied(()) => tracing::debug!(path = %path, "field saved"),
            Outcome::Failed(e) => tracing::warn!(path = %path, error = %e, "field save failed"),
            Outcome::Queued => tracing::debug!(path = %path, "field save superseded by newer edit"),
        }
        self.publish();
        self.wake.notify_one();
        (outcome, next)
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Earliest timer deadline across sessions and the batch
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .sessions
            .values()
            .filter_map(FieldSession::deadline)
            .chain(inner.batch.deadline())
            .min()
    }

    /// Perform whatever timers are due now
    pub async fn run_due(&self) -> FlushReport {
        let now = Instant::now();
        let (ctx, saves, batch, expired) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Ok(document) = inner.store.document_id() else {
                return FlushReport::default();
            };
            let mut expired = 0;
            let mut saves = Vec::new();
            for session in inner.sessions.values_mut() {
                if session.expire(now) {
                    expired += 1;
                } else if session.take_due(now) {
                    if let Ok(ticket) = session.start_save() {
                        saves.push(ticket);
                    }
                }
            }
            inner.sessions.retain(|_, s| !s.is_finished());
            let batch = match inner.batch.take_due(now) {
                Take::Ready(patch) => Some(patch),
                Take::Busy | Take::Empty => None,
            };
            let ctx = Dispatch {
                document,
                epoch: inner.epoch,
            };
            (ctx, saves, batch, expired)
        };
        self.publish();

        let mut report = self.dispatch(ctx, saves, batch).await;
        report.expired += expired;
        report
    }

    /// Persist every pending field and the batch now, awaiting the results
    ///
    /// If a batch is already in flight, waits for it and then sends
    /// whatever was recorded since. A field whose previous save is still on
    /// the wire is sent by that save's caller once it returns.
    pub async fn flush_now(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            let batch_done = self.batch_done.notified();
            let (ctx, saves, take) = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                let Ok(document) = inner.store.document_id() else {
                    return report;
                };
                let saves: Vec<SaveTicket> = inner
                    .sessions
                    .values_mut()
                    .filter(|s| s.state() == FieldState::Editing && s.is_dirty())
                    .filter_map(|s| s.request_save().ok().flatten())
                    .collect();
                let ctx = Dispatch {
                    document,
                    epoch: inner.epoch,
                };
                (ctx, saves, inner.batch.take_now())
            };
            self.publish();
            tracing::debug!(fields = saves.len(), "manual flush");

            let (batch, busy) = match take {
                Take::Ready(patch) => (Some(patch), false),
                Take::Busy => (None, true),
                Take::Empty => (None, false),
            };
            report.merge(self.dispatch(ctx, saves, batch).await);
            if !busy {
                return report;
            }
            batch_done.await;
        }
    }

    async fn dispatch(
        &self,
        ctx: Dispatch,
        saves: Vec<SaveTicket>,
        batch: Option<DocumentPatch>,
    ) -> FlushReport {
        let fields = join_all(saves.into_iter().map(|ticket| async move {
            let path = ticket.path;
            (path, self.run_field_save(ctx, ticket).await)
        }));
        let batch = async move {
            match batch {
                Some(patch) => {
                    let attributes = patch.len();
                    Some((attributes, self.run_batch(ctx, patch).await))
                }
                None => None,
            }
        };
        let (fields, batch) = futures::future::join(fields, batch).await;

        let mut report = FlushReport::default();
        for (path, outcome) in fields {
            if outcome.is_failed() {
                report.failed.push(path);
            } else {
                report.saved.push(path);
            }
        }
        if let Some((attributes, result)) = batch {
            report.batch_attributes = attributes;
            report.batch_failed = result.is_err();
        }
        report
    }

    async fn run_batch(&self, ctx: Dispatch, patch: DocumentPatch) -> Result<(), SyncError> {
        tracing::debug!(document = %ctx.document, attributes = patch.len(), "flushing document batch");
        let result = self.gateway.patch_document(ctx.document, patch).await;

        let reload = {
            let mut inner = self.inner.lock();
            if inner.epoch != ctx.epoch {
                return Err(SyncError::Superseded);
            }
            inner.batch.finish();
            match &result {
                Ok(()) => {
                    inner.persisted();
                    false
                }
                Err(e) => {
                    let kind = MutationKind::DocumentBatch;
                    let err = reconcile::classify(kind, None, e.clone());
                    tracing::warn!(document = %ctx.document, error = %err, "document batch failed");
                    inner.failed(&err);
                    if Recovery::for_kind(kind) == Recovery::Reload {
                        inner.gate.require();
                    }
                    inner.gate.should_reload()
                }
            }
        };
        self.batch_done.notify_waiters();
        self.wake.notify_one();
        self.publish();

        if reload {
            self.reconcile().await;
        }
        result.map_err(|e| reconcile::classify(MutationKind::DocumentBatch, None, e))
    }

    /// Run the scheduler until the engine is dropped
    ///
    /// Sleeps until the next deadline or until an edit wakes it, then runs
    /// [`Self::run_due`].
    pub async fn drive(&self) {
        loop {
            let woken = self.wake.notified();
            match self.next_deadline() {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = woken => {}
                    }
                }
                None => woken.await,
            }
            self.run_due().await;
        }
    }

    // ------------------------------------------------------------------
    // Structural operations
    // ------------------------------------------------------------------

    fn begin_structural<R>(
        &self,
        kind: MutationKind,
        apply: impl FnOnce(&mut Inner) -> Result<R, SyncError>,
    ) -> Result<(Structural, R), SyncError> {
        let started = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let document = inner.store.document_id()?;
            let applied = apply(inner)?;
            inner.gate.begin();
            (
                Structural {
                    kind,
                    document,
                    epoch: inner.epoch,
                },
                applied,
            )
        };
        tracing::debug!(op = %kind, "structural change applied locally");
        self.publish();
        Ok(started)
    }

    async fn finish_structural(
        &self,
        op: Structural,
        result: Result<(), GatewayError>,
        on_success: impl FnOnce(&mut Inner),
    ) -> Result<(), SyncError> {
        let reload = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.epoch != op.epoch {
                return Err(SyncError::Superseded);
            }
            let reloads = Recovery::for_kind(op.kind) == Recovery::Reload;
            inner.gate.end(result.is_err() && reloads);
            match &result {
                Ok(()) => {
                    on_success(inner);
                    inner.persisted();
                    tracing::info!(op = %op.kind, document = %op.document, "structural change persisted");
                }
                Err(e) => {
                    let err = reconcile::classify(op.kind, None, e.clone());
                    tracing::warn!(op = %op.kind, error = %err, "structural change failed");
                    inner.failed(&err);
                }
            }
            inner.gate.should_reload()
        };
        self.publish();

        if reload {
            self.reconcile().await;
        }
        result.map_err(|e| reconcile::classify(op.kind, None, e))
    }

    /// Send a structural call once the lane is free
    ///
    /// `None` if a load replaced the store while the call was queued; the
    /// call is then never sent.
    async fn on_lane<T, F, Fut>(
        &self,
        kind: MutationKind,
        epoch: u64,
        call: F,
    ) -> Option<Result<T, GatewayError>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let _lane = self.lane.lock().await;
        if self.inner.lock().epoch != epoch {
            tracing::debug!(op = %kind, "document reloaded while queued; dropping call");
            return None;
        }
        Some(call().await)
    }

    /// Replace the store with server truth once the lane is drained
    async fn reconcile(&self) {
        let _lane = self.lane.lock().await;
        let (document, epoch) = {
            let mut inner = self.inner.lock();
            if !inner.gate.should_reload() {
                return;
            }
            let Some(document) = inner.document else {
                return;
            };
            inner.loading = true;
            (document, inner.epoch)
        };
        self.publish();
        tracing::info!(document = %document, "reloading document after failed save");

        let result = self.gateway.fetch_document(document).await;

        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.epoch != epoch {
                return;
            }
            inner.loading = false;
            match result {
                Ok(server) if inner.gate.outstanding() == 0 => {
                    inner.store.install(server);
                    let pending = inner.batch.pending().clone();
                    let written =
                        reconcile::reapply_local_intent(&mut inner.store, &pending, &mut inner.sessions);
                    inner.gate.settle();
                    tracing::info!(document = %document, reapplied = written, "document reloaded");
                }
                Ok(_) => {
                    tracing::debug!(document = %document, "structural call queued during reload; deferring");
                }
                Err(e) => {
                    let err = SyncError::Load(e);
                    tracing::error!(document = %document, error = %err, "reload failed");
                    inner.failed(&err);
                }
            }
        }
        self.publish();
    }

    /// Append a section; returns its id once the server has stored it
    ///
    /// Fails with [`SyncError::LimitExceeded`] and no mutation or network
    /// call when the document already holds `max_sections`.
    pub async fn add_section(&self, text: impl Into<String>) -> Outcome<SectionId> {
        let text = FieldValue::text(text);
        let limit = self.config.max_sections;
        let started = self.begin_structural(MutationKind::AddSection, |inner| {
            let text = SectionField::Text
                .rule()
                .check(SectionField::Text.name(), text)?
                .into_text()
                .unwrap_or_default();
            let id = SectionId::new();
            let doc = inner.store.mutate(Change::InsertSection {
                section: Section::new(id, text),
                limit,
            })?;
            doc.section(id)
                .map(SectionDraft::from)
                .ok_or_else(|| ModelError::not_found("section", id).into())
        });
        let (op, draft) = match started {
            Ok(started) => started,
            Err(e) => {
                tracing::debug!(error = %e, "add section rejected");
                return Outcome::Failed(e);
            }
        };

        let id = draft.id;
        let call = move || self.gateway.create_section(op.document, draft);
        let Some(result) = self.on_lane(op.kind, op.epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };
        let (result, echo) = split_echo(result);
        self.finish_structural(op, result, |inner| {
            if let Some(section) = echo {
                if let Err(e) = inner.store.mutate(Change::MergeSection(section)) {
                    tracing::debug!(section = %id, error = %e, "section echo not merged");
                }
            }
        })
        .await
        .map(|()| id)
        .into()
    }

    /// Remove a section and everything beneath it
    pub async fn remove_section(&self, id: SectionId) -> Outcome {
        let started = self.begin_structural(MutationKind::RemoveSection, |inner| {
            let items: Vec<ItemId> = inner
                .store
                .document()?
                .section(id)
                .map(|s| s.items.iter().map(|i| i.id).collect())
                .unwrap_or_default();
            inner.store.mutate(Change::RemoveSection(id))?;
            inner.drop_sessions(|path| match path {
                FieldPath::Section { id: owner, .. } => *owner == id,
                FieldPath::Item { id: item, .. } => items.contains(item),
                FieldPath::Document { .. } => false,
            });
            Ok(())
        });
        let (op, ()) = match started {
            Ok(started) => started,
            Err(e) => return Outcome::Failed(e),
        };

        let call = move || self.gateway.delete_section(id);
        let Some(result) = self.on_lane(op.kind, op.epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };
        self.finish_structural(op, result, |_| {}).await.into()
    }

    /// Put sections in the given order
    ///
    /// `ordered` must name every current section exactly once.
    pub async fn reorder_sections(&self, ordered: Vec<SectionId>) -> Outcome {
        let started = self.begin_structural(MutationKind::ReorderSections, |inner| {
            let doc = inner.store.mutate(Change::ReorderSections(ordered))?;
            Ok(doc.section_orders())
        });
        let (op, orders) = match started {
            Ok(started) => started,
            Err(e) => return Outcome::Failed(e),
        };

        let call = move || self.gateway.reorder_sections(op.document, orders);
        let Some(result) = self.on_lane(op.kind, op.epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };
        self.finish_structural(op, result, |_| {}).await.into()
    }

    /// Append an item to a section
    pub async fn add_item(&self, section: SectionId, description: impl Into<String>) -> Outcome<ItemId> {
        let description = FieldValue::text(description);
        let started = self.begin_structural(MutationKind::AddItem, |inner| {
            let description = ItemField::Description
                .rule()
                .check(ItemField::Description.name(), description)?
                .into_text()
                .unwrap_or_default();
            let item = Item::new(ItemId::new(), description);
            let draft = ItemDraft::from(&item);
            inner.store.mutate(Change::InsertItem { section, item })?;
            Ok(draft)
        });
        let (op, draft) = match started {
            Ok(started) => started,
            Err(e) => return Outcome::Failed(e),
        };

        let id = draft.id;
        let call = move || self.gateway.create_item(section, draft);
        let Some(result) = self.on_lane(op.kind, op.epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };
        let (result, echo) = split_echo(result);
        self.finish_structural(op, result, |inner| {
            if let Some(item) = echo {
                if let Err(e) = inner.store.mutate(Change::MergeItem(item)) {
                    tracing::debug!(item = %id, error = %e, "item echo not merged");
                }
            }
        })
        .await
        .map(|()| id)
        .into()
    }

    /// Remove an item and its attachments
    pub async fn remove_item(&self, id: ItemId) -> Outcome {
        let started = self.begin_structural(MutationKind::RemoveItem, |inner| {
            inner.store.mutate(Change::RemoveItem(id))?;
            inner.drop_sessions(|path| matches!(path, FieldPath::Item { id: item, .. } if *item == id));
            Ok(())
        });
        let (op, ()) = match started {
            Ok(started) => started,
            Err(e) => return Outcome::Failed(e),
        };

        let call = move || self.gateway.delete_item(id);
        let Some(result) = self.on_lane(op.kind, op.epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };
        self.finish_structural(op, result, |_| {}).await.into()
    }

    fn check_upload(&self, upload: &AttachmentUpload) -> Result<(), UploadError> {
        if upload.bytes.is_empty() {
            return Err(UploadError::Empty);
        }
        if upload.size() > self.config.max_upload_bytes {
            return Err(UploadError::TooLarge {
                size: upload.size(),
                max: self.config.max_upload_bytes,
            });
        }
        if !self.config.accepts_content_type(&upload.content_type) {
            return Err(UploadError::UnsupportedType(upload.content_type.clone()));
        }
        if upload.label.as_deref().is_some_and(|l| l.trim().is_empty()) {
            return Err(UploadError::BlankLabel);
        }
        Ok(())
    }

    /// Upload a file to an item
    ///
    /// Not optimistic: the attachment appears in the store only after the
    /// server accepted it, so a failure needs no rollback.
    pub async fn upload_attachment(&self, item: ItemId, upload: AttachmentUpload) -> Outcome<Attachment> {
        if let Err(e) = self.check_upload(&upload) {
            tracing::debug!(item = %item, error = %e, "upload rejected");
            return Outcome::Failed(e.into());
        }
        let epoch = {
            let inner = self.inner.lock();
            let exists = inner
                .store
                .document()
                .and_then(|doc| doc.item(item).ok_or_else(|| ModelError::not_found("item", item).into()));
            if let Err(e) = exists {
                return Outcome::Failed(e);
            }
            inner.epoch
        };

        tracing::debug!(item = %item, filename = %upload.filename, size = upload.size(), "uploading attachment");
        let kind = MutationKind::UploadAttachment;
        let call = move || self.gateway.upload_attachment(item, upload);
        let Some(result) = self.on_lane(kind, epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return Outcome::Failed(SyncError::Superseded);
            }
            match result {
                Ok(attachment) => {
                    inner.persisted();
                    let change = Change::InsertAttachment {
                        item,
                        attachment: attachment.clone(),
                    };
                    if let Err(e) = inner.store.mutate(change) {
                        tracing::warn!(item = %item, error = %e, "uploaded attachment has no local owner");
                    }
                    Outcome::Applied(attachment)
                }
                Err(e) => {
                    let err = reconcile::classify(kind, None, e);
                    tracing::warn!(item = %item, error = %err, "upload failed");
                    inner.failed(&err);
                    Outcome::Failed(err)
                }
            }
        };
        self.publish();
        outcome
    }

    /// Delete an attachment
    pub async fn remove_attachment(&self, id: AttachmentId) -> Outcome {
        let started = self.begin_structural(MutationKind::RemoveAttachment, |inner| {
            inner.store.mutate(Change::RemoveAttachment(id))?;
            Ok(())
        });
        let (op, ()) = match started {
            Ok(started) => started,
            Err(e) => return Outcome::Failed(e),
        };

        let call = move || self.gateway.delete_attachment(id);
        let Some(result) = self.on_lane(op.kind, op.epoch, call).await else {
            return Outcome::Failed(SyncError::Superseded);
        };
        self.finish_structural(op, result, |_| {}).await.into()
    }
}

fn split_echo<T>(result: Result<T, GatewayError>) -> (Result<(), GatewayError>, Option<T>) {
    match result {
        Ok(echo) => (Ok(()), Some(echo)),
        Err(e) => (Err(e), None),
    }
}

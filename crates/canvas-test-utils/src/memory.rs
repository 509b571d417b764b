//! In-memory document gateway
//!
//! Holds server truth per document, logs every call and fails on demand.
//! Server behaviour follows the production backend where it matters to the
//! engine: deleting a section does not renumber the rest, creating a section
//! trims its text and resolves an order conflict to `max + 1`, and at most
//! [`MAX_SECTIONS`] sections are accepted.

use async_trait::async_trait;
use canvas_model::{
    Attachment, AttachmentId, Document, DocumentId, DocumentPatch, Item, ItemId, ItemPatch,
    ModelError, Section, SectionId, SectionOrder, SectionPatch, UserId, MAX_SECTIONS,
};
use canvas_sync::{AttachmentUpload, DocumentGateway, GatewayError, ItemDraft, SectionDraft};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Gateway operation, used to target failure injection and filter the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Fetch,
    PatchDocument,
    CreateSection,
    UpdateSection,
    DeleteSection,
    ReorderSections,
    CreateItem,
    UpdateItem,
    DeleteItem,
    UploadAttachment,
    DeleteAttachment,
}

/// One logged gateway call with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(DocumentId),
    PatchDocument { document: DocumentId, patch: DocumentPatch },
    CreateSection { document: DocumentId, draft: SectionDraft },
    UpdateSection { section: SectionId, patch: SectionPatch },
    DeleteSection(SectionId),
    ReorderSections { document: DocumentId, orders: Vec<SectionOrder> },
    CreateItem { section: SectionId, draft: ItemDraft },
    UpdateItem { item: ItemId, patch: ItemPatch },
    DeleteItem(ItemId),
    UploadAttachment { item: ItemId, filename: String, size: u64 },
    DeleteAttachment(AttachmentId),
}

impl Call {
    #[must_use]
    pub fn kind(&self) -> CallKind {
        match self {
            Call::Fetch(_) => CallKind::Fetch,
            Call::PatchDocument { .. } => CallKind::PatchDocument,
            Call::CreateSection { .. } => CallKind::CreateSection,
            Call::UpdateSection { .. } => CallKind::UpdateSection,
            Call::DeleteSection(_) => CallKind::DeleteSection,
            Call::ReorderSections { .. } => CallKind::ReorderSections,
            Call::CreateItem { .. } => CallKind::CreateItem,
            Call::UpdateItem { .. } => CallKind::UpdateItem,
            Call::DeleteItem(_) => CallKind::DeleteItem,
            Call::UploadAttachment { .. } => CallKind::UploadAttachment,
            Call::DeleteAttachment(_) => CallKind::DeleteAttachment,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Times(usize),
    Always,
}

#[derive(Debug, Default)]
struct Server {
    documents: HashMap<DocumentId, Document>,
    calls: Vec<Call>,
    failures: HashMap<CallKind, Failure>,
}

impl Server {
    /// Log the call and decide whether it fails
    fn admit(&mut self, call: Call) -> Result<(), GatewayError> {
        let kind = call.kind();
        tracing::trace!(?kind, "gateway call");
        self.calls.push(call);
        match self.failures.get_mut(&kind) {
            Some(Failure::Always) => Err(injected(kind)),
            Some(Failure::Times(n)) if *n > 0 => {
                *n -= 1;
                Err(injected(kind))
            }
            _ => Ok(()),
        }
    }

    fn document_mut(&mut self, id: DocumentId) -> Result<&mut Document, GatewayError> {
        self.documents
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("canvas {id}")))
    }

    fn owner_of_section(&mut self, id: SectionId) -> Result<&mut Document, GatewayError> {
        self.documents
            .values_mut()
            .find(|d| d.sections.iter().any(|s| s.id == id))
            .ok_or_else(|| GatewayError::NotFound(format!("thesis {id}")))
    }

    fn owner_of_item(&mut self, id: ItemId) -> Result<&mut Document, GatewayError> {
        self.documents
            .values_mut()
            .find(|d| d.item(id).is_some())
            .ok_or_else(|| GatewayError::NotFound(format!("proof point {id}")))
    }

    fn owner_of_attachment(&mut self, id: AttachmentId) -> Result<&mut Document, GatewayError> {
        self.documents
            .values_mut()
            .find(|d| d.attachment_owner(id).is_some())
            .ok_or_else(|| GatewayError::NotFound(format!("attachment {id}")))
    }
}

fn injected(kind: CallKind) -> GatewayError {
    GatewayError::rejected(500, format!("injected failure: {kind:?}"))
}

fn unprocessable(err: &ModelError) -> GatewayError {
    GatewayError::rejected(422, err.to_string())
}

/// Fake backend for engine tests
#[derive(Debug)]
pub struct InMemoryGateway {
    server: Mutex<Server>,
    latency: Option<Duration>,
    user: UserId,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            server: Mutex::new(Server::default()),
            latency: None,
            user: UserId::new(),
        }
    }

    /// Seed server truth
    #[must_use]
    pub fn with_document(self, document: Document) -> Self {
        self.insert(document);
        self
    }

    /// Delay every call by `latency`
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replace a document on the server
    pub fn insert(&self, document: Document) {
        self.server.lock().documents.insert(document.id, document);
    }

    /// Server copy of a document
    #[must_use]
    pub fn document(&self, id: DocumentId) -> Option<Document> {
        self.server.lock().documents.get(&id).cloned()
    }

    /// Fail the next call of `kind`
    pub fn fail_next(&self, kind: CallKind) {
        self.fail_times(kind, 1);
    }

    /// Fail the next `times` calls of `kind`
    pub fn fail_times(&self, kind: CallKind, times: usize) {
        self.server.lock().failures.insert(kind, Failure::Times(times));
    }

    /// Fail every call of `kind` until healed
    pub fn fail_always(&self, kind: CallKind) {
        self.server.lock().failures.insert(kind, Failure::Always);
    }

    pub fn heal(&self, kind: CallKind) {
        self.server.lock().failures.remove(&kind);
    }

    /// Every call so far, in arrival order
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.server.lock().calls.clone()
    }

    /// Calls of one kind, in arrival order
    #[must_use]
    pub fn calls_of(&self, kind: CallKind) -> Vec<Call> {
        self.server
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn call_count(&self, kind: CallKind) -> usize {
        self.server
            .lock()
            .calls
            .iter()
            .filter(|c| c.kind() == kind)
            .count()
    }

    pub fn clear_calls(&self) {
        self.server.lock().calls.clear();
    }

    async fn call<T>(
        &self,
        call: Call,
        apply: impl FnOnce(&mut Server) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let admitted = self.server.lock().admit(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        admitted?;
        apply(&mut self.server.lock())
    }
}

#[async_trait]
impl DocumentGateway for InMemoryGateway {
    async fn fetch_document(&self, id: DocumentId) -> Result<Document, GatewayError> {
        self.call(Call::Fetch(id), |server| {
            server
                .documents
                .get(&id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("canvas {id}")))
        })
        .await
    }

    async fn patch_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<(), GatewayError> {
        let call = Call::PatchDocument {
            document: id,
            patch: patch.clone(),
        };
        self.call(call, |server| {
            let doc = server.document_mut(id)?;
            let mut updated = doc.clone();
            for (field, value) in patch.iter() {
                updated
                    .set_field(field, value.clone())
                    .map_err(|e| unprocessable(&e))?;
            }
            updated.updated_at = Some(Utc::now());
            *doc = updated;
            Ok(())
        })
        .await
    }

    async fn create_section(&self, document: DocumentId, draft: SectionDraft) -> Result<Section, GatewayError> {
        let call = Call::CreateSection {
            document,
            draft: draft.clone(),
        };
        self.call(call, |server| {
            let doc = server.document_mut(document)?;
            if doc.sections.len() >= MAX_SECTIONS {
                return Err(GatewayError::rejected(
                    422,
                    format!("a canvas holds at most {MAX_SECTIONS} theses"),
                ));
            }
            let max = doc.sections.iter().map(|s| s.order).max().unwrap_or(0);
            let taken = draft.order == 0 || doc.sections.iter().any(|s| s.order == draft.order);
            let mut section = Section::new(draft.id, draft.text.trim());
            section.order = if taken { max + 1 } else { draft.order };
            section.description = draft.description;
            section.category = draft.category;
            doc.sections.push(section.clone());
            doc.sections.sort_by_key(|s| s.order);
            Ok(section)
        })
        .await
    }

    async fn update_section(&self, id: SectionId, patch: SectionPatch) -> Result<(), GatewayError> {
        let call = Call::UpdateSection {
            section: id,
            patch: patch.clone(),
        };
        self.call(call, |server| {
            let doc = server.owner_of_section(id)?;
            let Some(section) = doc.section_mut(id) else {
                return Err(GatewayError::NotFound(format!("thesis {id}")));
            };
            let mut updated = section.clone();
            for (field, value) in patch.iter() {
                updated
                    .set_field(field, value.clone())
                    .map_err(|e| unprocessable(&e))?;
            }
            *section = updated;
            Ok(())
        })
        .await
    }

    async fn delete_section(&self, id: SectionId) -> Result<(), GatewayError> {
        self.call(Call::DeleteSection(id), |server| {
            let doc = server.owner_of_section(id)?;
            doc.sections.retain(|s| s.id != id);
            Ok(())
        })
        .await
    }

    async fn reorder_sections(&self, document: DocumentId, orders: Vec<SectionOrder>) -> Result<(), GatewayError> {
        let call = Call::ReorderSections {
            document,
            orders: orders.clone(),
        };
        self.call(call, |server| {
            let doc = server.document_mut(document)?;
            if let Some(missing) = orders.iter().find(|o| doc.section(o.id).is_none()) {
                return Err(GatewayError::NotFound(format!("thesis {}", missing.id)));
            }
            for entry in &orders {
                if let Some(section) = doc.section_mut(entry.id) {
                    section.order = entry.order;
                }
            }
            doc.sections.sort_by_key(|s| s.order);
            Ok(())
        })
        .await
    }

    async fn create_item(&self, section: SectionId, draft: ItemDraft) -> Result<Item, GatewayError> {
        let call = Call::CreateItem {
            section,
            draft: draft.clone(),
        };
        self.call(call, |server| {
            let doc = server.owner_of_section(section)?;
            let mut item = Item::new(draft.id, draft.description.trim());
            item.status = draft.status;
            doc.insert_item(section, item.clone())
                .map_err(|e| unprocessable(&e))?;
            Ok(item)
        })
        .await
    }

    async fn update_item(&self, id: ItemId, patch: ItemPatch) -> Result<(), GatewayError> {
        let call = Call::UpdateItem {
            item: id,
            patch: patch.clone(),
        };
        self.call(call, |server| {
            let doc = server.owner_of_item(id)?;
            let Some(item) = doc.item_mut(id) else {
                return Err(GatewayError::NotFound(format!("proof point {id}")));
            };
            let mut updated = item.clone();
            for (field, value) in patch.iter() {
                updated
                    .set_field(field, value.clone())
                    .map_err(|e| unprocessable(&e))?;
            }
            *item = updated;
            Ok(())
        })
        .await
    }

    async fn delete_item(&self, id: ItemId) -> Result<(), GatewayError> {
        self.call(Call::DeleteItem(id), |server| {
            server
                .owner_of_item(id)?
                .remove_item(id)
                .map(|_| ())
                .map_err(|e| unprocessable(&e))
        })
        .await
    }

    async fn upload_attachment(&self, item: ItemId, upload: AttachmentUpload) -> Result<Attachment, GatewayError> {
        let call = Call::UploadAttachment {
            item,
            filename: upload.filename.clone(),
            size: upload.size(),
        };
        let user = self.user;
        self.call(call, move |server| {
            let attachment = Attachment {
                id: AttachmentId::new(),
                size_bytes: upload.size(),
                filename: upload.filename,
                content_type: upload.content_type,
                label: upload.label,
                uploaded_by: user,
                created_at: Utc::now(),
            };
            server
                .owner_of_item(item)?
                .insert_attachment(item, attachment.clone())
                .map_err(|e| unprocessable(&e))?;
            Ok(attachment)
        })
        .await
    }

    async fn delete_attachment(&self, id: AttachmentId) -> Result<(), GatewayError> {
        self.call(Call::DeleteAttachment(id), |server| {
            server
                .owner_of_attachment(id)?
                .remove_attachment(id)
                .map(|_| ())
                .map_err(|e| unprocessable(&e))
        })
        .await
    }
}

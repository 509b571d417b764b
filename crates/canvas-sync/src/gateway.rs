//! Remote Document Gateway
//!
//! The engine's only view of the server. Implementations attach credentials,
//! pick the transport and own timeouts; the engine treats every failure
//! opaquely as a [`GatewayError`].

use crate::error::GatewayError;
use canvas_model::{
    Attachment, AttachmentId, CategoryId, Document, DocumentId, DocumentPatch, Item, ItemId,
    ItemPatch, ItemStatus, Section, SectionId, SectionOrder, SectionPatch,
};
use serde::{Deserialize, Serialize};

/// Payload for creating a section
///
/// The id is generated locally so the optimistic entity and the server
/// entity share it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub id: SectionId,
    pub text: String,
    pub order: u32,
    pub description: Option<String>,
    #[serde(rename = "category_id")]
    pub category: Option<CategoryId>,
}

impl From<&Section> for SectionDraft {
    fn from(section: &Section) -> Self {
        Self {
            id: section.id,
            text: section.text.clone(),
            order: section.order,
            description: section.description.clone(),
            category: section.category,
        }
    }
}

/// Payload for creating an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDraft {
    pub id: ItemId,
    pub description: String,
    pub status: ItemStatus,
}

impl From<&Item> for ItemDraft {
    fn from(item: &Item) -> Self {
        Self {
            id: item.id,
            description: item.description.clone(),
            status: item.status,
        }
    }
}

/// Binary payload plus metadata for an attachment upload
#[derive(Clone, PartialEq, Eq)]
pub struct AttachmentUpload {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub label: Option<String>,
}

impl AttachmentUpload {
    /// Upload without a label
    #[must_use]
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes,
            label: None,
        }
    }

    /// With a label
    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Payload size in bytes
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }
}

impl std::fmt::Debug for AttachmentUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentUpload")
            .field("filename", &self.filename)
            .field("content_type", &self.content_type)
            .field("size", &self.bytes.len())
            .field("label", &self.label)
            .finish()
    }
}

/// Remote persistence for canvas documents
///
/// Every call may fail independently. Batch reorder must be applied
/// atomically by the server.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait DocumentGateway: Send + Sync {
    /// Fetch the whole tree
    async fn fetch_document(&self, id: DocumentId) -> Result<Document, GatewayError>;

    /// Patch canvas attributes
    async fn patch_document(&self, id: DocumentId, patch: DocumentPatch) -> Result<(), GatewayError>;

    /// Create a section; returns the stored entity
    async fn create_section(
        &self,
        document: DocumentId,
        draft: SectionDraft,
    ) -> Result<Section, GatewayError>;

    async fn update_section(&self, id: SectionId, patch: SectionPatch) -> Result<(), GatewayError>;

    async fn delete_section(&self, id: SectionId) -> Result<(), GatewayError>;

    /// Apply a full `{id, order}` list atomically
    async fn reorder_sections(
        &self,
        document: DocumentId,
        orders: Vec<SectionOrder>,
    ) -> Result<(), GatewayError>;

    /// Create an item; returns the stored entity
    async fn create_item(&self, section: SectionId, draft: ItemDraft) -> Result<Item, GatewayError>;

    async fn update_item(&self, id: ItemId, patch: ItemPatch) -> Result<(), GatewayError>;

    async fn delete_item(&self, id: ItemId) -> Result<(), GatewayError>;

    /// Store a file on an item; returns the attachment record
    async fn upload_attachment(
        &self,
        item: ItemId,
        upload: AttachmentUpload,
    ) -> Result<Attachment, GatewayError>;

    async fn delete_attachment(&self, id: AttachmentId) -> Result<(), GatewayError>;
}

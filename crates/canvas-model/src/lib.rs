//! Canvas Document Model
//!
//! The hierarchical document that the sync engine keeps in memory: a canvas
//! holds ordered theses (sections), each thesis holds proof points (items),
//! and each proof point owns attachments.
//!
//! # Core Concepts
//!
//! - [`Document`] / [`Section`] / [`Item`] / [`Attachment`]: the tree
//! - [`FieldPath`]: address of one independently editable scalar field
//! - [`FieldValue`]: typed value checked against a [`ValueRule`]
//! - [`Patch`]: partial update, last write wins per attribute
//!
//! # Example
//!
//! ```rust,ignore
//! use canvas_model::{Document, DocumentField, FieldPath, FieldValue};
//!
//! let mut doc = Document::new(DocumentId::new());
//! doc.write(&FieldPath::document(DocumentField::PrimaryFocus), FieldValue::text("retention"))?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod enums;
mod error;
mod field;
mod ids;
mod tree;

pub use enums::{ItemStatus, LifecycleLane, TestingTarget};
pub use error::ModelError;
pub use field::{
    DocumentField, DocumentPatch, FieldPath, FieldValue, ItemField, ItemPatch, Patch,
    SectionField, SectionPatch, ValueRule, SHORT_TEXT_MAX,
};
pub use ids::{AttachmentId, CategoryId, DocumentId, ItemId, SectionId, UserId};
pub use tree::{Attachment, Document, Item, Section, SectionOrder, MAX_SECTIONS};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Testing utilities for the canvas sync workspace
//!
//! Shared fixtures, an in-memory gateway and tracing setup.

#![allow(missing_docs)]

mod memory;

pub use memory::{Call, CallKind, InMemoryGateway};

use canvas_model::{Document, DocumentId, Item, ItemId, Section, SectionId};
use canvas_sync::{AttachmentUpload, SyncConfig, SyncEngine};
use std::sync::Arc;
use std::time::Duration;

/// Document with `sections` theses, each holding `items` proof points
#[must_use]
pub fn document_with(sections: usize, items: usize) -> Document {
    let mut doc = Document::new(DocumentId::new());
    doc.product_name = Some("Test product".to_string());
    for s in 0..sections {
        let mut section = Section::new(SectionId::new(), format!("thesis {}", s + 1));
        section.order = u32::try_from(s + 1).unwrap_or(u32::MAX);
        for i in 0..items {
            section
                .items
                .push(Item::new(ItemId::new(), format!("proof point {}.{}", s + 1, i + 1)));
        }
        doc.sections.push(section);
    }
    doc
}

/// Small PNG-typed upload
#[must_use]
pub fn sample_upload() -> AttachmentUpload {
    AttachmentUpload::new("evidence.png", "image/png", vec![0x89, b'P', b'N', b'G'])
}

/// Config with the stock timings
#[must_use]
pub fn test_config() -> SyncConfig {
    SyncConfig::default()
}

/// Config with every timer set to `interval`
#[must_use]
pub fn fast_config(interval: Duration) -> SyncConfig {
    SyncConfig::default()
        .with_field_debounce(interval)
        .with_batch_debounce(interval)
        .with_saved_display(interval)
}

/// Seed a gateway with `document` and build an engine for it, not yet loaded
#[must_use]
pub fn engine_for(document: &Document, config: SyncConfig) -> (Arc<InMemoryGateway>, SyncEngine<InMemoryGateway>) {
    let gateway = Arc::new(InMemoryGateway::new().with_document(document.clone()));
    let engine = match SyncEngine::new(Arc::clone(&gateway), config) {
        Ok(engine) => engine,
        Err(e) => panic!("test config rejected: {e}"),
    };
    (gateway, engine)
}

/// Install a test subscriber honouring `RUST_LOG`; safe to call repeatedly
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

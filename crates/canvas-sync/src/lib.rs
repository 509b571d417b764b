//! Canvas Sync Engine
//!
//! Keeps an in-memory canvas document responsive while every change is
//! persisted to a remote backend in the background.
//!
//! # Core Concepts
//!
//! - **Optimistic store**: every edit lands in [`DocumentStore`] first, then
//!   the matching gateway call is scheduled.
//! - **Field sessions**: each section/item field being edited runs its own
//!   `idle → editing → saving → saved/error` machine with a debounce.
//! - **Attribute batch**: canvas-level attributes coalesce into one patch
//!   under a single shared timer.
//! - **Reconciliation**: a failed field save stays on its field for retry;
//!   a failed structural change reloads server truth once no structural call
//!   is outstanding.
//!
//! # Example
//!
//! ```rust,ignore
//! use canvas_sync::{SyncConfig, SyncEngine};
//! use std::sync::Arc;
//!
//! let engine = Arc::new(SyncEngine::new(Arc::new(gateway), SyncConfig::default())?);
//! engine.load(document_id).await?;
//!
//! let driver = Arc::clone(&engine);
//! tokio::spawn(async move { driver.drive().await });
//!
//! engine.mutate_field(path, FieldValue::text("new thesis"));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod accumulator;
mod config;
mod engine;
mod error;
mod gateway;
mod outcome;
mod reconcile;
mod session;
mod status;
mod store;
mod timer;

pub use accumulator::{PendingMutations, Take};
pub use config::{SyncConfig, DEFAULT_CONTENT_TYPES, DEFAULT_MAX_UPLOAD_BYTES};
pub use engine::SyncEngine;
pub use error::{GatewayError, MutationKind, SyncError, UploadError};
pub use gateway::{AttachmentUpload, DocumentGateway, ItemDraft, SectionDraft};
pub use outcome::{FlushReport, Outcome};
pub use reconcile::{classify, reapply_local_intent, Recovery, ReloadGate};
pub use session::{
    allowed_transitions, validate_transition, Completion, FieldSession, FieldState, SaveStatus,
    SaveTicket, SessionError,
};
pub use status::{StatusPublisher, SyncStatus};
pub use store::{Change, DocumentStore};
pub use timer::CoalescingTimer;

pub use canvas_model;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

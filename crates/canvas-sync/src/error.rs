//! Error types for the sync engine
//!
//! Mirrors the failure taxonomy the engine exposes to callers:
//! - Initial load failures
//! - Field-level save failures (recovered by user retry)
//! - Structural save failures (recovered by reload)
//! - Business-rule rejections raised before any mutation
//! - Attachment upload failures

use crate::session::{FieldState, SessionError};
use canvas_model::{FieldPath, ModelError};
use std::fmt;

/// Failure reported by the remote document gateway
///
/// The engine treats these opaquely; only [`GatewayError::is_retryable`]
/// is consulted when logging.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Network or transport failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Server rejected the request
    #[error("rejected ({code}): {message}")]
    Rejected {
        /// Status code reported by the server
        code: u16,
        /// Server message
        message: String,
    },

    /// Addressed entity does not exist on the server
    #[error("not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Shorthand for a [`GatewayError::Rejected`]
    #[inline]
    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Check if resubmitting the same request may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Rejected { code, .. } => *code >= 500 || *code == 429,
            Self::NotFound(_) => false,
        }
    }
}

/// Kind of persisted mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// Single field save from an edit session
    FieldSave,
    /// Batched canvas attribute patch
    DocumentBatch,
    AddSection,
    RemoveSection,
    ReorderSections,
    AddItem,
    RemoveItem,
    UploadAttachment,
    RemoveAttachment,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FieldSave => "field save",
            Self::DocumentBatch => "document batch",
            Self::AddSection => "add section",
            Self::RemoveSection => "remove section",
            Self::ReorderSections => "reorder sections",
            Self::AddItem => "add item",
            Self::RemoveItem => "remove item",
            Self::UploadAttachment => "upload attachment",
            Self::RemoveAttachment => "remove attachment",
        };
        f.write_str(name)
    }
}

/// Attachment upload failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    /// Zero-byte payload
    #[error("file is empty")]
    Empty,

    /// Payload above the configured cap
    #[error("file is {size} bytes, limit is {max}")]
    TooLarge {
        /// Payload size
        size: u64,
        /// Configured cap
        max: u64,
    },

    /// Content type outside the allow-list
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),

    /// Label supplied but blank
    #[error("label must not be blank")]
    BlankLabel,

    /// Gateway rejected or failed the upload
    #[error("upload failed: {0}")]
    Gateway(#[from] GatewayError),
}

/// Main sync engine error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Initial fetch failed; no partial document is installed
    #[error("load failed: {0}")]
    Load(GatewayError),

    /// One field's persistence failed
    #[error("save of {path} failed: {source}")]
    FieldSave {
        /// Field that failed
        path: FieldPath,
        /// Gateway failure
        source: GatewayError,
    },

    /// Structural or batched persistence failed; the store is reloaded
    #[error("{op} failed: {source}")]
    StructuralSave {
        /// Mutation that failed
        op: MutationKind,
        /// Gateway failure
        source: GatewayError,
    },

    /// Section cap reached; nothing was mutated
    #[error("document already holds the maximum of {limit} sections")]
    LimitExceeded {
        /// Configured cap
        limit: usize,
    },

    /// Attachment upload failed
    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    /// No document is installed
    #[error("no document loaded")]
    NotLoaded,

    /// A newer load replaced the document while this call was running
    #[error("superseded by a newer load")]
    Superseded,

    /// Value or tree operation rejected by the model
    #[error(transparent)]
    Invalid(ModelError),

    /// Edit session misuse
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Check if the failure is recovered by reloading from the server
    #[inline]
    #[must_use]
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::StructuralSave { .. })
    }

    /// Check if the caller can resubmit the same request
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Load(e) | Self::FieldSave { source: e, .. } => e.is_retryable(),
            Self::Upload(UploadError::Gateway(e)) => e.is_retryable(),
            _ => false,
        }
    }

    /// Illegal session transition
    #[inline]
    pub(crate) fn illegal(path: FieldPath, from: FieldState, to: FieldState) -> Self {
        Self::Session(SessionError::IllegalTransition { path, from, to })
    }
}

impl From<ModelError> for SyncError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::LimitExceeded { limit } => Self::LimitExceeded { limit },
            other => Self::Invalid(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_model::{DocumentField, SectionId};

    #[test]
    fn limit_maps_to_engine_variant() {
        let err: SyncError = ModelError::LimitExceeded { limit: 5 }.into();
        assert_eq!(err, SyncError::LimitExceeded { limit: 5 });
    }

    #[test]
    fn other_model_errors_are_invalid() {
        let err: SyncError = ModelError::not_found("section", SectionId::new()).into();
        assert!(matches!(err, SyncError::Invalid(_)));
    }

    #[test]
    fn retry_classification() {
        let transport = GatewayError::Transport("reset".into());
        assert!(transport.is_retryable());
        assert!(!GatewayError::rejected(422, "bad").is_retryable());
        assert!(GatewayError::rejected(503, "busy").is_retryable());

        let err = SyncError::FieldSave {
            path: FieldPath::document(DocumentField::ProductName),
            source: transport,
        };
        assert!(err.is_retryable());
        assert!(!err.is_structural());
    }

    #[test]
    fn structural_display() {
        let err = SyncError::StructuralSave {
            op: MutationKind::ReorderSections,
            source: GatewayError::Transport("timeout".into()),
        };
        assert_eq!(err.to_string(), "reorder sections failed: transport error: timeout");
        assert!(err.is_structural());
    }
}

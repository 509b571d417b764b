//! Engine configuration

use crate::error::SyncError;
use canvas_model::MAX_SECTIONS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default attachment size cap (10 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Content types accepted for attachments
pub const DEFAULT_CONTENT_TYPES: [&str; 8] = [
    "image/png",
    "image/jpeg",
    "image/gif",
    "application/pdf",
    "text/csv",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a field session saves
    pub field_debounce_ms: u64,
    /// Quiet period before the canvas attribute batch is flushed
    pub batch_debounce_ms: u64,
    /// How long a field shows `saved` before returning to `idle`
    pub saved_display_ms: u64,
    /// Section cap per document
    pub max_sections: usize,
    /// Attachment size cap in bytes
    pub max_upload_bytes: u64,
    /// Attachment content type allow-list
    pub allowed_content_types: Vec<String>,
    /// Batch canvas attribute edits; when off each edit is persisted at once
    pub auto_save: bool,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON configuration, filling missing keys with defaults
    ///
    /// # Errors
    /// [`SyncError::Config`] on malformed JSON or invalid values.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// With field debounce interval
    #[inline]
    #[must_use]
    pub fn with_field_debounce(mut self, interval: Duration) -> Self {
        self.field_debounce_ms = millis(interval);
        self
    }

    /// With batch debounce interval
    #[inline]
    #[must_use]
    pub fn with_batch_debounce(mut self, interval: Duration) -> Self {
        self.batch_debounce_ms = millis(interval);
        self
    }

    /// With saved display window
    #[inline]
    #[must_use]
    pub fn with_saved_display(mut self, window: Duration) -> Self {
        self.saved_display_ms = millis(window);
        self
    }

    /// With section cap
    #[inline]
    #[must_use]
    pub fn with_max_sections(mut self, max: usize) -> Self {
        self.max_sections = max;
        self
    }

    /// With attachment size cap
    #[inline]
    #[must_use]
    pub fn with_max_upload_bytes(mut self, max: u64) -> Self {
        self.max_upload_bytes = max;
        self
    }

    /// With auto-save on or off
    #[inline]
    #[must_use]
    pub fn with_auto_save(mut self, enabled: bool) -> Self {
        self.auto_save = enabled;
        self
    }

    /// Field debounce interval
    #[inline]
    #[must_use]
    pub fn field_debounce(&self) -> Duration {
        Duration::from_millis(self.field_debounce_ms)
    }

    /// Batch debounce interval
    #[inline]
    #[must_use]
    pub fn batch_debounce(&self) -> Duration {
        Duration::from_millis(self.batch_debounce_ms)
    }

    /// Saved display window
    #[inline]
    #[must_use]
    pub fn saved_display(&self) -> Duration {
        Duration::from_millis(self.saved_display_ms)
    }

    /// Check if a content type is on the allow-list
    #[must_use]
    pub fn accepts_content_type(&self, content_type: &str) -> bool {
        self.allowed_content_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(content_type))
    }

    /// Validate the configuration
    ///
    /// # Errors
    /// [`SyncError::Config`] naming the first offending key.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.field_debounce_ms == 0 {
            return Err(SyncError::Config("field_debounce_ms must be positive".into()));
        }
        if self.batch_debounce_ms == 0 {
            return Err(SyncError::Config("batch_debounce_ms must be positive".into()));
        }
        if self.max_sections == 0 || self.max_sections > MAX_SECTIONS {
            return Err(SyncError::Config(format!(
                "max_sections must be between 1 and {MAX_SECTIONS}"
            )));
        }
        if self.max_upload_bytes == 0 {
            return Err(SyncError::Config("max_upload_bytes must be positive".into()));
        }
        if self.allowed_content_types.is_empty() {
            return Err(SyncError::Config("allowed_content_types must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            field_debounce_ms: 2000,
            batch_debounce_ms: 2000,
            saved_display_ms: 2000,
            max_sections: MAX_SECTIONS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            allowed_content_types: DEFAULT_CONTENT_TYPES.iter().map(|s| (*s).to_string()).collect(),
            auto_save: true,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

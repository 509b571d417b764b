//! Field session states and the transition table

use canvas_model::FieldPath;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one field edit session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    Idle,
    Editing,
    Saving,
    Saved,
    Error,
}

impl FieldState {
    pub const ALL: [FieldState; 5] = [
        FieldState::Idle,
        FieldState::Editing,
        FieldState::Saving,
        FieldState::Saved,
        FieldState::Error,
    ];

    /// Save status shown to the user
    #[inline]
    #[must_use]
    pub fn save_status(&self) -> SaveStatus {
        match self {
            FieldState::Idle | FieldState::Editing => SaveStatus::Idle,
            FieldState::Saving => SaveStatus::Saving,
            FieldState::Saved => SaveStatus::Saved,
            FieldState::Error => SaveStatus::Error,
        }
    }
}

impl fmt::Display for FieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldState::Idle => "idle",
            FieldState::Editing => "editing",
            FieldState::Saving => "saving",
            FieldState::Saved => "saved",
            FieldState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Per-field save status published on the status stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveStatus {
    #[default]
    Idle,
    Saving,
    Saved,
    Error,
}

/// Edit session misuse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// Transition not in the table
    #[error("illegal transition for {path}: {from} -> {to}")]
    IllegalTransition {
        path: FieldPath,
        from: FieldState,
        to: FieldState,
    },

    /// No session is open for the field
    #[error("no edit session for {0}")]
    NotEditing(FieldPath),
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: FieldState) -> Vec<FieldState> {
    use FieldState::*;
    match from {
        Idle => vec![Editing],
        Editing => vec![Editing, Idle, Saving],
        Saving => vec![Saved, Error, Editing],
        Saved => vec![Idle, Editing],
        Error => vec![Saving, Editing, Idle],
    }
}

/// Validates a state transition
///
/// # Errors
/// [`SessionError::IllegalTransition`] if `to` is not reachable from `from`.
pub fn validate_transition(
    path: FieldPath,
    from: FieldState,
    to: FieldState,
) -> Result<(), SessionError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(SessionError::IllegalTransition { path, from, to })
    }
}

//! Model validation errors

/// Errors raised when a value or a tree operation violates a model rule
///
/// Every variant is raised *before* any mutation happens, so a caller that
/// receives one can rely on the tree being untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// Status string outside the closed status set
    #[error("unknown item status: {0:?}")]
    UnknownStatus(String),

    /// Lifecycle lane string outside the closed lane set
    #[error("unknown lifecycle lane: {0:?}")]
    UnknownLane(String),

    /// Value variant does not fit the field
    #[error("field {field} expects {expected}")]
    TypeMismatch {
        /// Field name
        field: &'static str,
        /// Human readable description of accepted values
        expected: &'static str,
    },

    /// Required text field left blank
    #[error("field {0} is required")]
    Required(&'static str),

    /// Text exceeds the field's length cap
    #[error("field {field} exceeds {max} characters")]
    TooLong {
        /// Field name
        field: &'static str,
        /// Maximum allowed characters
        max: usize,
    },

    /// Section cap reached
    #[error("document already holds the maximum of {limit} sections")]
    LimitExceeded {
        /// Configured section cap
        limit: usize,
    },

    /// Addressed entity is not part of the tree
    #[error("{kind} {id} not found")]
    NotFound {
        /// Entity kind (section, item, attachment)
        kind: &'static str,
        /// Entity id as text
        id: String,
    },

    /// Reorder list is not a permutation of the current sections
    #[error("invalid reorder: {0}")]
    InvalidReorder(String),
}

impl ModelError {
    /// Shorthand for a [`ModelError::NotFound`]
    #[inline]
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Check if the error reports a missing entity
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_error_display() {
        let err = ModelError::LimitExceeded { limit: 5 };
        assert!(err.to_string().contains("maximum of 5"));

        let err = ModelError::not_found("section", "abc");
        assert_eq!(err.to_string(), "section abc not found");
        assert!(err.is_not_found());
    }
}

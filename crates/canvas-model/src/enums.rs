//! Closed value sets
//!
//! Item status, lifecycle lane and the "currently testing" target. Parsing
//! is strict: unknown strings are rejected, never coerced to a default.

use crate::error::ModelError;
use crate::ids::{ItemId, SectionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Proof point status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Work has not begun
    #[default]
    NotStarted,
    /// Being observed
    InProgress,
    /// Signal observed
    Observed,
    /// Signal looked for and not observed
    NotObserved,
    /// No progress
    Stalled,
}

impl ItemStatus {
    /// Every status, in declaration order
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::NotStarted,
        ItemStatus::InProgress,
        ItemStatus::Observed,
        ItemStatus::NotObserved,
        ItemStatus::Stalled,
    ];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::NotStarted => "not_started",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Observed => "observed",
            ItemStatus::NotObserved => "not_observed",
            ItemStatus::Stalled => "stalled",
        }
    }

    /// Observation score: 1 for observed, 0 for not observed, none otherwise
    #[inline]
    #[must_use]
    pub fn score(&self) -> Option<u8> {
        match self {
            ItemStatus::Observed => Some(1),
            ItemStatus::NotObserved => Some(0),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::UnknownStatus(s.to_string()))
    }
}

/// Product lifecycle lane of a canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleLane {
    /// Building the product
    #[default]
    Build,
    /// Selling it
    Sell,
    /// Harvesting it
    Milk,
    /// Rethinking it
    Reframe,
}

impl LifecycleLane {
    /// Every lane, in declaration order
    pub const ALL: [LifecycleLane; 4] = [
        LifecycleLane::Build,
        LifecycleLane::Sell,
        LifecycleLane::Milk,
        LifecycleLane::Reframe,
    ];

    /// Wire name
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleLane::Build => "build",
            LifecycleLane::Sell => "sell",
            LifecycleLane::Milk => "milk",
            LifecycleLane::Reframe => "reframe",
        }
    }
}

impl fmt::Display for LifecycleLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleLane {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleLane::ALL
            .into_iter()
            .find(|lane| lane.as_str() == s)
            .ok_or_else(|| ModelError::UnknownLane(s.to_string()))
    }
}

/// What the canvas is currently testing
///
/// The kind and the id travel together, so a "thesis" kind can never point
/// at a proof point id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum TestingTarget {
    /// A thesis
    Section(SectionId),
    /// A proof point
    Item(ItemId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_every_wire_name() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
    }

    #[test]
    fn status_rejects_unknown_value() {
        let err = "done".parse::<ItemStatus>().unwrap_err();
        assert_eq!(err, ModelError::UnknownStatus("done".to_string()));
        assert!(serde_json::from_str::<ItemStatus>("\"done\"").is_err());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&ItemStatus::NotObserved).unwrap();
        assert_eq!(json, "\"not_observed\"");
    }

    #[test]
    fn status_score() {
        assert_eq!(ItemStatus::Observed.score(), Some(1));
        assert_eq!(ItemStatus::NotObserved.score(), Some(0));
        assert_eq!(ItemStatus::Stalled.score(), None);
    }

    #[test]
    fn lane_rejects_unknown_value() {
        assert_eq!("milk".parse::<LifecycleLane>().unwrap(), LifecycleLane::Milk);
        assert!("harvest".parse::<LifecycleLane>().is_err());
    }

    #[test]
    fn testing_target_wire_shape() {
        let id = SectionId::new();
        let json = serde_json::to_value(TestingTarget::Section(id)).unwrap();
        assert_eq!(json["type"], "section");
        assert_eq!(json["id"], id.to_string());
    }
}

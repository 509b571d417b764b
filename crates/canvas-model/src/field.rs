//! Field addressing and typed field values
//!
//! A [`FieldPath`] names one independently editable scalar attribute
//! somewhere in the tree. Values travel as [`FieldValue`] and are checked
//! against the field's rule before they reach the tree.

use crate::enums::{ItemStatus, LifecycleLane, TestingTarget};
use crate::error::ModelError;
use crate::ids::{CategoryId, ItemId, SectionId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Short text cap shared by the name-like canvas attributes
pub const SHORT_TEXT_MAX: usize = 255;

/// Value held by a single field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    /// Cleared optional field
    Empty,
    /// Plain or rich text (rich text is an opaque blob here)
    Text(String),
    /// Lifecycle lane
    Lane(LifecycleLane),
    /// Proof point status
    Status(ItemStatus),
    /// Calendar date
    Date(NaiveDate),
    /// Category reference
    Category(CategoryId),
    /// Currently-testing target
    Testing(TestingTarget),
}

impl FieldValue {
    /// Text value
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Borrow the text, if this is a text value
    #[inline]
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Check for the cleared value
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Take the text out, if this is a text value
    #[inline]
    #[must_use]
    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn from_opt_text(value: Option<&String>) -> Self {
        value.map_or(Self::Empty, |s| Self::Text(s.clone()))
    }
}

/// Accepted shape of a field's value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRule {
    /// Non-blank text, optionally length-capped
    RequiredText(Option<usize>),
    /// Text or empty, optionally length-capped; blank text clears the field
    OptionalText(Option<usize>),
    /// A lifecycle lane
    Lane,
    /// A proof point status
    Status,
    /// A date or empty
    OptionalDate,
    /// A category or empty
    OptionalCategory,
    /// A testing target or empty
    OptionalTesting,
}

impl ValueRule {
    fn expected(self) -> &'static str {
        match self {
            ValueRule::RequiredText(_) => "text",
            ValueRule::OptionalText(_) => "text or empty",
            ValueRule::Lane => "a lifecycle lane",
            ValueRule::Status => "an item status",
            ValueRule::OptionalDate => "a date or empty",
            ValueRule::OptionalCategory => "a category or empty",
            ValueRule::OptionalTesting => "a section/item target or empty",
        }
    }

    /// Validate and normalise `value` for the field called `field`
    ///
    /// # Errors
    /// Returns a [`ModelError`] when the value does not fit the rule.
    pub fn check(self, field: &'static str, value: FieldValue) -> Result<FieldValue, ModelError> {
        let mismatch = || ModelError::TypeMismatch {
            field,
            expected: self.expected(),
        };
        let cap = |max: Option<usize>, s: &str| match max {
            Some(max) if s.chars().count() > max => Err(ModelError::TooLong { field, max }),
            _ => Ok(()),
        };

        match (self, value) {
            (ValueRule::RequiredText(max), FieldValue::Text(s)) => {
                if s.trim().is_empty() {
                    return Err(ModelError::Required(field));
                }
                cap(max, &s)?;
                Ok(FieldValue::Text(s))
            }
            (ValueRule::RequiredText(_), FieldValue::Empty) => Err(ModelError::Required(field)),
            (ValueRule::OptionalText(max), FieldValue::Text(s)) => {
                if s.trim().is_empty() {
                    return Ok(FieldValue::Empty);
                }
                cap(max, &s)?;
                Ok(FieldValue::Text(s))
            }
            (
                ValueRule::OptionalText(_)
                | ValueRule::OptionalDate
                | ValueRule::OptionalCategory
                | ValueRule::OptionalTesting,
                FieldValue::Empty,
            ) => Ok(FieldValue::Empty),
            (ValueRule::Lane, v @ FieldValue::Lane(_))
            | (ValueRule::Status, v @ FieldValue::Status(_))
            | (ValueRule::OptionalDate, v @ FieldValue::Date(_))
            | (ValueRule::OptionalCategory, v @ FieldValue::Category(_))
            | (ValueRule::OptionalTesting, v @ FieldValue::Testing(_)) => Ok(v),
            _ => Err(mismatch()),
        }
    }
}

/// Scalar attributes of the canvas itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentField {
    ProductName,
    LifecycleLane,
    SuccessDescription,
    FutureStateIntent,
    PrimaryFocus,
    ResistDoing,
    GoodDiscipline,
    PrimaryConstraint,
    CurrentlyTesting,
    PortfolioNotes,
}

impl DocumentField {
    /// Wire name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DocumentField::ProductName => "product_name",
            DocumentField::LifecycleLane => "lifecycle_lane",
            DocumentField::SuccessDescription => "success_description",
            DocumentField::FutureStateIntent => "future_state_intent",
            DocumentField::PrimaryFocus => "primary_focus",
            DocumentField::ResistDoing => "resist_doing",
            DocumentField::GoodDiscipline => "good_discipline",
            DocumentField::PrimaryConstraint => "primary_constraint",
            DocumentField::CurrentlyTesting => "currently_testing",
            DocumentField::PortfolioNotes => "portfolio_notes",
        }
    }

    /// Value rule for the attribute
    #[must_use]
    pub fn rule(&self) -> ValueRule {
        match self {
            DocumentField::ProductName | DocumentField::PrimaryFocus => {
                ValueRule::OptionalText(Some(SHORT_TEXT_MAX))
            }
            DocumentField::LifecycleLane => ValueRule::Lane,
            DocumentField::CurrentlyTesting => ValueRule::OptionalTesting,
            DocumentField::SuccessDescription
            | DocumentField::FutureStateIntent
            | DocumentField::ResistDoing
            | DocumentField::GoodDiscipline
            | DocumentField::PrimaryConstraint
            | DocumentField::PortfolioNotes => ValueRule::OptionalText(None),
        }
    }
}

/// Scalar attributes of a thesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionField {
    Text,
    Description,
    #[serde(rename = "category_id")]
    Category,
}

impl SectionField {
    /// Wire name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SectionField::Text => "text",
            SectionField::Description => "description",
            SectionField::Category => "category_id",
        }
    }

    /// Value rule for the attribute
    #[must_use]
    pub fn rule(&self) -> ValueRule {
        match self {
            SectionField::Text => ValueRule::RequiredText(None),
            SectionField::Description => ValueRule::OptionalText(None),
            SectionField::Category => ValueRule::OptionalCategory,
        }
    }
}

/// Scalar attributes of a proof point
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemField {
    Description,
    Status,
    #[serde(rename = "evidence_note")]
    Notes,
    #[serde(rename = "target_review_month")]
    TargetDate,
}

impl ItemField {
    /// Wire name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ItemField::Description => "description",
            ItemField::Status => "status",
            ItemField::Notes => "evidence_note",
            ItemField::TargetDate => "target_review_month",
        }
    }

    /// Value rule for the attribute
    #[must_use]
    pub fn rule(&self) -> ValueRule {
        match self {
            ItemField::Description => ValueRule::RequiredText(None),
            ItemField::Status => ValueRule::Status,
            ItemField::Notes => ValueRule::OptionalText(None),
            ItemField::TargetDate => ValueRule::OptionalDate,
        }
    }
}

/// Address of one editable scalar field in the tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum FieldPath {
    /// Canvas attribute
    Document { field: DocumentField },
    /// Thesis attribute
    Section { id: SectionId, field: SectionField },
    /// Proof point attribute
    Item { id: ItemId, field: ItemField },
}

impl FieldPath {
    /// Canvas attribute path
    #[inline]
    #[must_use]
    pub fn document(field: DocumentField) -> Self {
        Self::Document { field }
    }

    /// Thesis attribute path
    #[inline]
    #[must_use]
    pub fn section(id: SectionId, field: SectionField) -> Self {
        Self::Section { id, field }
    }

    /// Proof point attribute path
    #[inline]
    #[must_use]
    pub fn item(id: ItemId, field: ItemField) -> Self {
        Self::Item { id, field }
    }

    /// Attribute wire name
    #[must_use]
    pub fn field_name(&self) -> &'static str {
        match self {
            FieldPath::Document { field } => field.name(),
            FieldPath::Section { field, .. } => field.name(),
            FieldPath::Item { field, .. } => field.name(),
        }
    }

    /// Value rule for the addressed attribute
    #[must_use]
    pub fn rule(&self) -> ValueRule {
        match self {
            FieldPath::Document { field } => field.rule(),
            FieldPath::Section { field, .. } => field.rule(),
            FieldPath::Item { field, .. } => field.rule(),
        }
    }

    /// Validate a value for this path
    ///
    /// # Errors
    /// Returns a [`ModelError`] when the value does not fit the attribute.
    pub fn check(&self, value: FieldValue) -> Result<FieldValue, ModelError> {
        self.rule().check(self.field_name(), value)
    }

    /// Check whether the path lives on the canvas itself
    #[inline]
    #[must_use]
    pub fn is_document(&self) -> bool {
        matches!(self, FieldPath::Document { .. })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldPath::Document { field } => write!(f, "document.{}", field.name()),
            FieldPath::Section { id, field } => write!(f, "section/{id}.{}", field.name()),
            FieldPath::Item { id, field } => write!(f, "item/{id}.{}", field.name()),
        }
    }
}

/// Partial update of one entity's attributes
///
/// Later inserts for the same attribute overwrite earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Patch<F: Ord> {
    values: BTreeMap<F, FieldValue>,
}

/// Canvas attribute patch
pub type DocumentPatch = Patch<DocumentField>;
/// Thesis attribute patch
pub type SectionPatch = Patch<SectionField>;
/// Proof point attribute patch
pub type ItemPatch = Patch<ItemField>;

impl<F: Ord + Copy> Patch<F> {
    /// Empty patch
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Patch carrying a single attribute
    #[must_use]
    pub fn single(field: F, value: FieldValue) -> Self {
        let mut patch = Self::new();
        patch.insert(field, value);
        patch
    }

    /// Set an attribute, replacing any earlier value for it
    pub fn insert(&mut self, field: F, value: FieldValue) {
        self.values.insert(field, value);
    }

    /// Pending value for an attribute
    #[must_use]
    pub fn get(&self, field: F) -> Option<&FieldValue> {
        self.values.get(&field)
    }

    /// Number of attributes
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check for an empty patch
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Attributes in key order
    pub fn iter(&self) -> impl Iterator<Item = (F, &FieldValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }
}

impl<F: Ord + Copy> Default for Patch<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Ord + Copy> FromIterator<(F, FieldValue)> for Patch<F> {
    fn from_iter<I: IntoIterator<Item = (F, FieldValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_text_rejects_blank() {
        let path = FieldPath::section(SectionId::new(), SectionField::Text);
        assert_eq!(
            path.check(FieldValue::text("   ")),
            Err(ModelError::Required("text"))
        );
        assert_eq!(path.check(FieldValue::Empty), Err(ModelError::Required("text")));
    }

    #[test]
    fn optional_text_blank_clears() {
        let path = FieldPath::document(DocumentField::ResistDoing);
        assert_eq!(path.check(FieldValue::text("  ")), Ok(FieldValue::Empty));
    }

    #[test]
    fn short_text_is_capped() {
        let path = FieldPath::document(DocumentField::ProductName);
        let long = "x".repeat(SHORT_TEXT_MAX + 1);
        assert_eq!(
            path.check(FieldValue::Text(long)),
            Err(ModelError::TooLong {
                field: "product_name",
                max: SHORT_TEXT_MAX
            })
        );
    }

    #[test]
    fn status_field_rejects_text() {
        let path = FieldPath::item(ItemId::new(), ItemField::Status);
        assert!(matches!(
            path.check(FieldValue::text("observed")),
            Err(ModelError::TypeMismatch { field: "status", .. })
        ));
        assert!(path.check(FieldValue::Status(ItemStatus::Observed)).is_ok());
    }

    #[test]
    fn lane_cannot_be_cleared() {
        let path = FieldPath::document(DocumentField::LifecycleLane);
        assert!(path.check(FieldValue::Empty).is_err());
    }

    #[test]
    fn patch_last_write_wins() {
        let mut patch = DocumentPatch::new();
        patch.insert(DocumentField::PrimaryFocus, FieldValue::text("a"));
        patch.insert(DocumentField::PrimaryFocus, FieldValue::text("b"));
        assert_eq!(patch.len(), 1);
        assert_eq!(
            patch.get(DocumentField::PrimaryFocus),
            Some(&FieldValue::text("b"))
        );
    }

    #[test]
    fn patch_serializes_as_attribute_map() {
        let patch = DocumentPatch::single(
            DocumentField::LifecycleLane,
            FieldValue::Lane(LifecycleLane::Sell),
        );
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json["lifecycle_lane"]["value"], "sell");
    }

    #[test]
    fn path_display() {
        let path = FieldPath::document(DocumentField::PortfolioNotes);
        assert_eq!(path.to_string(), "document.portfolio_notes");
    }
}

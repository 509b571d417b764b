//! The canvas tree
//!
//! Document → ordered sections → ordered items → attachments.
//!
//! # Invariants
//! - Section `order` values form the contiguous range `1..=N` after every
//!   structural operation.
//! - A document never holds more sections than the cap passed to
//!   [`Document::insert_section`].
//! - Every attachment belongs to exactly one item.

use crate::enums::{ItemStatus, LifecycleLane, TestingTarget};
use crate::error::ModelError;
use crate::field::{DocumentField, FieldPath, FieldValue, ItemField, SectionField};
use crate::ids::{AttachmentId, CategoryId, DocumentId, ItemId, SectionId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default cap on sections per document
pub const MAX_SECTIONS: usize = 5;

/// The canvas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub lifecycle_lane: LifecycleLane,
    #[serde(default)]
    pub success_description: Option<String>,
    #[serde(default)]
    pub future_state_intent: Option<String>,
    #[serde(default)]
    pub primary_focus: Option<String>,
    #[serde(default)]
    pub resist_doing: Option<String>,
    #[serde(default)]
    pub good_discipline: Option<String>,
    #[serde(default)]
    pub primary_constraint: Option<String>,
    #[serde(default)]
    pub currently_testing: Option<TestingTarget>,
    #[serde(default)]
    pub portfolio_notes: Option<String>,
    #[serde(default, rename = "theses")]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A thesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub order: u32,
    pub text: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "category_id")]
    pub category: Option<CategoryId>,
    #[serde(default, rename = "proof_points")]
    pub items: Vec<Item>,
}

/// A proof point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub description: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default, rename = "evidence_note")]
    pub notes: Option<String>,
    #[serde(default, rename = "target_review_month")]
    pub target_date: Option<NaiveDate>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// A file owned by one proof point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub label: Option<String>,
    pub uploaded_by: UserId,
    pub created_at: DateTime<Utc>,
}

/// One `{id, order}` pair of a batch reorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionOrder {
    pub id: SectionId,
    pub order: u32,
}

impl Section {
    /// New section with no items; `order` is assigned on insertion
    #[must_use]
    pub fn new(id: SectionId, text: impl Into<String>) -> Self {
        Self {
            id,
            order: 0,
            text: text.into(),
            description: None,
            category: None,
            items: Vec::new(),
        }
    }

    /// Read one attribute
    #[must_use]
    pub fn field(&self, field: SectionField) -> FieldValue {
        match field {
            SectionField::Text => FieldValue::Text(self.text.clone()),
            SectionField::Description => FieldValue::from_opt_text(self.description.as_ref()),
            SectionField::Category => self.category.map_or(FieldValue::Empty, FieldValue::Category),
        }
    }

    /// Write one attribute after validating it
    ///
    /// # Errors
    /// Returns [`ModelError`] if the value does not fit the attribute.
    pub fn set_field(&mut self, field: SectionField, value: FieldValue) -> Result<(), ModelError> {
        let value = field.rule().check(field.name(), value)?;
        match field {
            SectionField::Text => {
                if let Some(text) = value.into_text() {
                    self.text = text;
                }
            }
            SectionField::Description => self.description = value.into_text(),
            SectionField::Category => {
                self.category = match value {
                    FieldValue::Category(c) => Some(c),
                    _ => None,
                };
            }
        }
        Ok(())
    }
}

impl Item {
    /// New item in the default status
    #[must_use]
    pub fn new(id: ItemId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            status: ItemStatus::default(),
            notes: None,
            target_date: None,
            attachments: Vec::new(),
        }
    }

    /// Read one attribute
    #[must_use]
    pub fn field(&self, field: ItemField) -> FieldValue {
        match field {
            ItemField::Description => FieldValue::Text(self.description.clone()),
            ItemField::Status => FieldValue::Status(self.status),
            ItemField::Notes => FieldValue::from_opt_text(self.notes.as_ref()),
            ItemField::TargetDate => self.target_date.map_or(FieldValue::Empty, FieldValue::Date),
        }
    }

    /// Write one attribute after validating it
    ///
    /// # Errors
    /// Returns [`ModelError`] if the value does not fit the attribute.
    pub fn set_field(&mut self, field: ItemField, value: FieldValue) -> Result<(), ModelError> {
        let value = field.rule().check(field.name(), value)?;
        match (field, value) {
            (ItemField::Description, FieldValue::Text(s)) => self.description = s,
            (ItemField::Status, FieldValue::Status(s)) => self.status = s,
            (ItemField::Notes, value) => self.notes = value.into_text(),
            (ItemField::TargetDate, FieldValue::Date(d)) => self.target_date = Some(d),
            (ItemField::TargetDate, _) => self.target_date = None,
            // Remaining pairs are rejected by the rule check above
            _ => {}
        }
        Ok(())
    }
}

impl Document {
    /// Empty canvas in the default lane
    #[must_use]
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            product_name: None,
            lifecycle_lane: LifecycleLane::default(),
            success_description: None,
            future_state_intent: None,
            primary_focus: None,
            resist_doing: None,
            good_discipline: None,
            primary_constraint: None,
            currently_testing: None,
            portfolio_notes: None,
            sections: Vec::new(),
            updated_at: None,
        }
    }

    /// Sort sections by their stored order and renumber them `1..=N`
    ///
    /// Used when installing a tree received from the server.
    pub fn normalize(&mut self) {
        self.sections.sort_by_key(|s| s.order);
        self.renumber_sections();
    }

    /// Assign `order = position + 1` to every section
    pub fn renumber_sections(&mut self) {
        for (idx, section) in self.sections.iter_mut().enumerate() {
            section.order = u32::try_from(idx + 1).unwrap_or(u32::MAX);
        }
    }

    /// Check the section order invariant
    #[must_use]
    pub fn orders_are_contiguous(&self) -> bool {
        let mut orders: Vec<u32> = self.sections.iter().map(|s| s.order).collect();
        orders.sort_unstable();
        orders
            .iter()
            .enumerate()
            .all(|(idx, order)| usize::try_from(*order).is_ok_and(|o| o == idx + 1))
    }

    /// Current `{id, order}` pairs in display order
    #[must_use]
    pub fn section_orders(&self) -> Vec<SectionOrder> {
        self.sections
            .iter()
            .map(|s| SectionOrder {
                id: s.id,
                order: s.order,
            })
            .collect()
    }

    /// Look up a section
    #[must_use]
    pub fn section(&self, id: SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| s.id == id)
    }

    /// Look up a section mutably
    pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.iter_mut().find(|s| s.id == id)
    }

    /// Look up an item anywhere in the tree
    #[must_use]
    pub fn item(&self, id: ItemId) -> Option<&Item> {
        self.sections
            .iter()
            .flat_map(|s| s.items.iter())
            .find(|i| i.id == id)
    }

    /// Look up an item mutably
    pub fn item_mut(&mut self, id: ItemId) -> Option<&mut Item> {
        self.sections
            .iter_mut()
            .flat_map(|s| s.items.iter_mut())
            .find(|i| i.id == id)
    }

    /// Section that owns an item
    #[must_use]
    pub fn item_parent(&self, id: ItemId) -> Option<SectionId> {
        self.sections
            .iter()
            .find(|s| s.items.iter().any(|i| i.id == id))
            .map(|s| s.id)
    }

    /// Item that owns an attachment
    #[must_use]
    pub fn attachment_owner(&self, id: AttachmentId) -> Option<ItemId> {
        self.sections
            .iter()
            .flat_map(|s| s.items.iter())
            .find(|i| i.attachments.iter().any(|a| a.id == id))
            .map(|i| i.id)
    }

    /// Check that a field path addresses something in this tree
    #[must_use]
    pub fn contains(&self, path: &FieldPath) -> bool {
        match path {
            FieldPath::Document { .. } => true,
            FieldPath::Section { id, .. } => self.section(*id).is_some(),
            FieldPath::Item { id, .. } => self.item(*id).is_some(),
        }
    }

    /// Read one canvas attribute
    #[must_use]
    pub fn field(&self, field: DocumentField) -> FieldValue {
        match field {
            DocumentField::ProductName => FieldValue::from_opt_text(self.product_name.as_ref()),
            DocumentField::LifecycleLane => FieldValue::Lane(self.lifecycle_lane),
            DocumentField::SuccessDescription => {
                FieldValue::from_opt_text(self.success_description.as_ref())
            }
            DocumentField::FutureStateIntent => {
                FieldValue::from_opt_text(self.future_state_intent.as_ref())
            }
            DocumentField::PrimaryFocus => FieldValue::from_opt_text(self.primary_focus.as_ref()),
            DocumentField::ResistDoing => FieldValue::from_opt_text(self.resist_doing.as_ref()),
            DocumentField::GoodDiscipline => {
                FieldValue::from_opt_text(self.good_discipline.as_ref())
            }
            DocumentField::PrimaryConstraint => {
                FieldValue::from_opt_text(self.primary_constraint.as_ref())
            }
            DocumentField::CurrentlyTesting => self
                .currently_testing
                .map_or(FieldValue::Empty, FieldValue::Testing),
            DocumentField::PortfolioNotes => {
                FieldValue::from_opt_text(self.portfolio_notes.as_ref())
            }
        }
    }

    /// Write one canvas attribute after validating it
    ///
    /// # Errors
    /// Returns [`ModelError`] if the value does not fit the attribute.
    pub fn set_field(&mut self, field: DocumentField, value: FieldValue) -> Result<(), ModelError> {
        let value = field.rule().check(field.name(), value)?;
        let text = FieldValue::into_text;
        match field {
            DocumentField::ProductName => self.product_name = text(value),
            DocumentField::SuccessDescription => self.success_description = text(value),
            DocumentField::FutureStateIntent => self.future_state_intent = text(value),
            DocumentField::PrimaryFocus => self.primary_focus = text(value),
            DocumentField::ResistDoing => self.resist_doing = text(value),
            DocumentField::GoodDiscipline => self.good_discipline = text(value),
            DocumentField::PrimaryConstraint => self.primary_constraint = text(value),
            DocumentField::PortfolioNotes => self.portfolio_notes = text(value),
            DocumentField::LifecycleLane => {
                if let FieldValue::Lane(lane) = value {
                    self.lifecycle_lane = lane;
                }
            }
            DocumentField::CurrentlyTesting => {
                self.currently_testing = match value {
                    FieldValue::Testing(target) => Some(target),
                    _ => None,
                };
            }
        }
        Ok(())
    }

    /// Read the field addressed by `path`
    ///
    /// # Errors
    /// Returns [`ModelError::NotFound`] if the owning entity is absent.
    pub fn read(&self, path: &FieldPath) -> Result<FieldValue, ModelError> {
        match path {
            FieldPath::Document { field } => Ok(self.field(*field)),
            FieldPath::Section { id, field } => self
                .section(*id)
                .map(|s| s.field(*field))
                .ok_or_else(|| ModelError::not_found("section", id)),
            FieldPath::Item { id, field } => self
                .item(*id)
                .map(|i| i.field(*field))
                .ok_or_else(|| ModelError::not_found("item", id)),
        }
    }

    /// Write the field addressed by `path`
    ///
    /// # Errors
    /// Returns [`ModelError`] if the entity is absent or the value invalid.
    pub fn write(&mut self, path: &FieldPath, value: FieldValue) -> Result<(), ModelError> {
        match path {
            FieldPath::Document { field } => self.set_field(*field, value),
            FieldPath::Section { id, field } => self
                .section_mut(*id)
                .ok_or_else(|| ModelError::not_found("section", id))?
                .set_field(*field, value),
            FieldPath::Item { id, field } => self
                .item_mut(*id)
                .ok_or_else(|| ModelError::not_found("item", id))?
                .set_field(*field, value),
        }
    }

    /// Append a section, enforcing the cap, and renumber
    ///
    /// # Errors
    /// [`ModelError::LimitExceeded`] when `limit` sections already exist;
    /// the tree is left untouched.
    pub fn insert_section(&mut self, section: Section, limit: usize) -> Result<(), ModelError> {
        if self.sections.len() >= limit {
            return Err(ModelError::LimitExceeded { limit });
        }
        self.sections.push(section);
        self.renumber_sections();
        Ok(())
    }

    /// Remove a section and renumber the rest
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the section is absent.
    pub fn remove_section(&mut self, id: SectionId) -> Result<Section, ModelError> {
        let idx = self
            .sections
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| ModelError::not_found("section", id))?;
        let removed = self.sections.remove(idx);
        self.renumber_sections();
        Ok(removed)
    }

    /// Put sections in the given order and renumber
    ///
    /// `ordered` must name every current section exactly once.
    ///
    /// # Errors
    /// [`ModelError::InvalidReorder`] otherwise; the tree is left untouched.
    pub fn reorder_sections(&mut self, ordered: &[SectionId]) -> Result<(), ModelError> {
        if ordered.len() != self.sections.len() {
            return Err(ModelError::InvalidReorder(format!(
                "expected {} sections, got {}",
                self.sections.len(),
                ordered.len()
            )));
        }
        let mut seen = HashSet::with_capacity(ordered.len());
        for id in ordered {
            if !seen.insert(*id) {
                return Err(ModelError::InvalidReorder(format!("section {id} listed twice")));
            }
            if self.section(*id).is_none() {
                return Err(ModelError::InvalidReorder(format!("unknown section {id}")));
            }
        }

        let mut remaining = std::mem::take(&mut self.sections);
        for id in ordered {
            if let Some(idx) = remaining.iter().position(|s| s.id == *id) {
                self.sections.push(remaining.swap_remove(idx));
            }
        }
        self.renumber_sections();
        Ok(())
    }

    /// Replace a section's scalar content with a server copy, keeping order and items
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the section is absent.
    pub fn merge_section(&mut self, incoming: Section) -> Result<(), ModelError> {
        let section = self
            .section_mut(incoming.id)
            .ok_or_else(|| ModelError::not_found("section", incoming.id))?;
        section.text = incoming.text;
        section.description = incoming.description;
        section.category = incoming.category;
        Ok(())
    }

    /// Append an item to a section
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the section is absent.
    pub fn insert_item(&mut self, section: SectionId, item: Item) -> Result<(), ModelError> {
        self.section_mut(section)
            .ok_or_else(|| ModelError::not_found("section", section))?
            .items
            .push(item);
        Ok(())
    }

    /// Remove an item from whichever section holds it
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the item is absent.
    pub fn remove_item(&mut self, id: ItemId) -> Result<Item, ModelError> {
        for section in &mut self.sections {
            if let Some(idx) = section.items.iter().position(|i| i.id == id) {
                return Ok(section.items.remove(idx));
            }
        }
        Err(ModelError::not_found("item", id))
    }

    /// Replace an item's scalar content with a server copy, keeping its attachments
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the item is absent.
    pub fn merge_item(&mut self, incoming: Item) -> Result<(), ModelError> {
        let item = self
            .item_mut(incoming.id)
            .ok_or_else(|| ModelError::not_found("item", incoming.id))?;
        item.description = incoming.description;
        item.status = incoming.status;
        item.notes = incoming.notes;
        item.target_date = incoming.target_date;
        Ok(())
    }

    /// Attach a file to an item
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the item is absent.
    pub fn insert_attachment(&mut self, item: ItemId, attachment: Attachment) -> Result<(), ModelError> {
        self.item_mut(item)
            .ok_or_else(|| ModelError::not_found("item", item))?
            .attachments
            .push(attachment);
        Ok(())
    }

    /// Remove an attachment from whichever item owns it
    ///
    /// # Errors
    /// [`ModelError::NotFound`] if the attachment is absent.
    pub fn remove_attachment(&mut self, id: AttachmentId) -> Result<Attachment, ModelError> {
        for item in self.sections.iter_mut().flat_map(|s| s.items.iter_mut()) {
            if let Some(idx) = item.attachments.iter().position(|a| a.id == id) {
                return Ok(item.attachments.remove(idx));
            }
        }
        Err(ModelError::not_found("attachment", id))
    }
}

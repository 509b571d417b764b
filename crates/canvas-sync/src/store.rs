//! Optimistic Document Store
//!
//! Owns the in-memory document tree. Every local change is applied here
//! synchronously, before any gateway call, and produces a new snapshot.
//! Snapshots are shared `Arc`s; mutation is copy-on-write, so a snapshot a
//! caller holds never changes under it.

use crate::error::SyncError;
use canvas_model::{
    Attachment, AttachmentId, Document, DocumentId, FieldPath, FieldValue, Item, ItemId, Section,
    SectionId,
};
use std::sync::Arc;

/// A synchronous change to the tree
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Write one scalar field
    SetField { path: FieldPath, value: FieldValue },
    /// Append a section unless `limit` sections already exist
    InsertSection { section: Section, limit: usize },
    RemoveSection(SectionId),
    /// Put sections in the given order; must name each exactly once
    ReorderSections(Vec<SectionId>),
    InsertItem { section: SectionId, item: Item },
    RemoveItem(ItemId),
    InsertAttachment { item: ItemId, attachment: Attachment },
    RemoveAttachment(AttachmentId),
    /// Server echo of a created section
    MergeSection(Section),
    /// Server echo of a created item
    MergeItem(Item),
}

/// Canonical in-memory copy of the document
#[derive(Debug, Default)]
pub struct DocumentStore {
    document: Option<Arc<Document>>,
}

impl DocumentStore {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any prior state with `document`, normalising section order
    pub fn install(&mut self, mut document: Document) -> Arc<Document> {
        document.normalize();
        let document = Arc::new(document);
        self.document = Some(Arc::clone(&document));
        document
    }

    /// Drop the document
    pub fn clear(&mut self) {
        self.document = None;
    }

    #[inline]
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.document.is_some()
    }

    /// Current snapshot
    #[inline]
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<Document>> {
        self.document.clone()
    }

    /// Id of the installed document
    ///
    /// # Errors
    /// [`SyncError::NotLoaded`] when empty.
    pub fn document_id(&self) -> Result<DocumentId, SyncError> {
        self.document
            .as_ref()
            .map(|d| d.id)
            .ok_or(SyncError::NotLoaded)
    }

    /// Borrow the installed document
    ///
    /// # Errors
    /// [`SyncError::NotLoaded`] when empty.
    pub fn document(&self) -> Result<&Document, SyncError> {
        self.document.as_deref().ok_or(SyncError::NotLoaded)
    }

    /// Read the field addressed by `path`
    ///
    /// # Errors
    /// [`SyncError::NotLoaded`] or [`SyncError::Invalid`] for unknown entities.
    pub fn read(&self, path: &FieldPath) -> Result<FieldValue, SyncError> {
        Ok(self.document()?.read(path)?)
    }

    /// Apply a change and return the new snapshot
    ///
    /// On error the tree is unchanged.
    ///
    /// # Errors
    /// [`SyncError::NotLoaded`], [`SyncError::LimitExceeded`] or
    /// [`SyncError::Invalid`] from the model.
    pub fn mutate(&mut self, change: Change) -> Result<Arc<Document>, SyncError> {
        let document = self.document.as_mut().ok_or(SyncError::NotLoaded)?;
        let tree = Arc::make_mut(document);
        match change {
            Change::SetField { path, value } => tree.write(&path, value)?,
            Change::InsertSection { section, limit } => tree.insert_section(section, limit)?,
            Change::RemoveSection(id) => {
                tree.remove_section(id)?;
            }
            Change::ReorderSections(ids) => tree.reorder_sections(&ids)?,
            Change::InsertItem { section, item } => tree.insert_item(section, item)?,
            Change::RemoveItem(id) => {
                tree.remove_item(id)?;
            }
            Change::InsertAttachment { item, attachment } => {
                tree.insert_attachment(item, attachment)?;
            }
            Change::RemoveAttachment(id) => {
                tree.remove_attachment(id)?;
            }
            Change::MergeSection(section) => tree.merge_section(section)?,
            Change::MergeItem(item) => tree.merge_item(item)?,
        }
        debug_assert!(tree.orders_are_contiguous());
        Ok(Arc::clone(document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_model::{DocumentField, SectionField, MAX_SECTIONS};
    use pretty_assertions::assert_eq;

    fn loaded(sections: usize) -> (DocumentStore, Vec<SectionId>) {
        let mut doc = Document::new(DocumentId::new());
        let ids: Vec<SectionId> = (0..sections).map(|_| SectionId::new()).collect();
        for id in &ids {
            doc.insert_section(Section::new(*id, "thesis"), MAX_SECTIONS).unwrap();
        }
        let mut store = DocumentStore::new();
        store.install(doc);
        (store, ids)
    }

    #[test]
    fn mutate_before_load_fails() {
        let mut store = DocumentStore::new();
        let err = store
            .mutate(Change::RemoveSection(SectionId::new()))
            .unwrap_err();
        assert_eq!(err, SyncError::NotLoaded);
    }

    #[test]
    fn snapshots_are_immutable() {
        let (mut store, ids) = loaded(1);
        let before = store.snapshot().unwrap();
        store
            .mutate(Change::SetField {
                path: FieldPath::section(ids[0], SectionField::Text),
                value: FieldValue::text("changed"),
            })
            .unwrap();
        assert_eq!(before.sections[0].text, "thesis");
        assert_eq!(store.snapshot().unwrap().sections[0].text, "changed");
    }

    #[test]
    fn limit_leaves_tree_unchanged() {
        let (mut store, _) = loaded(MAX_SECTIONS);
        let before = store.snapshot().unwrap();
        let err = store
            .mutate(Change::InsertSection {
                section: Section::new(SectionId::new(), "sixth"),
                limit: MAX_SECTIONS,
            })
            .unwrap_err();
        assert_eq!(err, SyncError::LimitExceeded { limit: MAX_SECTIONS });
        assert_eq!(*store.snapshot().unwrap(), *before);
    }

    #[test]
    fn remove_renumbers() {
        let (mut store, ids) = loaded(3);
        let doc = store.mutate(Change::RemoveSection(ids[1])).unwrap();
        assert_eq!(
            doc.sections.iter().map(|s| s.order).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn install_normalises_gaps() {
        let mut doc = Document::new(DocumentId::new());
        let mut a = Section::new(SectionId::new(), "a");
        a.order = 4;
        let mut b = Section::new(SectionId::new(), "b");
        b.order = 2;
        doc.sections = vec![a, b];
        let mut store = DocumentStore::new();
        let doc = store.install(doc);
        assert_eq!(doc.sections[0].text, "b");
        assert!(doc.orders_are_contiguous());
    }

    #[test]
    fn read_document_field() {
        let (store, _) = loaded(0);
        let value = store
            .read(&FieldPath::document(DocumentField::ProductName))
            .unwrap();
        assert!(value.is_empty());
    }
}

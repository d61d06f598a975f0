//! Representation of a document as stored within a page.
//!
//! A [`Document`] is the atomic unit CrushDB persists: an application-supplied or
//! generated 64-bit id, an ordered field map (see [`super::codec`]), and the
//! bookkeeping a page needs to frame it on disk (sizes, tombstone flag, and — once
//! written — the [`PageOffsetReference`] binding it to a page and byte offset).
//!
//! Documents are created by the caller, mutated only by re-insert, and destroyed by
//! tombstone marking followed by a later `compactPage`.

use super::codec::{BsonValue, FieldMap};

/// `(pageId, offset)`; immutable once issued by the page at insert time. The only
/// currency indexes store — resolving a reference always goes back through the page
/// manager, never through a cached `Document`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageOffsetReference {
    pub page_id: u64,
    pub offset: u32,
}

impl PageOffsetReference {
    #[must_use]
    pub fn new(page_id: u64, offset: u32) -> Self {
        Self { page_id, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentStatus {
    Active,
    Tombstone,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub document_id: u64,
    pub fields: FieldMap,
    pub page_id: Option<u64>,
    pub offset: Option<u32>,
    pub decompressed_size: u32,
    pub compressed_size: u32,
    pub status: DocumentStatus,
}

impl Document {
    #[must_use]
    pub fn new(document_id: u64, fields: FieldMap) -> Self {
        Self {
            document_id,
            fields,
            page_id: None,
            offset: None,
            decompressed_size: 0,
            compressed_size: 0,
            status: DocumentStatus::Active,
        }
    }

    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.status == DocumentStatus::Tombstone
    }

    /// Looks up a field's value by name, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&BsonValue> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    #[must_use]
    pub fn page_offset_reference(&self) -> Option<PageOffsetReference> {
        match (self.page_id, self.offset) {
            (Some(page_id), Some(offset)) => Some(PageOffsetReference::new(page_id, offset)),
            _ => None,
        }
    }
}

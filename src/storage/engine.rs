//! The storage engine façade: the single entry point the rest of CrushDB (and, in
//! a full deployment, the query layer) uses to mutate and read documents.
//!
//! Every mutating call follows the same happens-before chain: journal append, then
//! the page-layer effect, then index maintenance. A crash between any two steps is
//! recoverable by replaying the journal; a crash mid-step is the reason the journal
//! write comes first.

use std::sync::Mutex;

use log::info;
use thiserror::Error;

use super::codec::BsonValue;
use super::document::Document;
use super::index::{IndexError, IndexManager};
use super::journal::{Journal, JournalError, JournalOp};
use super::pager::{PageManager, PageManagerError};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    PageManager(#[from] PageManagerError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Owns the three subsystems a query needs and wires them together per the
/// happens-before chain above. This is an explicit, constructible struct rather
/// than process-wide singleton state.
pub struct StorageEngine {
    journal: Journal,
    page_manager: PageManager,
    index_manager: Mutex<IndexManager>,
}

impl StorageEngine {
    #[must_use]
    pub fn new(journal: Journal, page_manager: PageManager, index_manager: IndexManager) -> Self {
        Self {
            journal,
            page_manager,
            index_manager: Mutex::new(index_manager),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn page_manager(&self) -> &PageManager {
        &self.page_manager
    }

    /// Inserts `doc` into `crate_name`, journaling first, then populating every
    /// index on the crate whose field is present in the document.
    pub fn insert(&self, crate_name: &str, doc: Document) -> Result<Document, StorageError> {
        self.journal.append(JournalOp::Write, crate_name, doc.document_id)?;
        let inserted = self.page_manager.insert_document(doc)?;
        self.index_matching(crate_name, &inserted, None)?;
        Ok(inserted)
    }

    /// Same as [`Self::insert`], but only the named indexes are updated.
    pub fn insert_scoped(
        &self,
        crate_name: &str,
        doc: Document,
        index_names: &[String],
    ) -> Result<Document, StorageError> {
        self.journal.append(JournalOp::Write, crate_name, doc.document_id)?;
        let inserted = self.page_manager.insert_document(doc)?;
        self.index_matching(crate_name, &inserted, Some(index_names))?;
        Ok(inserted)
    }

    fn index_matching(
        &self,
        crate_name: &str,
        doc: &Document,
        only: Option<&[String]>,
    ) -> Result<(), StorageError> {
        let reference = doc
            .page_offset_reference()
            .expect("page manager always stamps page_id/offset on insert");
        let mut index_manager = self.index_manager.lock().expect("index manager lock poisoned");
        let definitions: Vec<_> = index_manager
            .indexes_for_crate(crate_name)
            .into_iter()
            .filter(|def| only.is_none_or(|names| names.iter().any(|n| n == &def.index_name)))
            .map(|def| (def.index_name.clone(), def.field_name.clone()))
            .collect();
        for (index_name, field_name) in definitions {
            if let Some(value) = doc.field(&field_name).cloned() {
                index_manager.insert(crate_name, &index_name, value, reference)?;
            }
        }
        Ok(())
    }

    /// Deletes a document by tombstoning its page frame. The journal is written
    /// before the page-layer effect, matching insert's ordering.
    pub fn delete(&self, crate_name: &str, doc: &Document) -> Result<(), StorageError> {
        let reference = doc
            .page_offset_reference()
            .ok_or_else(|| StorageError::PageManager(PageManagerError::PageNotFound(0)))?;
        self.journal.append(JournalOp::Delete, crate_name, doc.document_id)?;
        self.page_manager.delete_document(reference, doc.document_id)?;
        Ok(())
    }

    /// Exact-match lookup through `index_name`. A missing index is not fatal — it
    /// behaves as though the index returned no matches.
    pub fn find(&self, crate_name: &str, index_name: &str, value: BsonValue) -> Result<Vec<Document>, StorageError> {
        let references = {
            let index_manager = self.index_manager.lock().expect("index manager lock poisoned");
            match index_manager.search(crate_name, index_name, value) {
                Ok(refs) => refs,
                Err(IndexError::NotFound { .. }) => return Ok(Vec::new()),
                Err(e) => return Err(StorageError::from(e)),
            }
        };
        references
            .into_iter()
            .map(|r| self.page_manager.retrieve_document(r).map_err(StorageError::from))
            .collect()
    }

    /// Inclusive range lookup through `index_name`.
    pub fn range_find(
        &self,
        crate_name: &str,
        index_name: &str,
        lo: BsonValue,
        hi: BsonValue,
    ) -> Result<Vec<Document>, StorageError> {
        let references = {
            let index_manager = self.index_manager.lock().expect("index manager lock poisoned");
            match index_manager.range_search(crate_name, index_name, lo, hi) {
                Ok(refs) => refs,
                Err(IndexError::NotFound { .. }) => return Ok(Vec::new()),
                Err(e) => return Err(StorageError::from(e)),
            }
        };
        references
            .into_iter()
            .map(|r| self.page_manager.retrieve_document(r).map_err(StorageError::from))
            .collect()
    }

    /// Linear fallback scan over pages currently resident in memory. Logs a
    /// recommendation to build an index; documents evicted to disk are not
    /// considered (see the page manager's `scan_cached`).
    pub fn scan(&self, field_name: &str, value: &BsonValue) -> Result<Vec<Document>, StorageError> {
        info!("scanning in-memory pages for {field_name} = {value:?}; consider creating an index");
        let candidates = self.page_manager.scan_cached()?;
        Ok(candidates
            .into_iter()
            .filter(|doc| doc.field(field_name) == Some(value))
            .collect())
    }

    /// Registers `definitions` with the index manager. Exposed so the crate layer
    /// can create indexes without reaching around the façade.
    pub fn with_index_manager<T>(&self, f: impl FnOnce(&mut IndexManager) -> T) -> T {
        let mut index_manager = self.index_manager.lock().expect("index manager lock poisoned");
        f(&mut index_manager)
    }
}

//! Disk-backed page management: the [`PageManager`] owns the data file, the
//! metadata file, and an LRU-bounded in-memory page cache.
//!
//! Logical page ids map to byte offsets in `crushdb.db` by `pageId * pageSize`;
//! the highest allocated id is tracked both in an in-memory atomic counter and in
//! `meta.dat` so it survives a restart. The cache and the writable-page set (pages
//! currently being targeted by inserts) live behind one [`Mutex`] — lookups,
//! admissions, and eviction all execute under that single monitor, so a page is
//! never observed half-evicted.
//!
//! Eviction flushes a dirty page to disk before it is dropped from the cache;
//! nothing is ever silently lost.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use log::{debug, trace, warn};
use lru::LruCache;
use thiserror::Error;

use super::codec;
use super::document::{Document, PageOffsetReference};
use super::metadata::{Metadata, MetadataError, METADATA_SIZE};
use super::page::{Page, PageError};

/// Default number of pages the cache holds before evicting the least-recently-used entry.
pub const DEFAULT_CACHE_MAX_PAGES: usize = 8192;

#[derive(Debug, Error)]
pub enum PageManagerError {
    #[error("page {0} not found")]
    PageNotFound(u64),
    #[error("metadata file is required for eager load but is missing or unreadable")]
    MissingMetadata,
    #[error(transparent)]
    Page(#[from] PageError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tuning knobs for the page cache and insert behavior, derived from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct PageManagerConfig {
    pub page_size: usize,
    pub cache_max_pages: usize,
    pub eager_load_pages: bool,
    pub auto_compress_on_insert: bool,
}

impl Default for PageManagerConfig {
    fn default() -> Self {
        Self {
            page_size: super::page::DEFAULT_PAGE_SIZE,
            cache_max_pages: DEFAULT_CACHE_MAX_PAGES,
            eager_load_pages: false,
            auto_compress_on_insert: false,
        }
    }
}

impl PageManagerConfig {
    /// Bucket capacity for the underlying cache table, sized with a 0.75 load
    /// factor against `cache_max_pages` so the table doesn't resize under normal
    /// operation.
    fn initial_table_capacity(&self) -> usize {
        ((self.cache_max_pages as f64) / 0.75).ceil() as usize
    }
}

struct CacheState {
    cache: LruCache<u64, Page>,
    writable: Vec<u64>,
}

pub struct PageManager {
    data_path: PathBuf,
    config: PageManagerConfig,
    last_page_id: AtomicI64,
    data_file: Mutex<File>,
    meta_file: Mutex<File>,
    state: Mutex<CacheState>,
}

impl PageManager {
    /// Opens (creating if absent) the data and metadata files at the given paths.
    pub fn open(
        data_path: impl AsRef<Path>,
        meta_path: impl AsRef<Path>,
        config: PageManagerConfig,
    ) -> Result<Self, PageManagerError> {
        let data_path = data_path.as_ref().to_path_buf();
        let meta_path = meta_path.as_ref().to_path_buf();

        let data_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&data_path)?;

        let mut meta_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&meta_path)?;

        let metadata = if meta_file.metadata()?.len() == METADATA_SIZE as u64 {
            let mut buf = [0u8; METADATA_SIZE];
            meta_file.read_exact(&mut buf)?;
            Metadata::from_bytes(&buf)?
        } else {
            let m = Metadata::default();
            meta_file.seek(SeekFrom::Start(0))?;
            meta_file.write_all(&m.to_bytes())?;
            meta_file.flush()?;
            m
        };

        debug!(
            "page manager opened: last_page_id={} page_size={} cache_max_pages={} (table capacity {})",
            metadata.last_page_id,
            config.page_size,
            config.cache_max_pages,
            config.initial_table_capacity(),
        );

        let cap = NonZeroUsize::new(config.cache_max_pages.max(1)).unwrap();
        let manager = Self {
            data_path,
            config,
            last_page_id: AtomicI64::new(metadata.last_page_id),
            data_file: Mutex::new(data_file),
            meta_file: Mutex::new(meta_file),
            state: Mutex::new(CacheState {
                cache: LruCache::new(cap),
                writable: Vec::new(),
            }),
        };

        if manager.config.eager_load_pages {
            manager.load_all_pages_on_startup()?;
        }

        Ok(manager)
    }

    /// Loads every page from `0..=lastPageId` into the cache eagerly; used when
    /// `eagerLoadPages` is configured. A missing metadata file at this point is
    /// fatal, since the caller has explicitly asked for full preload.
    pub fn load_all_pages_on_startup(&self) -> Result<(), PageManagerError> {
        let last = self.last_page_id.load(Ordering::SeqCst);
        if last < 0 {
            return Ok(());
        }
        if self.meta_file.lock().expect("meta lock poisoned").metadata()?.len()
            != METADATA_SIZE as u64
        {
            return Err(PageManagerError::MissingMetadata);
        }

        let mut state = self.state.lock().expect("cache lock poisoned");
        for id in 0..=(last as u64) {
            if state.cache.contains(&id) {
                continue;
            }
            match self.load_page_from_disk(id) {
                Ok(page) => self.admit(&mut state, id, page)?,
                Err(e) => warn!("could not eagerly load page {id}: {e}"),
            }
        }
        Ok(())
    }

    /// Inserts a document, reusing a writable page with room for it or allocating
    /// a fresh page when none fits.
    pub fn insert_document(&self, doc: Document) -> Result<Document, PageManagerError> {
        let encoded_len = codec::encode(&doc.fields).len() as u32;
        let mut state = self.state.lock().expect("cache lock poisoned");
        let page_id = self.find_or_allocate_writable(&mut state, encoded_len)?;
        let page = state
            .cache
            .get_mut(&page_id)
            .ok_or(PageManagerError::PageNotFound(page_id))?;
        let inserted = page.insert_document(doc, self.config.auto_compress_on_insert)?;
        Ok(inserted)
    }

    /// Resolves a stored reference back into a [`Document`], loading its page from
    /// disk if it isn't currently cached. A tombstoned frame is reported the same
    /// way as a missing offset, since callers without an index have no other way
    /// to learn a reference was deleted.
    pub fn retrieve_document(
        &self,
        reference: PageOffsetReference,
    ) -> Result<Document, PageManagerError> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        if !state.cache.contains(&reference.page_id) {
            let page = self.load_page_from_disk(reference.page_id)?;
            self.admit(&mut state, reference.page_id, page)?;
        }
        let page = state
            .cache
            .get(&reference.page_id)
            .ok_or(PageManagerError::PageNotFound(reference.page_id))?;
        let doc = page.read_document_at_offset(reference.offset)?;
        if doc.is_tombstone() {
            return Err(PageManagerError::Page(PageError::DocumentNotFound(doc.document_id)));
        }
        Ok(doc)
    }

    /// Deletes (tombstones) a document already resident on its page.
    pub fn delete_document(&self, reference: PageOffsetReference, document_id: u64) -> Result<(), PageManagerError> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        if !state.cache.contains(&reference.page_id) {
            let page = self.load_page_from_disk(reference.page_id)?;
            self.admit(&mut state, reference.page_id, page)?;
        }
        let page = state
            .cache
            .get_mut(&reference.page_id)
            .ok_or(PageManagerError::PageNotFound(reference.page_id))?;
        page.delete_document(document_id).map_err(PageManagerError::from)
    }

    /// Flushes a single page to disk if dirty, clearing its dirty flag.
    pub fn flush(&self, page_id: u64) -> Result<(), PageManagerError> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        let page = state
            .cache
            .peek(&page_id)
            .ok_or(PageManagerError::PageNotFound(page_id))?
            .clone();
        if page.dirty {
            self.flush_page_to_disk(&page)?;
        }
        if let Some(p) = state.cache.get_mut(&page_id) {
            p.dirty = false;
        }
        Ok(())
    }

    /// Flushes every dirty page currently resident in the cache.
    pub fn flush_all(&self) -> Result<(), PageManagerError> {
        let mut state = self.state.lock().expect("cache lock poisoned");
        let dirty_ids: Vec<u64> = state
            .cache
            .iter()
            .filter(|(_, p)| p.dirty)
            .map(|(id, _)| *id)
            .collect();
        for id in dirty_ids {
            let page = state.cache.peek(&id).expect("id came from cache iteration").clone();
            self.flush_page_to_disk(&page)?;
            if let Some(p) = state.cache.get_mut(&id) {
                p.dirty = false;
            }
        }
        Ok(())
    }

    /// Every active document on every page currently resident in the cache. This is
    /// the in-memory-only fallback `scan` uses when no index covers a field — pages
    /// evicted to disk are not consulted.
    pub fn scan_cached(&self) -> Result<Vec<Document>, PageManagerError> {
        let state = self.state.lock().expect("cache lock poisoned");
        let mut out = Vec::new();
        for (_, page) in state.cache.iter() {
            out.extend(page.active_documents()?);
        }
        Ok(out)
    }

    /// Scans every resident writable page for one with room for `decompressed_size`
    /// bytes, pruning entries that no longer fit or have fallen out of cache.
    /// Allocates and admits a fresh page if none qualify.
    fn find_or_allocate_writable(
        &self,
        state: &mut CacheState,
        decompressed_size: u32,
    ) -> Result<u64, PageManagerError> {
        let mut found = None;
        let mut stale = Vec::new();
        for &page_id in &state.writable {
            match state.cache.get(&page_id) {
                Some(page) if page.has_space_for(decompressed_size) => {
                    found = Some(page_id);
                    break;
                }
                Some(_) => stale.push(page_id),
                None => stale.push(page_id),
            }
        }
        state.writable.retain(|id| !stale.contains(id));
        if let Some(page_id) = found {
            return Ok(page_id);
        }

        let new_id = self.allocate_page_id()?;
        let page = Page::new(new_id, self.config.page_size);
        self.admit(state, new_id, page)?;
        state.writable.push(new_id);
        Ok(new_id)
    }

    /// Bumps `lastPageId` atomically and persists the new high-water mark to
    /// `meta.dat` before returning the id, so concurrent inserters never race on
    /// the same allocation.
    fn allocate_page_id(&self) -> Result<u64, PageManagerError> {
        let id = self.last_page_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.persist_metadata(id)?;
        trace!("allocated page {id}");
        Ok(id as u64)
    }

    fn persist_metadata(&self, last_page_id: i64) -> Result<(), PageManagerError> {
        let metadata = Metadata {
            last_page_id,
            ..Metadata::default()
        };
        let mut file = self.meta_file.lock().expect("meta lock poisoned");
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&metadata.to_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Inserts `page` into the cache, flushing and evicting the least-recently-used
    /// entry first if the cache is at capacity.
    fn admit(&self, state: &mut CacheState, page_id: u64, page: Page) -> Result<(), PageManagerError> {
        if let Some((evicted_id, evicted_page)) = state.cache.push(page_id, page) {
            if evicted_id != page_id {
                if evicted_page.dirty {
                    self.flush_page_to_disk(&evicted_page)?;
                }
                state.writable.retain(|id| *id != evicted_id);
            }
        }
        Ok(())
    }

    fn load_page_from_disk(&self, page_id: u64) -> Result<Page, PageManagerError> {
        let mut file = self.data_file.lock().expect("data file lock poisoned");
        let offset = page_id * self.config.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; self.config.page_size];
        file.read_exact(&mut buf).map_err(|_| PageManagerError::PageNotFound(page_id))?;
        Page::from_bytes(&buf).map_err(PageManagerError::from)
    }

    fn flush_page_to_disk(&self, page: &Page) -> Result<(), PageManagerError> {
        let mut file = self.data_file.lock().expect("data file lock poisoned");
        let offset = page.page_id * self.config.page_size as u64;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.as_bytes())?;
        file.flush()?;
        trace!("flushed page {} to {}", page.page_id, self.data_path.display());
        Ok(())
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        if let Err(e) = self.flush_all() {
            warn!("error flushing pages on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::BsonValue;
    use tempdir::TempDir;

    fn manager(dir: &TempDir, cache_max_pages: usize) -> PageManager {
        PageManager::open(
            dir.path().join("crushdb.db"),
            dir.path().join("meta.dat"),
            PageManagerConfig {
                page_size: super::super::page::DEFAULT_PAGE_SIZE,
                cache_max_pages,
                eager_load_pages: false,
                auto_compress_on_insert: false,
            },
        )
        .unwrap()
    }

    fn vehicle(id: u64, make: &str) -> Document {
        Document::new(id, vec![("make".to_string(), BsonValue::String(make.to_string()))])
    }

    #[test]
    fn insert_then_retrieve_round_trips() {
        let dir = TempDir::new("crushdb-pager").unwrap();
        let mgr = manager(&dir, 8);
        let inserted = mgr.insert_document(vehicle(1, "Subaru")).unwrap();
        let reference = inserted.page_offset_reference().unwrap();
        let fetched = mgr.retrieve_document(reference).unwrap();
        assert_eq!(fetched.document_id, 1);
        assert_eq!(fetched.field("make"), Some(&BsonValue::String("Subaru".to_string())));
    }

    #[test]
    fn allocates_new_page_when_current_is_full() {
        let dir = TempDir::new("crushdb-pager").unwrap();
        let mgr = manager(&dir, 8);
        let mut last_page = None;
        for i in 0..2000u64 {
            let inserted = mgr.insert_document(vehicle(i, "Acura")).unwrap();
            last_page = inserted.page_id;
        }
        assert!(last_page.unwrap() > 0, "inserts should have spilled onto further pages");
    }

    #[test]
    fn eviction_flushes_dirty_pages_to_disk() {
        let dir = TempDir::new("crushdb-pager").unwrap();
        let mgr = manager(&dir, 1);
        let first = mgr.insert_document(vehicle(1, "Honda")).unwrap();
        let first_ref = first.page_offset_reference().unwrap();
        // force a second page to be admitted, evicting the first from a 1-entry cache
        for i in 2..2000u64 {
            mgr.insert_document(vehicle(i, "Honda")).unwrap();
        }
        let fetched = mgr.retrieve_document(first_ref).unwrap();
        assert_eq!(fetched.document_id, 1);
    }

    #[test]
    fn metadata_persists_across_reopen() {
        let dir = TempDir::new("crushdb-pager").unwrap();
        {
            let mgr = manager(&dir, 8);
            for i in 0..2000u64 {
                mgr.insert_document(vehicle(i, "Kia")).unwrap();
            }
        }
        let mgr = manager(&dir, 8);
        let last = mgr.last_page_id.load(Ordering::SeqCst);
        assert!(last > 0);
    }

    #[test]
    fn delete_document_tombstones_in_place() {
        let dir = TempDir::new("crushdb-pager").unwrap();
        let mgr = manager(&dir, 8);
        let inserted = mgr.insert_document(vehicle(7, "Mazda")).unwrap();
        let reference = inserted.page_offset_reference().unwrap();
        mgr.delete_document(reference, 7).unwrap();
        let err = mgr.retrieve_document(reference).unwrap_err();
        assert!(matches!(err, PageManagerError::Page(PageError::DocumentNotFound(7))));
    }
}

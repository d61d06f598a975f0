//! Fixed-size slotted page.
//!
//! A [`Page`] is the unit of on-disk storage, cache admission, flush, and split. It
//! holds a fixed-width header followed by an append-only sequence of per-document
//! frames. Documents never cross page boundaries; tombstoned frames remain in place
//! until [`Page::compact`] reclaims their space.
//!
//! # Header layout (fixed order, big-endian)
//!
//! ```text
//! u32 magic
//! u64 pageId
//! u32 numDocuments
//! u16 headerSize
//! i64 prev        (-1 if none)
//! i64 next        (-1 if none)
//! u32 available
//! u8  compressedFlag
//! ```
//!
//! The dirty flag is in-memory only and never written to disk.
//!
//! # Per-document frame
//!
//! ```text
//! u64 documentId
//! u64 pageId
//! u32 decompressedSize
//! u32 compressedSize
//! u8  deletedFlag   (1 = active, 0 = tombstone)
//! bytes[...] body   (compressedSize bytes if compressedSize > 0, else decompressedSize bytes)
//! ```
//!
//! # See also
//! - [`super::codec`]: encodes/decodes the field bytes carried as a frame's body.
//! - [`super::pager`]: owns pages, drives allocation, flush, and the cache.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use log::trace;
use thiserror::Error;

use super::codec::{self, CodecError, FieldMap};
use super::document::{Document, DocumentStatus};

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const PAGE_MAGIC: u32 = 0x4350_4147; // "CPAG"

const MAGIC_SIZE: usize = 4;
const PAGE_ID_SIZE: usize = 8;
const NUM_DOCS_SIZE: usize = 4;
const HEADER_SIZE_FIELD_SIZE: usize = 2;
const PREV_SIZE: usize = 8;
const NEXT_SIZE: usize = 8;
const AVAILABLE_SIZE: usize = 4;
const COMPRESSED_FLAG_SIZE: usize = 1;

pub const HEADER_SIZE: usize = MAGIC_SIZE
    + PAGE_ID_SIZE
    + NUM_DOCS_SIZE
    + HEADER_SIZE_FIELD_SIZE
    + PREV_SIZE
    + NEXT_SIZE
    + AVAILABLE_SIZE
    + COMPRESSED_FLAG_SIZE;

const FRAME_DOC_ID_SIZE: usize = 8;
const FRAME_PAGE_ID_SIZE: usize = 8;
const FRAME_DECOMPRESSED_SIZE_SIZE: usize = 4;
const FRAME_COMPRESSED_SIZE_SIZE: usize = 4;
const FRAME_DELETED_FLAG_SIZE: usize = 1;

/// Fixed per-document frame metadata size, not counting the variable-length body.
pub const FRAME_METADATA_SIZE: usize = FRAME_DOC_ID_SIZE
    + FRAME_PAGE_ID_SIZE
    + FRAME_DECOMPRESSED_SIZE_SIZE
    + FRAME_COMPRESSED_SIZE_SIZE
    + FRAME_DELETED_FLAG_SIZE;

#[derive(Debug, Error, PartialEq)]
pub enum PageError {
    #[error("page {page_id} has no space for a document of {requested} bytes ({available} available)")]
    Full {
        page_id: u64,
        requested: u32,
        available: u32,
    },
    #[error("document {0} not found on page")]
    DocumentNotFound(u64),
    #[error("no document frame at offset {0}")]
    OffsetNotFound(u32),
    #[error("page {0} is already compressed")]
    AlreadyCompressed(u64),
    #[error("page {0} is already decompressed")]
    AlreadyDecompressed(u64),
    #[error("compression failure: {0}")]
    Compression(String),
    #[error("document codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("page corruption: {0}")]
    Corruption(String),
}

#[derive(Debug, Clone, PartialEq)]
struct DocumentFrame {
    offset: u32,
    document_id: u64,
    page_id: u64,
    decompressed_size: u32,
    compressed_size: u32,
    active: bool,
    body: Vec<u8>,
}

impl DocumentFrame {
    fn stored_len(&self) -> usize {
        if self.compressed_size > 0 {
            self.compressed_size as usize
        } else {
            self.decompressed_size as usize
        }
    }

    fn occupied(&self) -> usize {
        FRAME_METADATA_SIZE + self.stored_len()
    }

    fn decode_fields(&self) -> Result<FieldMap, PageError> {
        if self.compressed_size > 0 {
            let mut decoder = ZlibDecoder::new(self.body.as_slice());
            let mut raw = Vec::with_capacity(self.decompressed_size as usize);
            decoder
                .read_to_end(&mut raw)
                .map_err(|e| PageError::Compression(e.to_string()))?;
            Ok(codec::decode(&raw)?)
        } else {
            Ok(codec::decode(&self.body)?)
        }
    }

    fn to_document(&self) -> Result<Document, PageError> {
        Ok(Document {
            document_id: self.document_id,
            fields: self.decode_fields()?,
            page_id: Some(self.page_id),
            offset: Some(self.offset),
            decompressed_size: self.decompressed_size,
            compressed_size: self.compressed_size,
            status: if self.active {
                DocumentStatus::Active
            } else {
                DocumentStatus::Tombstone
            },
        })
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub page_id: u64,
    pub page_size: usize,
    pub prev: Option<u64>,
    pub next: Option<u64>,
    pub compressed: bool,
    pub dirty: bool,
    frames: Vec<DocumentFrame>,
}

impl Page {
    #[must_use]
    pub fn new(page_id: u64, page_size: usize) -> Self {
        Self {
            page_id,
            page_size,
            prev: None,
            next: None,
            compressed: false,
            dirty: true,
            frames: Vec::new(),
        }
    }

    #[must_use]
    pub fn num_documents(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.frames.iter().filter(|f| f.active).count()
    }

    fn occupied(&self) -> usize {
        HEADER_SIZE + self.frames.iter().map(DocumentFrame::occupied).sum::<usize>()
    }

    #[must_use]
    pub fn available(&self) -> u32 {
        (self.page_size - self.occupied()) as u32
    }

    /// True iff `available >= metadataSize + decompressedSize`.
    #[must_use]
    pub fn has_space_for(&self, decompressed_size: u32) -> bool {
        self.available() >= (FRAME_METADATA_SIZE as u32) + decompressed_size
    }

    /// Appends `doc` to the page, stamping its `page_id`/`offset`. Returns the
    /// inserted document (with those fields populated) or `PageError::Full` if
    /// `has_space_for` would reject it. On `Full`, the page is left unmodified.
    pub fn insert_document(
        &mut self,
        mut doc: Document,
        auto_compress: bool,
    ) -> Result<Document, PageError> {
        let encoded = codec::encode(&doc.fields);
        let decompressed_size = encoded.len() as u32;

        if !self.has_space_for(decompressed_size) {
            return Err(PageError::Full {
                page_id: self.page_id,
                requested: decompressed_size,
                available: self.available(),
            });
        }

        let (body, compressed_size) = if auto_compress {
            let compressed = zlib_compress(&encoded)?;
            let len = compressed.len() as u32;
            (compressed, len)
        } else {
            (encoded, 0)
        };

        let offset = self.next_offset();
        let frame = DocumentFrame {
            offset,
            document_id: doc.document_id,
            page_id: self.page_id,
            decompressed_size,
            compressed_size,
            active: true,
            body,
        };
        self.frames.push(frame);
        self.dirty = true;

        doc.page_id = Some(self.page_id);
        doc.offset = Some(offset);
        doc.decompressed_size = decompressed_size;
        doc.compressed_size = compressed_size;
        doc.status = DocumentStatus::Active;
        trace!(
            "page {} gained document {} at offset {}",
            self.page_id, doc.document_id, offset
        );
        Ok(doc)
    }

    fn next_offset(&self) -> u32 {
        let used: usize = self.frames.iter().map(DocumentFrame::occupied).sum();
        (HEADER_SIZE + used) as u32
    }

    /// Linear scan skipping tombstones; returns the first active match.
    pub fn retrieve_document(&self, document_id: u64) -> Result<Document, PageError> {
        self.frames
            .iter()
            .find(|f| f.active && f.document_id == document_id)
            .ok_or(PageError::DocumentNotFound(document_id))?
            .to_document()
    }

    /// Decodes the frame at `offset` directly, without scanning by id. Returns
    /// whatever frame occupies that offset, active or tombstoned — callers driven by
    /// an index are expected to have already filtered on currency.
    pub fn read_document_at_offset(&self, offset: u32) -> Result<Document, PageError> {
        self.frames
            .iter()
            .find(|f| f.offset == offset)
            .ok_or(PageError::OffsetNotFound(offset))?
            .to_document()
    }

    /// Decodes every active (non-tombstoned) document on the page, in frame order.
    pub fn active_documents(&self) -> Result<Vec<Document>, PageError> {
        self.frames.iter().filter(|f| f.active).map(DocumentFrame::to_document).collect()
    }

    /// Flips the frame's `deletedFlag` to tombstone. Does not reclaim space.
    /// Tombstones a frame in place. `num_documents()` still counts it until the
    /// next `compact()` — only `active_count()` drops immediately.
    pub fn delete_document(&mut self, document_id: u64) -> Result<(), PageError> {
        let frame = self
            .frames
            .iter_mut()
            .find(|f| f.active && f.document_id == document_id)
            .ok_or(PageError::DocumentNotFound(document_id))?;
        frame.active = false;
        self.dirty = true;
        Ok(())
    }

    /// Rewrites the page in place, dropping tombstoned frames and preserving the
    /// order of surviving documents. Offsets of survivors change; callers holding a
    /// cached `PageOffsetReference` must re-resolve it through an index.
    pub fn compact(&mut self) -> bool {
        let survivors: Vec<DocumentFrame> = self.frames.drain(..).filter(|f| f.active).collect();
        let mut offset = HEADER_SIZE as u32;
        self.frames = survivors
            .into_iter()
            .map(|mut f| {
                f.offset = offset;
                offset += f.occupied() as u32;
                f
            })
            .collect();
        self.dirty = true;
        true
    }

    /// Moves the rightmost `ceil(active/2)` documents into a freshly allocated page
    /// with id `new_page_id`. Assumes the page has already been compacted (no
    /// tombstones present). Returns the new page; the caller (the page manager) is
    /// responsible for fixing up any third page's `prev` pointer.
    pub fn split(&mut self, new_page_id: u64) -> Page {
        let move_count = self.frames.len().div_ceil(2);
        let split_at = self.frames.len() - move_count;
        let moved = self.frames.split_off(split_at);

        let mut new_page = Page::new(new_page_id, self.page_size);
        let mut offset = HEADER_SIZE as u32;
        new_page.frames = moved
            .into_iter()
            .map(|mut f| {
                f.page_id = new_page_id;
                f.offset = offset;
                offset += f.occupied() as u32;
                f
            })
            .collect();

        new_page.prev = Some(self.page_id);
        new_page.next = self.next;
        self.next = Some(new_page_id);

        self.dirty = true;
        new_page.dirty = true;
        new_page
    }

    /// Compresses every currently-decompressed frame's body. Errors if the page is
    /// already marked compressed.
    pub fn compress(&mut self) -> Result<(), PageError> {
        if self.compressed {
            return Err(PageError::AlreadyCompressed(self.page_id));
        }
        for frame in &mut self.frames {
            if frame.compressed_size == 0 {
                let compressed = zlib_compress(&frame.body)?;
                frame.compressed_size = compressed.len() as u32;
                frame.body = compressed;
            }
        }
        self.compressed = true;
        self.dirty = true;
        self.reflow_offsets();
        Ok(())
    }

    /// Decompresses every compressed frame's body. Errors if the page is already
    /// decompressed, naming the page id in the error message.
    pub fn decompress(&mut self) -> Result<(), PageError> {
        if !self.compressed {
            return Err(PageError::AlreadyDecompressed(self.page_id));
        }
        for frame in &mut self.frames {
            if frame.compressed_size > 0 {
                let mut decoder = ZlibDecoder::new(frame.body.as_slice());
                let mut raw = Vec::with_capacity(frame.decompressed_size as usize);
                decoder
                    .read_to_end(&mut raw)
                    .map_err(|e| PageError::Compression(e.to_string()))?;
                frame.body = raw;
                frame.compressed_size = 0;
            }
        }
        self.compressed = false;
        self.dirty = true;
        self.reflow_offsets();
        Ok(())
    }

    fn reflow_offsets(&mut self) {
        let mut offset = HEADER_SIZE as u32;
        for frame in &mut self.frames {
            frame.offset = offset;
            offset += frame.occupied() as u32;
        }
    }

    /// Serializes the page to exactly `page_size` bytes.
    #[must_use]
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.page_size];
        let mut pos = 0;

        buf[pos..pos + MAGIC_SIZE].copy_from_slice(&PAGE_MAGIC.to_be_bytes());
        pos += MAGIC_SIZE;
        buf[pos..pos + PAGE_ID_SIZE].copy_from_slice(&self.page_id.to_be_bytes());
        pos += PAGE_ID_SIZE;
        buf[pos..pos + NUM_DOCS_SIZE].copy_from_slice(&(self.frames.len() as u32).to_be_bytes());
        pos += NUM_DOCS_SIZE;
        buf[pos..pos + HEADER_SIZE_FIELD_SIZE].copy_from_slice(&(HEADER_SIZE as u16).to_be_bytes());
        pos += HEADER_SIZE_FIELD_SIZE;
        buf[pos..pos + PREV_SIZE].copy_from_slice(&self.prev.map_or(-1i64, |v| v as i64).to_be_bytes());
        pos += PREV_SIZE;
        buf[pos..pos + NEXT_SIZE].copy_from_slice(&self.next.map_or(-1i64, |v| v as i64).to_be_bytes());
        pos += NEXT_SIZE;
        buf[pos..pos + AVAILABLE_SIZE].copy_from_slice(&self.available().to_be_bytes());
        pos += AVAILABLE_SIZE;
        buf[pos] = u8::from(self.compressed);
        pos += COMPRESSED_FLAG_SIZE;

        debug_assert_eq!(pos, HEADER_SIZE);

        for frame in &self.frames {
            buf[pos..pos + FRAME_DOC_ID_SIZE].copy_from_slice(&frame.document_id.to_be_bytes());
            pos += FRAME_DOC_ID_SIZE;
            buf[pos..pos + FRAME_PAGE_ID_SIZE].copy_from_slice(&frame.page_id.to_be_bytes());
            pos += FRAME_PAGE_ID_SIZE;
            buf[pos..pos + FRAME_DECOMPRESSED_SIZE_SIZE]
                .copy_from_slice(&frame.decompressed_size.to_be_bytes());
            pos += FRAME_DECOMPRESSED_SIZE_SIZE;
            buf[pos..pos + FRAME_COMPRESSED_SIZE_SIZE]
                .copy_from_slice(&frame.compressed_size.to_be_bytes());
            pos += FRAME_COMPRESSED_SIZE_SIZE;
            buf[pos] = if frame.active { 1 } else { 0 };
            pos += FRAME_DELETED_FLAG_SIZE;
            buf[pos..pos + frame.body.len()].copy_from_slice(&frame.body);
            pos += frame.body.len();
        }

        buf
    }

    /// Parses a page from exactly `bytes.len()` bytes (the page size).
    pub fn from_bytes(bytes: &[u8]) -> Result<Page, PageError> {
        let page_size = bytes.len();
        let mut pos = 0;

        let magic = u32::from_be_bytes(bytes[pos..pos + MAGIC_SIZE].try_into().unwrap());
        pos += MAGIC_SIZE;
        if magic != PAGE_MAGIC {
            return Err(PageError::Corruption(format!(
                "bad page magic 0x{magic:08x}"
            )));
        }
        let page_id = u64::from_be_bytes(bytes[pos..pos + PAGE_ID_SIZE].try_into().unwrap());
        pos += PAGE_ID_SIZE;
        let num_documents =
            u32::from_be_bytes(bytes[pos..pos + NUM_DOCS_SIZE].try_into().unwrap()) as usize;
        pos += NUM_DOCS_SIZE;
        let header_size = u16::from_be_bytes(
            bytes[pos..pos + HEADER_SIZE_FIELD_SIZE].try_into().unwrap(),
        ) as usize;
        pos += HEADER_SIZE_FIELD_SIZE;
        let prev_raw = i64::from_be_bytes(bytes[pos..pos + PREV_SIZE].try_into().unwrap());
        pos += PREV_SIZE;
        let next_raw = i64::from_be_bytes(bytes[pos..pos + NEXT_SIZE].try_into().unwrap());
        pos += NEXT_SIZE;
        let _available = u32::from_be_bytes(bytes[pos..pos + AVAILABLE_SIZE].try_into().unwrap());
        pos += AVAILABLE_SIZE;
        let compressed = bytes[pos] != 0;
        pos += COMPRESSED_FLAG_SIZE;

        if header_size != HEADER_SIZE {
            return Err(PageError::Corruption(format!(
                "unexpected header size {header_size}"
            )));
        }

        let mut frames = Vec::with_capacity(num_documents);
        for _ in 0..num_documents {
            let offset = pos as u32;
            let document_id =
                u64::from_be_bytes(bytes[pos..pos + FRAME_DOC_ID_SIZE].try_into().unwrap());
            pos += FRAME_DOC_ID_SIZE;
            let frame_page_id =
                u64::from_be_bytes(bytes[pos..pos + FRAME_PAGE_ID_SIZE].try_into().unwrap());
            pos += FRAME_PAGE_ID_SIZE;
            let decompressed_size = u32::from_be_bytes(
                bytes[pos..pos + FRAME_DECOMPRESSED_SIZE_SIZE]
                    .try_into()
                    .unwrap(),
            );
            pos += FRAME_DECOMPRESSED_SIZE_SIZE;
            let compressed_size = u32::from_be_bytes(
                bytes[pos..pos + FRAME_COMPRESSED_SIZE_SIZE]
                    .try_into()
                    .unwrap(),
            );
            pos += FRAME_COMPRESSED_SIZE_SIZE;
            let active = bytes[pos] != 0;
            pos += FRAME_DELETED_FLAG_SIZE;

            let stored_len = if compressed_size > 0 {
                compressed_size as usize
            } else {
                decompressed_size as usize
            };
            if pos + stored_len > page_size {
                return Err(PageError::Corruption(format!(
                    "frame for document {document_id} overruns page bounds"
                )));
            }
            let body = bytes[pos..pos + stored_len].to_vec();
            pos += stored_len;

            frames.push(DocumentFrame {
                offset,
                document_id,
                page_id: frame_page_id,
                decompressed_size,
                compressed_size,
                active,
                body,
            });
        }

        Ok(Page {
            page_id,
            page_size,
            prev: if prev_raw < 0 { None } else { Some(prev_raw as u64) },
            next: if next_raw < 0 { None } else { Some(next_raw as u64) },
            compressed,
            dirty: false,
            frames,
        })
    }
}

fn zlib_compress(bytes: &[u8]) -> Result<Vec<u8>, PageError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| PageError::Compression(e.to_string()))?;
    encoder.finish().map_err(|e| PageError::Compression(e.to_string()))
}

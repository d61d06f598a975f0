//! 17-byte metadata header certifying the on-disk format and the highest page id.
//!
//! ```text
//! i32 magic = 0x43525553
//! u8  version = 1
//! i64 lastPageId
//! i32 reserved = 0
//! ```
//!
//! Rewritten atomically (truncate-then-write) on every new page allocation.

use thiserror::Error;

pub const MAGIC: i32 = 0x4352_5553;
pub const VERSION: u8 = 1;
pub const METADATA_SIZE: usize = 4 + 1 + 8 + 4;

#[derive(Debug, Error, PartialEq)]
pub enum MetadataError {
    #[error("metadata buffer must be exactly {METADATA_SIZE} bytes, got {0}")]
    WrongSize(usize),
    #[error("bad metadata magic 0x{0:08x}")]
    BadMagic(i32),
    #[error("unsupported metadata version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub magic: i32,
    pub version: u8,
    pub last_page_id: i64,
    pub reserved: i32,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            last_page_id: -1,
            reserved: 0,
        }
    }
}

impl Metadata {
    #[must_use]
    pub fn to_bytes(self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4] = self.version;
        buf[5..13].copy_from_slice(&self.last_page_id.to_be_bytes());
        buf[13..17].copy_from_slice(&self.reserved.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        if bytes.len() != METADATA_SIZE {
            return Err(MetadataError::WrongSize(bytes.len()));
        }
        let magic = i32::from_be_bytes(bytes[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(MetadataError::BadMagic(magic));
        }
        let version = bytes[4];
        if version != VERSION {
            return Err(MetadataError::UnsupportedVersion(version));
        }
        let last_page_id = i64::from_be_bytes(bytes[5..13].try_into().unwrap());
        let reserved = i32::from_be_bytes(bytes[13..17].try_into().unwrap());
        Ok(Self {
            magic,
            version,
            last_page_id,
            reserved,
        })
    }
}

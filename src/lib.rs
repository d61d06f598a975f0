//! CrushDB: an embedded document database storage and indexing core.
//!
//! This crate implements the paged storage engine, B+Tree index family, write-ahead
//! journal, and crate (namespace) layer described in `storage`. It is a library —
//! no network protocol, query language, or CLI lives here; a host process wires
//! [`config::Config`] to [`storage::db_crate::Context`] and drives it directly.
pub mod config;
pub mod storage;

pub use config::{Config, ConfigError};
pub use storage::{Context, Crate, CrateError, Document, PageOffsetReference, StorageEngine, StorageError};

//! Crates: named namespaces of documents, each owning a set of indexes.
//!
//! A [`Crate`] itself is just a name and the set of index names registered against
//! it; all the actual storage lives in the [`StorageEngine`](super::engine::StorageEngine)
//! it was built with. [`Context`] holds that engine explicitly rather than through
//! process-wide mutable state — constructing one is what initializing used to mean,
//! and building a fresh one is what resetting used to mean.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;

use log::info;
use thiserror::Error;

use super::btree::SortOrder;
use super::codec::{BsonType, BsonValue};
use super::document::Document;
use super::engine::{StorageEngine, StorageError};

#[derive(Debug, Error)]
pub enum CrateError {
    #[error("crate {0} already exists")]
    AlreadyExists(String),
    #[error("no crate named {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A named namespace of documents and the indexes registered against it.
#[derive(Debug, Clone)]
pub struct Crate {
    pub name: String,
    index_names: HashSet<String>,
}

impl Crate {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index_names: HashSet::new(),
        }
    }

    fn to_record(&self) -> String {
        format!("name={}\n", self.name)
    }

    fn from_record(text: &str) -> Option<Self> {
        text.lines()
            .find_map(|l| l.strip_prefix("name="))
            .map(|name| Crate::new(name.trim()))
    }
}

/// Explicit replacement for the original global crate-manager singleton. Owns the
/// storage engine plus the set of known crates; every crate operation routes through
/// whichever `Context` the caller constructed, rather than through ambient state.
pub struct Context {
    crates_dir: PathBuf,
    engine: StorageEngine,
    crates: std::collections::HashMap<String, Crate>,
}

impl Context {
    /// Builds a fresh, empty context around an already-opened storage engine.
    #[must_use]
    pub fn new(crates_dir: impl Into<PathBuf>, engine: StorageEngine) -> Self {
        Self {
            crates_dir: crates_dir.into(),
            engine,
            crates: std::collections::HashMap::new(),
        }
    }

    pub fn engine(&self) -> &StorageEngine {
        &self.engine
    }

    /// Registers a new, empty crate and persists its `.crate` file.
    pub fn create_crate(&mut self, name: &str) -> Result<(), CrateError> {
        if self.crates.contains_key(name) {
            return Err(CrateError::AlreadyExists(name.to_string()));
        }
        let krate = Crate::new(name);
        self.persist_crate(&krate)?;
        self.crates.insert(name.to_string(), krate);
        info!("created crate {name}");
        Ok(())
    }

    fn crate_path(&self, name: &str) -> PathBuf {
        self.crates_dir.join(format!("{name}.crate"))
    }

    fn persist_crate(&self, krate: &Crate) -> Result<(), CrateError> {
        fs::create_dir_all(&self.crates_dir)?;
        let mut file = File::create(self.crate_path(&krate.name))?;
        file.write_all(krate.to_record().as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Registers an index with the index manager and records it in the crate's
    /// local set.
    #[allow(clippy::too_many_arguments)]
    pub fn create_index(
        &mut self,
        crate_name: &str,
        value_type: BsonType,
        index_name: &str,
        field_name: &str,
        unique: bool,
        order: usize,
        sort_order: SortOrder,
    ) -> Result<(), CrateError> {
        let krate = self
            .crates
            .get_mut(crate_name)
            .ok_or_else(|| CrateError::NotFound(crate_name.to_string()))?;
        self.engine
            .with_index_manager(|im| im.create_index(value_type, crate_name, index_name, field_name, unique, order, sort_order))
            .map_err(StorageError::from)?;
        krate.index_names.insert(index_name.to_string());
        Ok(())
    }

    /// Inserts `doc`, scoping index maintenance to the indexes whose field is
    /// present in the document; with none applicable, falls back to the unscoped
    /// insert (which still indexes on every matching crate-wide index).
    pub fn insert(&self, crate_name: &str, doc: Document) -> Result<Document, CrateError> {
        let krate = self
            .crates
            .get(crate_name)
            .ok_or_else(|| CrateError::NotFound(crate_name.to_string()))?;
        let applicable: Vec<String> = krate.index_names.iter().cloned().collect();
        if applicable.is_empty() {
            Ok(self.engine.insert(crate_name, doc)?)
        } else {
            Ok(self.engine.insert_scoped(crate_name, doc, &applicable)?)
        }
    }

    /// Prefers an exact `{field}_index` match; degrades to a linear scan
    /// otherwise.
    pub fn find(&self, crate_name: &str, field_name: &str, value: BsonValue) -> Result<Vec<Document>, CrateError> {
        let krate = self
            .crates
            .get(crate_name)
            .ok_or_else(|| CrateError::NotFound(crate_name.to_string()))?;
        let conventional_name = format!("{field_name}_index");
        if krate.index_names.contains(&conventional_name) {
            Ok(self.engine.find(crate_name, &conventional_name, value)?)
        } else {
            Ok(self.engine.scan(field_name, &value)?)
        }
    }

    /// Loads any `.crate` files already present under `crates_dir`, without
    /// touching index state (that is `IndexManager::load_indexes_from_disk`'s job).
    pub fn load_crates_from_disk(&mut self) -> Result<(), CrateError> {
        if !self.crates_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.crates_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crate") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            if let Some(krate) = Crate::from_record(&text) {
                self.crates.insert(krate.name.clone(), krate);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::codec::BsonValue;
    use crate::storage::engine::StorageEngine as Engine;
    use crate::storage::index::IndexManager;
    use crate::storage::journal::Journal;
    use crate::storage::pager::PageManager;
    use tempdir::TempDir;

    fn context(dir: &TempDir) -> Context {
        let journal = Journal::open(dir.path().join("crushdb.journal")).unwrap();
        let page_manager = PageManager::open(
            dir.path().join("crushdb.db"),
            dir.path().join("meta.dat"),
            Default::default(),
        )
        .unwrap();
        let index_manager = IndexManager::new(dir.path().join("indexes"));
        let engine = Engine::new(journal, page_manager, index_manager);
        Context::new(dir.path().join("crates"), engine)
    }

    #[test]
    fn insert_with_no_indexes_falls_back_to_unscoped() {
        let dir = TempDir::new("crushdb-crate").unwrap();
        let mut ctx = context(&dir);
        ctx.create_crate("Vehicle").unwrap();
        let doc = Document::new(1, vec![("make".to_string(), BsonValue::String("Kia".to_string()))]);
        let inserted = ctx.insert("Vehicle", doc).unwrap();
        assert!(inserted.page_offset_reference().is_some());
    }

    #[test]
    fn find_prefers_conventional_index_name() {
        let dir = TempDir::new("crushdb-crate").unwrap();
        let mut ctx = context(&dir);
        ctx.create_crate("Vehicle").unwrap();
        ctx.create_index("Vehicle", BsonType::String, "make_index", "make", false, 4, SortOrder::Asc)
            .unwrap();
        ctx.insert(
            "Vehicle",
            Document::new(1, vec![("make".to_string(), BsonValue::String("Subaru".to_string()))]),
        )
        .unwrap();
        let found = ctx.find("Vehicle", "make", BsonValue::String("Subaru".to_string())).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn find_without_matching_index_falls_back_to_scan() {
        let dir = TempDir::new("crushdb-crate").unwrap();
        let mut ctx = context(&dir);
        ctx.create_crate("Vehicle").unwrap();
        ctx.insert(
            "Vehicle",
            Document::new(1, vec![("make".to_string(), BsonValue::String("Subaru".to_string()))]),
        )
        .unwrap();
        let found = ctx.find("Vehicle", "make", BsonValue::String("Subaru".to_string())).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn duplicate_crate_creation_fails() {
        let dir = TempDir::new("crushdb-crate").unwrap();
        let mut ctx = context(&dir);
        ctx.create_crate("Vehicle").unwrap();
        assert!(matches!(ctx.create_crate("Vehicle"), Err(CrateError::AlreadyExists(_))));
    }

    #[test]
    fn crates_reload_from_disk() {
        let dir = TempDir::new("crushdb-crate").unwrap();
        {
            let mut ctx = context(&dir);
            ctx.create_crate("Vehicle").unwrap();
        }
        let mut ctx = context(&dir);
        ctx.load_crates_from_disk().unwrap();
        assert!(ctx.create_crate("Vehicle").is_err());
    }
}

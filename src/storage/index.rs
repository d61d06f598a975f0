//! Index registry: owns every [`BTree`] in the process, keyed by `(crateName,
//! indexName)`, plus an auxiliary `crateName -> {indexName}` map so the storage
//! engine and crate layer can answer "what indexes apply to this crate" without
//! scanning the whole registry.
//!
//! Index definitions persist to `{crate}__{indexName}.index` as key=value text; tree
//! contents do not — on reload a definition comes back with an empty tree, to be
//! repopulated by rescanning the crate's documents (see spec on index manager).

use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;

use super::btree::{BTree, SortOrder, TreeError};
use super::codec::{BsonType, BsonValue, IndexKey};
use super::document::PageOffsetReference;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index {index_name} already exists on crate {crate_name}")]
    AlreadyExists { crate_name: String, index_name: String },
    #[error("no index {index_name} on crate {crate_name}")]
    NotFound { crate_name: String, index_name: String },
    #[error("index {index_name} on crate {crate_name} expects key type {expected:?}, got {actual:?}")]
    TypeMismatch {
        crate_name: String,
        index_name: String,
        expected: BsonType,
        actual: BsonType,
    },
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed index definition file {0}: {1}")]
    MalformedDefinition(PathBuf, String),
}

#[derive(Debug, Clone)]
pub struct IndexDefinition {
    pub crate_name: String,
    pub index_name: String,
    pub field_name: String,
    pub value_type: BsonType,
    pub unique: bool,
    pub order: usize,
    pub sort_order: SortOrder,
}

impl IndexDefinition {
    fn to_record(&self) -> String {
        format!(
            "crateName={}\nindexName={}\nfieldName={}\nbsonType={}\nunique={}\norder={}\nsortOrder={}\n",
            self.crate_name,
            self.index_name,
            self.field_name,
            bson_type_name(self.value_type),
            self.unique,
            self.order,
            sort_order_name(self.sort_order),
        )
    }

    fn from_record(path: &Path, text: &str) -> Result<Self, IndexError> {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(IndexError::MalformedDefinition(
                    path.to_path_buf(),
                    format!("line without '=': {line}"),
                ));
            };
            fields.insert(key, value);
        }
        let get = |key: &str| -> Result<String, IndexError> {
            fields
                .get(key)
                .map(|v| v.to_string())
                .ok_or_else(|| IndexError::MalformedDefinition(path.to_path_buf(), format!("missing key {key}")))
        };
        Ok(Self {
            crate_name: get("crateName")?,
            index_name: get("indexName")?,
            field_name: get("fieldName")?,
            value_type: parse_bson_type(path, &get("bsonType")?)?,
            unique: get("unique")?.parse().map_err(|_| {
                IndexError::MalformedDefinition(path.to_path_buf(), "unique is not a bool".to_string())
            })?,
            order: get("order")?.parse().map_err(|_| {
                IndexError::MalformedDefinition(path.to_path_buf(), "order is not a number".to_string())
            })?,
            sort_order: parse_sort_order(path, &get("sortOrder")?)?,
        })
    }
}

fn bson_type_name(t: BsonType) -> &'static str {
    match t {
        BsonType::String => "STRING",
        BsonType::Int => "INT",
        BsonType::Long => "LONG",
        BsonType::Float => "FLOAT",
        BsonType::Double => "DOUBLE",
        BsonType::Boolean => "BOOLEAN",
    }
}

fn parse_bson_type(path: &Path, s: &str) -> Result<BsonType, IndexError> {
    match s {
        "STRING" => Ok(BsonType::String),
        "INT" => Ok(BsonType::Int),
        "LONG" => Ok(BsonType::Long),
        "FLOAT" => Ok(BsonType::Float),
        "DOUBLE" => Ok(BsonType::Double),
        "BOOLEAN" => Ok(BsonType::Boolean),
        other => Err(IndexError::MalformedDefinition(
            path.to_path_buf(),
            format!("unknown bsonType {other}"),
        )),
    }
}

fn sort_order_name(o: SortOrder) -> &'static str {
    match o {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    }
}

fn parse_sort_order(path: &Path, s: &str) -> Result<SortOrder, IndexError> {
    match s {
        "ASC" => Ok(SortOrder::Asc),
        "DESC" => Ok(SortOrder::Desc),
        other => Err(IndexError::MalformedDefinition(
            path.to_path_buf(),
            format!("unknown sortOrder {other}"),
        )),
    }
}

pub struct IndexManager {
    indexes_dir: PathBuf,
    trees: HashMap<(String, String), (IndexDefinition, BTree)>,
    by_crate: HashMap<String, HashSet<String>>,
}

impl IndexManager {
    #[must_use]
    pub fn new(indexes_dir: impl Into<PathBuf>) -> Self {
        Self {
            indexes_dir: indexes_dir.into(),
            trees: HashMap::new(),
            by_crate: HashMap::new(),
        }
    }

    fn definition_path(&self, crate_name: &str, index_name: &str) -> PathBuf {
        self.indexes_dir.join(format!("{crate_name}__{index_name}.index"))
    }

    pub fn create_index(
        &mut self,
        value_type: BsonType,
        crate_name: &str,
        index_name: &str,
        field_name: &str,
        unique: bool,
        order: usize,
        sort_order: SortOrder,
    ) -> Result<(), IndexError> {
        let key = (crate_name.to_string(), index_name.to_string());
        if self.trees.contains_key(&key) {
            return Err(IndexError::AlreadyExists {
                crate_name: crate_name.to_string(),
                index_name: index_name.to_string(),
            });
        }
        let definition = IndexDefinition {
            crate_name: crate_name.to_string(),
            index_name: index_name.to_string(),
            field_name: field_name.to_string(),
            value_type,
            unique,
            order,
            sort_order,
        };
        self.persist_definition(&definition)?;
        let tree = BTree::new(order, unique, sort_order);
        self.trees.insert(key, (definition, tree));
        self.by_crate
            .entry(crate_name.to_string())
            .or_default()
            .insert(index_name.to_string());
        info!("created index {crate_name}__{index_name} on field {field_name}");
        Ok(())
    }

    fn persist_definition(&self, definition: &IndexDefinition) -> Result<(), IndexError> {
        fs::create_dir_all(&self.indexes_dir)?;
        let path = self.definition_path(&definition.crate_name, &definition.index_name);
        let mut file = File::create(path)?;
        file.write_all(definition.to_record().as_bytes())?;
        file.flush()?;
        Ok(())
    }

    fn definition(&self, crate_name: &str, index_name: &str) -> Result<&IndexDefinition, IndexError> {
        self.trees
            .get(&(crate_name.to_string(), index_name.to_string()))
            .map(|(def, _)| def)
            .ok_or_else(|| IndexError::NotFound {
                crate_name: crate_name.to_string(),
                index_name: index_name.to_string(),
            })
    }

    fn typed_key(
        &self,
        crate_name: &str,
        index_name: &str,
        value: BsonValue,
    ) -> Result<IndexKey, IndexError> {
        let definition = self.definition(crate_name, index_name)?;
        let expected = definition.value_type;
        let actual = value.value_type();
        value.into_index_key(expected).map_err(|_| IndexError::TypeMismatch {
            crate_name: crate_name.to_string(),
            index_name: index_name.to_string(),
            expected,
            actual,
        })
    }

    pub fn insert(
        &mut self,
        crate_name: &str,
        index_name: &str,
        value: BsonValue,
        reference: PageOffsetReference,
    ) -> Result<(), IndexError> {
        let expected = self.definition(crate_name, index_name)?.value_type;
        let actual = value.value_type();
        let key = value.into_index_key(expected).map_err(|_| IndexError::TypeMismatch {
            crate_name: crate_name.to_string(),
            index_name: index_name.to_string(),
            expected,
            actual,
        })?;
        let (_, tree) = self
            .trees
            .get_mut(&(crate_name.to_string(), index_name.to_string()))
            .ok_or_else(|| IndexError::NotFound {
                crate_name: crate_name.to_string(),
                index_name: index_name.to_string(),
            })?;
        tree.insert(key, reference).map_err(IndexError::from)
    }

    pub fn search(
        &self,
        crate_name: &str,
        index_name: &str,
        value: BsonValue,
    ) -> Result<Vec<PageOffsetReference>, IndexError> {
        let key = self.typed_key(crate_name, index_name, value)?;
        let (_, tree) = self
            .trees
            .get(&(crate_name.to_string(), index_name.to_string()))
            .ok_or_else(|| IndexError::NotFound {
                crate_name: crate_name.to_string(),
                index_name: index_name.to_string(),
            })?;
        Ok(tree.search(&key))
    }

    pub fn range_search(
        &self,
        crate_name: &str,
        index_name: &str,
        lo: BsonValue,
        hi: BsonValue,
    ) -> Result<Vec<PageOffsetReference>, IndexError> {
        let lo_key = self.typed_key(crate_name, index_name, lo)?;
        let hi_key = self.typed_key(crate_name, index_name, hi)?;
        let (_, tree) = self
            .trees
            .get(&(crate_name.to_string(), index_name.to_string()))
            .ok_or_else(|| IndexError::NotFound {
                crate_name: crate_name.to_string(),
                index_name: index_name.to_string(),
            })?;
        Ok(tree.range_search(&lo_key, &hi_key))
    }

    /// Every index definition registered for `crate_name`, used by the storage
    /// engine to decide which indexes a blind insert should populate.
    #[must_use]
    pub fn indexes_for_crate(&self, crate_name: &str) -> Vec<&IndexDefinition> {
        let Some(names) = self.by_crate.get(crate_name) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| self.trees.get(&(crate_name.to_string(), name.clone())))
            .map(|(def, _)| def)
            .collect()
    }

    /// Reconstructs index definitions from `{crate}__{index}.index` files under
    /// `indexes_dir`. Tree contents come back empty; the caller is responsible for
    /// rebuilding them by rescanning the crate's documents.
    pub fn load_indexes_from_disk(&mut self) -> Result<(), IndexError> {
        if !self.indexes_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&self.indexes_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("index") {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            let definition = IndexDefinition::from_record(&path, &text)?;
            let tree = BTree::new(definition.order, definition.unique, definition.sort_order);
            self.by_crate
                .entry(definition.crate_name.clone())
                .or_default()
                .insert(definition.index_name.clone());
            warn!(
                "loaded index definition {}__{} with an empty tree; documents must be rescanned to repopulate it",
                definition.crate_name, definition.index_name
            );
            self.trees
                .insert((definition.crate_name.clone(), definition.index_name.clone()), (definition, tree));
        }
        Ok(())
    }
}

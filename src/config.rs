//! Configuration file parsing.
//!
//! A CrushDB configuration file is key=value text, one setting per line, matching
//! the same line-parsing idiom as the crate and index definition files in
//! [`crate::storage`]. Unrecognized keys are tolerated and retained verbatim in
//! [`Config::external`] — settings like `logLevel`, `tlsEnabled`, or `port` belong to
//! surfaces this crate does not build, but a config file shared with those surfaces
//! should not fail to parse here.

use std::collections::HashMap;
use std::fs;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::ParseBoolError;

use thiserror::Error;

use crate::storage::pager::PageManagerConfig;

const DEFAULT_PAGE_SIZE: usize = 4096;
const DEFAULT_CACHE_MAX_PAGES: usize = 8192;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: line without '=': {line:?}")]
    MalformedLine { path: PathBuf, line: String },
    #[error("{path}: key {key} is not a valid integer: {source}")]
    InvalidInt {
        path: PathBuf,
        key: &'static str,
        #[source]
        source: ParseIntError,
    },
    #[error("{path}: key {key} is not a valid boolean: {source}")]
    InvalidBool {
        path: PathBuf,
        key: &'static str,
        #[source]
        source: ParseBoolError,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Parsed CrushDB configuration. Filesystem-location fields default relative to
/// `baseDir`; every other field falls back to its documented default.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub storage_path: PathBuf,
    pub data_path: PathBuf,
    pub meta_file_path: PathBuf,
    pub crates_path: PathBuf,
    pub indexes_path: PathBuf,
    pub page_size: usize,
    pub cache_memory_limit_mb: Option<u64>,
    pub cache_max_pages: usize,
    pub eager_load_pages: bool,
    pub auto_compress_on_insert: bool,
    pub wal_enabled: bool,
    pub tombstone_gc_millis: u64,
    /// Keys this crate recognizes but does not act on (logging, TLS, port — owned
    /// by surfaces this crate does not build), kept so round-tripping a shared
    /// config file back out is lossless.
    pub external: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let base_dir = PathBuf::from(".");
        Self {
            storage_path: base_dir.join("storage"),
            data_path: base_dir.join("crushdb.db"),
            meta_file_path: base_dir.join("meta.dat"),
            crates_path: base_dir.join("crates"),
            indexes_path: base_dir.join("indexes"),
            base_dir,
            page_size: DEFAULT_PAGE_SIZE,
            cache_memory_limit_mb: None,
            cache_max_pages: DEFAULT_CACHE_MAX_PAGES,
            eager_load_pages: false,
            auto_compress_on_insert: false,
            wal_enabled: true,
            tombstone_gc_millis: 0,
            external: HashMap::new(),
        }
    }
}

const EXTERNAL_KEYS: &[&str] = &[
    "logDirectory",
    "logMaxFiles",
    "logRetentionDays",
    "logMaxSizeMb",
    "logLevel",
    "tlsEnabled",
    "caCertPath",
    "customCaCertPath",
    "port",
];

impl Config {
    /// Parses a configuration file from `path`. `~` in a filesystem-location value
    /// expands to the user's home directory unless `test_mode` is set.
    pub fn load(path: impl AsRef<Path>, test_mode: bool) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Self::parse(path, &text, test_mode)
    }

    fn parse(path: &Path, text: &str, test_mode: bool) -> Result<Self, ConfigError> {
        let mut raw: HashMap<String, String> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    path: path.to_path_buf(),
                    line: line.to_string(),
                });
            };
            raw.insert(key.trim().to_string(), value.trim().to_string());
        }

        let expand = |raw: &HashMap<String, String>, key: &str, fallback: PathBuf| -> PathBuf {
            match raw.get(key) {
                Some(v) => expand_home(v, test_mode),
                None => fallback,
            }
        };

        let parse_usize = |key: &'static str, default: usize| -> Result<usize, ConfigError> {
            match raw.get(key) {
                Some(v) => v.parse().map_err(|source| ConfigError::InvalidInt {
                    path: path.to_path_buf(),
                    key,
                    source,
                }),
                None => Ok(default),
            }
        };
        let parse_u64 = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match raw.get(key) {
                Some(v) => v.parse().map_err(|source| ConfigError::InvalidInt {
                    path: path.to_path_buf(),
                    key,
                    source,
                }),
                None => Ok(default),
            }
        };
        let parse_bool = |key: &'static str, default: bool| -> Result<bool, ConfigError> {
            match raw.get(key) {
                Some(v) => v.parse().map_err(|source| ConfigError::InvalidBool {
                    path: path.to_path_buf(),
                    key,
                    source,
                }),
                None => Ok(default),
            }
        };

        let base_dir = expand(&raw, "baseDir", PathBuf::from("."));
        let storage_path = expand(&raw, "storagePath", base_dir.join("storage"));
        let data_path = expand(&raw, "dataPath", base_dir.join("crushdb.db"));
        let meta_file_path = expand(&raw, "metaFilePath", base_dir.join("meta.dat"));
        let crates_path = expand(&raw, "cratesPath", base_dir.join("crates"));
        let indexes_path = expand(&raw, "indexesPath", base_dir.join("indexes"));

        let page_size = parse_usize("pageSize", DEFAULT_PAGE_SIZE)?;
        let cache_memory_limit_mb = raw
            .get("cacheMemoryLimitMb")
            .map(|v| {
                v.parse::<u64>().map_err(|source| ConfigError::InvalidInt {
                    path: path.to_path_buf(),
                    key: "cacheMemoryLimitMb",
                    source,
                })
            })
            .transpose()?
            .filter(|&v| v > 0);
        let cache_max_pages = parse_usize("cacheMaxPages", DEFAULT_CACHE_MAX_PAGES)?;
        let eager_load_pages = parse_bool("eagerLoadPages", false)?;
        let auto_compress_on_insert = parse_bool("autoCompressOnInsert", false)?;
        let wal_enabled = parse_bool("walEnabled", true)?;
        let tombstone_gc_millis = parse_u64("tombstoneGc", 0)?;

        let external = raw
            .into_iter()
            .filter(|(k, _)| EXTERNAL_KEYS.contains(&k.as_str()))
            .collect();

        Ok(Self {
            base_dir,
            storage_path,
            data_path,
            meta_file_path,
            crates_path,
            indexes_path,
            page_size,
            cache_memory_limit_mb,
            cache_max_pages,
            eager_load_pages,
            auto_compress_on_insert,
            wal_enabled,
            tombstone_gc_millis,
            external,
        })
    }

    /// Derives the cache capacity in pages from `cacheMemoryLimitMb` when set,
    /// otherwise falls back to `cacheMaxPages`.
    #[must_use]
    pub fn cache_capacity_pages(&self) -> usize {
        match self.cache_memory_limit_mb {
            Some(mb) => (((mb * 1024 * 1024) / self.page_size as u64).max(1)) as usize,
            None => self.cache_max_pages,
        }
    }

    /// Builds the page manager configuration this config implies.
    #[must_use]
    pub fn page_manager_config(&self) -> PageManagerConfig {
        PageManagerConfig {
            page_size: self.page_size,
            cache_max_pages: self.cache_capacity_pages(),
            eager_load_pages: self.eager_load_pages,
            auto_compress_on_insert: self.auto_compress_on_insert,
        }
    }
}

fn expand_home(value: &str, test_mode: bool) -> PathBuf {
    if test_mode || !value.starts_with('~') {
        return PathBuf::from(value);
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(value.replacen('~', &home, 1)),
        Err(_) => PathBuf::from(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys_and_defaults_the_rest() {
        let text = "baseDir=/tmp/crushdb\npageSize=8192\neagerLoadPages=true\n";
        let cfg = Config::parse(Path::new("test.conf"), text, true).unwrap();
        assert_eq!(cfg.base_dir, PathBuf::from("/tmp/crushdb"));
        assert_eq!(cfg.page_size, 8192);
        assert!(cfg.eager_load_pages);
        assert!(!cfg.auto_compress_on_insert);
        assert!(cfg.wal_enabled);
    }

    #[test]
    fn cache_memory_limit_overrides_max_pages() {
        let text = "pageSize=4096\ncacheMemoryLimitMb=32\ncacheMaxPages=1\n";
        let cfg = Config::parse(Path::new("test.conf"), text, true).unwrap();
        assert_eq!(cfg.cache_capacity_pages(), (32 * 1024 * 1024) / 4096);
    }

    #[test]
    fn zero_cache_memory_limit_falls_back_to_max_pages() {
        let text = "cacheMemoryLimitMb=0\ncacheMaxPages=256\n";
        let cfg = Config::parse(Path::new("test.conf"), text, true).unwrap();
        assert_eq!(cfg.cache_capacity_pages(), 256);
    }

    #[test]
    fn external_keys_are_retained_but_not_acted_on() {
        let text = "logLevel=debug\nport=9000\n";
        let cfg = Config::parse(Path::new("test.conf"), text, true).unwrap();
        assert_eq!(cfg.external.get("logLevel").map(String::as_str), Some("debug"));
        assert_eq!(cfg.external.get("port").map(String::as_str), Some("9000"));
    }

    #[test]
    fn malformed_line_is_rejected() {
        let text = "not-a-valid-line\n";
        assert!(matches!(
            Config::parse(Path::new("test.conf"), text, true),
            Err(ConfigError::MalformedLine { .. })
        ));
    }

    #[test]
    fn tilde_expands_to_home_unless_test_mode() {
        let text = "baseDir=~/crushdb\n";
        let test_cfg = Config::parse(Path::new("test.conf"), text, true).unwrap();
        assert_eq!(test_cfg.base_dir, PathBuf::from("~/crushdb"));
    }
}

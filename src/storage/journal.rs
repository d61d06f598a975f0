//! Write-ahead journal gating durability for mutating operations.
//!
//! The journal is a single append-only text file. Each entry is one line,
//! `timestamp|OP|crate|documentId`, written and flushed before the call that
//! triggered it returns. All of `append`/`read_all`/`clear` serialize through one
//! [`Mutex`] — the journal is, deliberately, the simplest and most conservative
//! piece of this engine.
//!
//! Recovery is limited to replaying WRITE/DELETE entries in file order against the
//! storage engine; whether a replay should rebuild index entries or defer to a
//! separate rebuild pass driven by index-definition files is left to the caller.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed journal line: {0:?}")]
    Malformed(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum JournalOp {
    Write,
    Delete,
}

impl JournalOp {
    fn as_str(self) -> &'static str {
        match self {
            JournalOp::Write => "WRITE",
            JournalOp::Delete => "DELETE",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "WRITE" => Some(JournalOp::Write),
            "DELETE" => Some(JournalOp::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub timestamp_millis: u128,
    pub op: JournalOp,
    pub crate_name: String,
    pub document_id: u64,
}

impl JournalEntry {
    fn to_line(&self) -> String {
        format!(
            "{}|{}|{}|{}\n",
            self.timestamp_millis,
            self.op.as_str(),
            self.crate_name,
            self.document_id
        )
    }

    fn from_line(path: &Path, line: &str) -> Result<Self, JournalError> {
        let parts: Vec<&str> = line.splitn(4, '|').collect();
        let [ts, op, crate_name, document_id] = parts[..] else {
            return Err(JournalError::Malformed(format!("{}: {line}", path.display())));
        };
        Ok(Self {
            timestamp_millis: ts
                .parse()
                .map_err(|_| JournalError::Malformed(format!("{}: {line}", path.display())))?,
            op: JournalOp::parse(op).ok_or_else(|| JournalError::Malformed(format!("{}: {line}", path.display())))?,
            crate_name: crate_name.to_string(),
            document_id: document_id
                .parse()
                .map_err(|_| JournalError::Malformed(format!("{}: {line}", path.display())))?,
        })
    }
}

pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
}

impl Journal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, JournalError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one `WRITE`/`DELETE` entry, flushing before returning.
    pub fn append(&self, op: JournalOp, crate_name: &str, document_id: u64) -> Result<(), JournalError> {
        let timestamp_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_millis();
        let entry = JournalEntry {
            timestamp_millis,
            op,
            crate_name: crate_name.to_string(),
            document_id,
        };
        let mut file = self.file.lock().expect("journal lock poisoned");
        file.write_all(entry.to_line().as_bytes())?;
        file.flush()?;
        info!("journaled {op:?} {crate_name}/{document_id}");
        Ok(())
    }

    /// Reads every entry currently on disk, in file order.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let mut file = self.file.lock().expect("journal lock poisoned");
        file.seek(SeekFrom::Start(0))?;
        let mut text = String::new();
        file.read_to_string(&mut text)?;
        text.lines()
            .filter(|l| !l.is_empty())
            .map(|l| JournalEntry::from_line(&self.path, l))
            .collect()
    }

    /// Truncates the journal to empty.
    pub fn clear(&self) -> Result<(), JournalError> {
        let mut file = self.file.lock().expect("journal lock poisoned");
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Number of entries currently on disk. A caller-driven checkpoint policy can
    /// poll this to decide when to replay and `clear()`; the policy itself (how
    /// large is too large) is left to that caller.
    pub fn len(&self) -> Result<usize, JournalError> {
        Ok(self.read_all()?.len())
    }

    /// `true` when the journal has no entries.
    pub fn is_empty(&self) -> Result<bool, JournalError> {
        Ok(self.len()? == 0)
    }
}

impl std::fmt::Debug for JournalOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = TempDir::new("crushdb-journal").unwrap();
        let journal = Journal::open(dir.path().join("crushdb.journal")).unwrap();
        journal.append(JournalOp::Write, "Vehicle", 1).unwrap();
        journal.append(JournalOp::Delete, "Vehicle", 1).unwrap();
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].op, JournalOp::Write);
        assert_eq!(entries[1].op, JournalOp::Delete);
        assert_eq!(entries[1].document_id, 1);
    }

    #[test]
    fn len_reports_entry_count() {
        let dir = TempDir::new("crushdb-journal").unwrap();
        let journal = Journal::open(dir.path().join("crushdb.journal")).unwrap();
        assert!(journal.is_empty().unwrap());
        journal.append(JournalOp::Write, "Vehicle", 1).unwrap();
        journal.append(JournalOp::Write, "Vehicle", 2).unwrap();
        assert_eq!(journal.len().unwrap(), 2);
        assert!(!journal.is_empty().unwrap());
    }

    #[test]
    fn clear_truncates_the_file() {
        let dir = TempDir::new("crushdb-journal").unwrap();
        let journal = Journal::open(dir.path().join("crushdb.journal")).unwrap();
        journal.append(JournalOp::Write, "Vehicle", 1).unwrap();
        journal.clear().unwrap();
        assert!(journal.read_all().unwrap().is_empty());
    }

    #[test]
    fn malformed_line_is_rejected() {
        let dir = TempDir::new("crushdb-journal").unwrap();
        let path = dir.path().join("crushdb.journal");
        std::fs::write(&path, "not-a-valid-entry\n").unwrap();
        let journal = Journal::open(&path).unwrap();
        assert!(matches!(journal.read_all(), Err(JournalError::Malformed(_))));
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new("crushdb-journal").unwrap();
        let path = dir.path().join("crushdb.journal");
        {
            let journal = Journal::open(&path).unwrap();
            journal.append(JournalOp::Write, "Vehicle", 7).unwrap();
        }
        let journal = Journal::open(&path).unwrap();
        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].document_id, 7);
    }
}

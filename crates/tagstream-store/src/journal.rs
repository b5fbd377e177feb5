//! Append-only store journal
//!
//! A store is a directory holding:
//! - `store.json`, a metadata stamp carrying the schema version
//! - `journal.jsonl`, one JSON record per line, replayed in order on load
//!
//! Appends write a whole batch with a single `write_all`. A failed append is
//! truncated back to the previous length so the journal never keeps half a
//! batch; a torn final line left by a crash is dropped when the journal is
//! reopened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tagstream_core::{Error, Feed, FeedId, ItemId, Result, TokenId};
use tracing::{debug, info, warn};

/// Schema version written by this build
pub const SCHEMA_VERSION: u32 = 3;

const META_FILE: &str = "store.json";
const JOURNAL_FILE: &str = "journal.jsonl";

/// Contents of `store.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// An entry as persisted, with its tokens already mapped to vocabulary ids
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: ItemId,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    pub updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<FeedId>,
    pub tokens: Vec<(TokenId, u64)>,
}

/// One journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalRecord {
    Token { id: TokenId, text: String },
    Entry(StoredEntry),
    RemoveEntry { id: ItemId },
    ProtectEntry { id: ItemId },
    RetireEntry { id: ItemId },
    Feed(Feed),
    RemoveFeed { id: FeedId },
}

/// Create an empty store at `dir`
pub fn initialize(dir: &Path) -> Result<()> {
    if dir.join(META_FILE).exists() {
        return Err(Error::conflict(format!(
            "{} already holds an item store",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)?;
    let meta = StoreMeta {
        schema_version: SCHEMA_VERSION,
        created_at: Utc::now(),
    };
    std::fs::write(dir.join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(JOURNAL_FILE))?;
    info!("Initialized store at {:?} (schema version {})", dir, SCHEMA_VERSION);
    Ok(())
}

/// Validate the store directory and its schema stamp
pub fn check_store(dir: &Path) -> Result<StoreMeta> {
    if !dir.is_dir() {
        return Err(Error::store_unavailable(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let meta_path = dir.join(META_FILE);
    let raw = std::fs::read(&meta_path).map_err(|e| {
        Error::store_unavailable(format!("cannot read {}: {}", meta_path.display(), e))
    })?;
    let meta: StoreMeta = serde_json::from_slice(&raw)
        .map_err(|e| Error::store_unavailable(format!("corrupt {}: {}", meta_path.display(), e)))?;
    if meta.schema_version != SCHEMA_VERSION {
        return Err(Error::SchemaMismatch {
            found: meta.schema_version,
            expected: SCHEMA_VERSION,
        });
    }
    Ok(meta)
}

/// Writer half of the journal
pub struct Journal {
    path: PathBuf,
    file: File,
    len: u64,
}

impl Journal {
    /// Open the journal for appending, dropping a torn final line
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let len = repair_tail(&mut file, &path)?;
        Ok(Self { path, file, len })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a batch of records
    pub fn append(&mut self, records: &[JournalRecord]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let written = self.file.write_all(&buf).and_then(|_| self.file.flush());
        if let Err(e) = written {
            if let Err(truncate_err) = self.file.set_len(self.len) {
                warn!("Failed to roll back journal after write error: {}", truncate_err);
            }
            return Err(Error::storage(format!(
                "append to {} failed: {}",
                self.path.display(),
                e
            )));
        }
        self.len += buf.len() as u64;
        debug!(records = records.len(), bytes = buf.len(), "Journal append");
        Ok(())
    }
}

fn repair_tail(file: &mut File, path: &Path) -> Result<u64> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(len);
    }

    let mut contents = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    let keep = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|pos| pos as u64 + 1)
        .unwrap_or(0);
    warn!(
        "Dropping {} bytes of torn record at the end of {:?}",
        len - keep,
        path
    );
    file.set_len(keep)?;
    Ok(keep)
}

/// Read every record in journal order.
///
/// An unparsable final line is treated as a torn write and skipped; a bad
/// record anywhere else is a storage failure.
pub fn replay(dir: &Path) -> Result<Vec<JournalRecord>> {
    let path = dir.join(JOURNAL_FILE);
    let file = File::open(&path)
        .map_err(|e| Error::storage(format!("cannot open {}: {}", path.display(), e)))?;

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::storage(format!("cannot read {}: {}", path.display(), e)))?;

    let mut records = Vec::with_capacity(lines.len());
    let last = lines.len().saturating_sub(1);
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) if idx == last => {
                warn!("Skipping torn journal record at line {}: {}", idx + 1, e);
            }
            Err(e) => {
                return Err(Error::storage(format!(
                    "corrupt journal record at {}:{}: {}",
                    path.display(),
                    idx + 1,
                    e
                )));
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_check_store_states() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(check_store(&missing), Err(Error::StoreUnavailable(_))));
        assert!(matches!(check_store(dir.path()), Err(Error::StoreUnavailable(_))));

        initialize(dir.path()).unwrap();
        assert_eq!(check_store(dir.path()).unwrap().schema_version, SCHEMA_VERSION);

        std::fs::write(dir.path().join(META_FILE), r#"{"schema_version": 1}"#).unwrap();
        match check_store(dir.path()) {
            Err(Error::SchemaMismatch { found, expected }) => {
                assert_eq!(found, 1);
                assert_eq!(expected, SCHEMA_VERSION);
            }
            other => panic!("expected schema mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_initialize_refuses_existing_store() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path()).unwrap();
        std::fs::write(dir.path().join(META_FILE), r#"{"schema_version": 1}"#).unwrap();

        assert!(matches!(initialize(dir.path()), Err(Error::Conflict(_))));
        // The existing stamp is left alone
        assert!(matches!(
            check_store(dir.path()),
            Err(Error::SchemaMismatch { found: 1, .. })
        ));
    }

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path()).unwrap();

        let mut journal = Journal::open(dir.path()).unwrap();
        journal
            .append(&[
                JournalRecord::Token { id: 1, text: "rust".into() },
                JournalRecord::Feed(Feed::new(4, "News")),
                JournalRecord::RemoveEntry { id: 9 },
            ])
            .unwrap();

        let records = replay(dir.path()).unwrap();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], JournalRecord::Token { id: 1, text } if text == "rust"));
        assert!(matches!(records[2], JournalRecord::RemoveEntry { id: 9 }));
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path()).unwrap();
        {
            let mut journal = Journal::open(dir.path()).unwrap();
            journal.append(&[JournalRecord::RemoveFeed { id: 1 }]).unwrap();
        }
        let path = dir.path().join(JOURNAL_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"op":"remove_fe"#).unwrap();
        drop(file);

        assert_eq!(replay(dir.path()).unwrap().len(), 1);

        let mut journal = Journal::open(dir.path()).unwrap();
        journal.append(&[JournalRecord::RemoveFeed { id: 2 }]).unwrap();
        let records = replay(dir.path()).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], JournalRecord::RemoveFeed { id: 2 }));
    }

    #[test]
    fn test_corrupt_middle_record_fails() {
        let dir = TempDir::new().unwrap();
        initialize(dir.path()).unwrap();
        std::fs::write(
            dir.path().join(JOURNAL_FILE),
            "garbage\n{\"op\":\"remove_feed\",\"id\":1}\n",
        )
        .unwrap();
        assert!(matches!(replay(dir.path()), Err(Error::Storage(_))));
    }
}

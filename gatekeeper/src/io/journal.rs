//! Append-only JSON Lines journals.
//!
//! The audit log and the authorization ledger both persist through the
//! [`Journal`] trait so storage failures can be injected in tests. A write
//! only counts once it has been flushed and synced.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Durable, append-only sink for entries of type `T`.
pub trait Journal<T>: Send {
    fn append(&mut self, entry: &T) -> Result<()>;
}

/// One JSON object per line in a single file.
#[derive(Debug, Clone)]
pub struct JsonlJournal<T> {
    path: PathBuf,
    _entry: PhantomData<fn(&T)>,
}

impl<T> JsonlJournal<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _entry: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T: Serialize> Journal<T> for JsonlJournal<T> {
    fn append(&mut self, entry: &T) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serialize journal entry")?;
        line.push('\n');
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open journal {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append journal {}", self.path.display()))?;
        file.flush()
            .with_context(|| format!("flush journal {}", self.path.display()))?;
        file.sync_data()
            .with_context(|| format!("sync journal {}", self.path.display()))?;
        debug!(path = %self.path.display(), bytes = line.len(), "journal entry appended");
        Ok(())
    }
}

/// Journal that keeps nothing; for engines that live only in memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullJournal;

impl<T> Journal<T> for NullJournal {
    fn append(&mut self, _entry: &T) -> Result<()> {
        Ok(())
    }
}

/// Read every entry of a JSON Lines file. A missing file reads as empty.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read journal {}", path.display()))?;
    let mut entries = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(line)
            .with_context(|| format!("parse {} line {}", path.display(), index + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    #[test]
    fn appends_lines_and_reads_them_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("log").join("journal.jsonl");
        let mut journal = JsonlJournal::new(&path);
        journal.append(&Entry { n: 1 }).expect("append");
        journal.append(&Entry { n: 2 }).expect("append");

        let contents = fs::read_to_string(&path).expect("read");
        assert_eq!(contents, "{\"n\":1}\n{\"n\":2}\n");
        let entries: Vec<Entry> = read_jsonl(&path).expect("read jsonl");
        assert_eq!(entries, vec![Entry { n: 1 }, Entry { n: 2 }]);
    }

    #[test]
    fn missing_journal_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let entries: Vec<Entry> = read_jsonl(&temp.path().join("none.jsonl")).expect("read");
        assert!(entries.is_empty());
    }

    #[test]
    fn corrupt_line_reports_line_number() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("journal.jsonl");
        fs::write(&path, "{\"n\":1}\nnot json\n").expect("write");
        let err = read_jsonl::<Entry>(&path).unwrap_err();
        assert!(format!("{err:#}").contains("line 2"));
    }
}

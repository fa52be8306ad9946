//! Raft Log Store
//!
//! In-memory view of the replicated log, optionally backed by a [`LogFile`].
//! Owned exclusively by the consensus task, so no internal locking.

use std::path::Path;

use super::entry::{Index, LogEntry, Term};
use super::segment::LogFile;
use super::WalPaths;
use crate::error::{Error, Result};

/// The node's copy of the replicated log
pub struct LogStore {
    /// Entries in index order; `entries[i]` has index `i + 1`
    entries: Vec<LogEntry>,
    /// File offset of each entry, parallel to `entries`
    offsets: Vec<u64>,
    /// Backing file, absent for memory-only logs
    file: Option<LogFile>,
}

impl LogStore {
    /// Open (or create) the durable log under `dir`
    pub fn open(dir: &Path, fsync: bool) -> Result<Self> {
        let paths = WalPaths::new(dir.to_path_buf());
        paths.ensure_dirs()?;

        let (file, records) = LogFile::open(&paths.log_path(), fsync)?;

        let mut entries = Vec::with_capacity(records.len());
        let mut offsets = Vec::with_capacity(records.len());
        for (offset, entry) in records {
            let expected = entries.len() as Index + 1;
            if entry.index != expected {
                return Err(Error::WalCorrupted {
                    offset,
                    reason: format!("expected index {}, found {}", expected, entry.index),
                });
            }
            entries.push(entry);
            offsets.push(offset);
        }

        tracing::info!(
            "Opened Raft log at {} with {} entries",
            file.path().display(),
            entries.len()
        );

        Ok(Self {
            entries,
            offsets,
            file: Some(file),
        })
    }

    /// A log that lives only in memory
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            offsets: Vec::new(),
            file: None,
        }
    }

    /// Append entries. Each must directly follow the current last index.
    pub fn append(&mut self, new: &[LogEntry]) -> Result<()> {
        for entry in new {
            let expected = self.last_index() + 1;
            if entry.index != expected {
                return Err(Error::Wal(format!(
                    "Out of order append: expected index {}, got {}",
                    expected, entry.index
                )));
            }

            let offset = match self.file.as_mut() {
                Some(file) => file.append(entry)?,
                None => 0,
            };
            self.entries.push(entry.clone());
            self.offsets.push(offset);
        }

        if !new.is_empty() {
            if let Some(file) = &self.file {
                file.sync()?;
            }
        }
        Ok(())
    }

    /// Remove every entry at or after `index`
    pub fn truncate_from(&mut self, index: Index) -> Result<()> {
        if index == 0 || index > self.last_index() {
            return Ok(());
        }

        let pos = (index - 1) as usize;
        if let Some(file) = self.file.as_mut() {
            file.truncate(self.offsets[pos])?;
        }
        tracing::debug!(
            "Truncated log from index {} (dropped {} entries)",
            index,
            self.entries.len() - pos
        );
        self.entries.truncate(pos);
        self.offsets.truncate(pos);
        Ok(())
    }

    /// Get the entry at an index
    pub fn get(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at an index. Index 0 has term 0.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    /// Index of the last entry, 0 when empty
    pub fn last_index(&self) -> Index {
        self.entries.len() as Index
    }

    /// Term of the last entry, 0 when empty
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Up to `max` entries starting at `index`
    pub fn entries_from(&self, index: Index, max: usize) -> Vec<LogEntry> {
        if index == 0 || index > self.last_index() {
            return Vec::new();
        }
        let start = (index - 1) as usize;
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Entries in the inclusive range `[from, to]`
    pub fn range(&self, from: Index, to: Index) -> Vec<LogEntry> {
        if to < from {
            return Vec::new();
        }
        self.entries_from(from, (to - from + 1) as usize)
    }

    /// First index holding the given term, used for follower conflict hints
    pub fn first_index_of_term(&self, term: Term, at_or_before: Index) -> Index {
        let mut index = at_or_before.min(self.last_index());
        while index > 1 && self.term_at(index - 1) == Some(term) {
            index -= 1;
        }
        index
    }

    /// Whether the log has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::Payload;
    use tempfile::tempdir;

    fn entries(range: std::ops::RangeInclusive<u64>, term: Term) -> Vec<LogEntry> {
        range.map(|i| LogEntry::new(i, term, Payload::Noop)).collect()
    }

    #[test]
    fn test_append_requires_contiguous_indexes() {
        let mut log = LogStore::in_memory();
        log.append(&entries(1..=3, 1)).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 1);

        let gap = entries(5..=5, 1);
        assert!(log.append(&gap).is_err());
    }

    #[test]
    fn test_term_at_and_ranges() {
        let mut log = LogStore::in_memory();
        log.append(&entries(1..=2, 1)).unwrap();
        log.append(&entries(3..=5, 2)).unwrap();

        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(3), Some(2));
        assert_eq!(log.term_at(6), None);
        assert_eq!(log.entries_from(2, 2).len(), 2);
        assert_eq!(log.range(4, 9).len(), 2);
        assert_eq!(log.first_index_of_term(2, 5), 3);
    }

    #[test]
    fn test_truncate_and_reopen() {
        let dir = tempdir().unwrap();

        {
            let mut log = LogStore::open(dir.path(), false).unwrap();
            log.append(&entries(1..=4, 1)).unwrap();
            log.truncate_from(3).unwrap();
            log.append(&entries(3..=3, 2)).unwrap();
        }

        let log = LogStore::open(dir.path(), false).unwrap();
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Some(1));
        assert_eq!(log.term_at(3), Some(2));
    }
}

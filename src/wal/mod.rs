//! Replicated Log Module
//!
//! Append-only Raft log with durable storage, truncation of conflicting
//! suffixes and recovery on restart.

pub mod entry;
mod segment;
mod store;

pub use entry::{Command, EntryKind, Index, LogEntry, MembershipChange, Payload, Term};
pub use segment::LogFile;
pub use store::LogStore;

use std::path::PathBuf;

/// Raft log directory structure
pub struct WalPaths {
    pub base_dir: PathBuf,
}

impl WalPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get path for the log file
    pub fn log_path(&self) -> PathBuf {
        self.base_dir.join("raft.log")
    }

    /// Ensure log directory exists
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_dir)
    }
}

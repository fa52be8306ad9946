//! Log File Management
//!
//! A single append-only file holding the node's Raft log. Each record is
//! framed as `[length: u32][checksum: u32][bincode entry]`. A torn record at
//! the tail (crash during append) is cut off when the file is opened.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::entry::LogEntry;
use crate::error::{Error, Result};

/// Magic bytes at the start of the log file
const LOG_MAGIC: &[u8; 8] = b"RAFTLITE";

/// Log file version
const LOG_VERSION: u32 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 16;

/// Record header size in bytes
const RECORD_HEADER_SIZE: usize = 8;

/// Upper bound on a single record, guards against garbage lengths
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

/// Log file header
#[derive(Debug, Clone, Copy)]
struct LogFileHeader {
    version: u32,
}

impl LogFileHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(LOG_MAGIC);
        bytes[8..12].copy_from_slice(&self.version.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Result<Self> {
        if &bytes[0..8] != LOG_MAGIC {
            return Err(Error::Wal("Invalid log file magic bytes".into()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[8..12]);
        let version = u32::from_le_bytes(version);
        if version != LOG_VERSION {
            return Err(Error::Wal(format!("Unsupported log file version: {}", version)));
        }

        Ok(Self { version })
    }
}

/// The on-disk log file
pub struct LogFile {
    /// File path
    path: PathBuf,
    /// File handle
    file: File,
    /// Current end of valid data
    write_pos: u64,
    /// Whether to fsync after writes
    fsync: bool,
}

impl LogFile {
    /// Open the log file, creating it if needed. Returns the file together
    /// with every intact record and its starting offset.
    pub fn open(path: &Path, fsync: bool) -> Result<(Self, Vec<(u64, LogEntry)>)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            // New (or header-torn) file.
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&LogFileHeader { version: LOG_VERSION }.to_bytes())?;
            file.sync_all()?;

            let log = Self {
                path: path.to_path_buf(),
                file,
                write_pos: HEADER_SIZE as u64,
                fsync,
            };
            return Ok((log, Vec::new()));
        }

        let mut header = [0u8; HEADER_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut header)?;
        LogFileHeader::from_bytes(&header)?;

        let mut contents = Vec::with_capacity(len as usize);
        file.read_to_end(&mut contents)?;

        let mut records = Vec::new();
        let mut pos = 0usize;
        while let Some((entry, size)) = decode_record(&contents[pos..], (HEADER_SIZE + pos) as u64)? {
            records.push(((HEADER_SIZE + pos) as u64, entry));
            pos += size;
        }

        let write_pos = (HEADER_SIZE + pos) as u64;
        if write_pos < len {
            tracing::warn!(
                "Discarding {} bytes of torn log tail in {}",
                len - write_pos,
                path.display()
            );
            file.set_len(write_pos)?;
            file.sync_all()?;
        }

        let log = Self {
            path: path.to_path_buf(),
            file,
            write_pos,
            fsync,
        };
        Ok((log, records))
    }

    /// Append a record, returning its starting offset
    pub fn append(&mut self, entry: &LogEntry) -> Result<u64> {
        let data = entry.serialize()?;
        let checksum = crc32fast::hash(&data);

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + data.len());
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(&checksum.to_le_bytes());
        record.extend_from_slice(&data);

        self.file.seek(SeekFrom::Start(self.write_pos))?;
        self.file.write_all(&record)?;

        let offset = self.write_pos;
        self.write_pos += record.len() as u64;
        Ok(offset)
    }

    /// Cut the file at the given record offset
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        if offset < HEADER_SIZE as u64 || offset > self.write_pos {
            return Err(Error::Wal(format!("Invalid truncation offset {}", offset)));
        }
        self.file.set_len(offset)?;
        self.write_pos = offset;
        self.sync()
    }

    /// Flush written records to disk if configured
    pub fn sync(&self) -> Result<()> {
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Decode one record from the front of `buf`. Returns `None` at a clean or
/// torn end of data; a checksum mismatch in a complete record is also
/// treated as the torn end.
fn decode_record(buf: &[u8], offset: u64) -> Result<Option<(LogEntry, usize)>> {
    if buf.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }

    let mut len = [0u8; 4];
    len.copy_from_slice(&buf[0..4]);
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_RECORD_SIZE {
        return Err(Error::WalCorrupted {
            offset,
            reason: format!("record length {} exceeds limit", len),
        });
    }

    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&buf[4..8]);
    let checksum = u32::from_le_bytes(checksum);

    let end = RECORD_HEADER_SIZE + len;
    if buf.len() < end {
        return Ok(None);
    }

    let data = &buf[RECORD_HEADER_SIZE..end];
    if crc32fast::hash(data) != checksum {
        return Ok(None);
    }

    let entry = LogEntry::deserialize(data).map_err(|e| Error::WalCorrupted {
        offset,
        reason: e.to_string(),
    })?;
    Ok(Some((entry, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::Payload;
    use tempfile::tempdir;

    #[test]
    fn test_reopen_recovers_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.log");

        {
            let (mut log, records) = LogFile::open(&path, false).unwrap();
            assert!(records.is_empty());
            log.append(&LogEntry::new(1, 1, Payload::Noop)).unwrap();
            log.append(&LogEntry::new(2, 1, Payload::Noop)).unwrap();
        }

        let (_log, records) = LogFile::open(&path, false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].0, HEADER_SIZE as u64);
        assert_eq!(records[1].1.index, 2);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.log");

        {
            let (mut log, _) = LogFile::open(&path, false).unwrap();
            log.append(&LogEntry::new(1, 1, Payload::Noop)).unwrap();
        }

        // Simulate a crash halfway through writing a second record.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x40, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let (mut log, records) = LogFile::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);

        // Appends continue after the last intact record.
        log.append(&LogEntry::new(2, 1, Payload::Noop)).unwrap();
        drop(log);
        let (_log, records) = LogFile::open(&path, false).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_truncate_drops_suffix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let (mut log, _) = LogFile::open(&path, false).unwrap();
        log.append(&LogEntry::new(1, 1, Payload::Noop)).unwrap();
        let second = log.append(&LogEntry::new(2, 1, Payload::Noop)).unwrap();
        log.append(&LogEntry::new(3, 1, Payload::Noop)).unwrap();
        log.truncate(second).unwrap();
        drop(log);

        let (_log, records) = LogFile::open(&path, false).unwrap();
        assert_eq!(records.len(), 1);
    }
}

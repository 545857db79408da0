//! Write-Ahead Log (WAL) for the persistent stores.
//!
//! Every mutation is appended (and optionally fsynced) before it is applied
//! in memory. On open the log is replayed to rebuild state. The sequence
//! number of a subject entry doubles as its change feed position, so
//! positions survive restarts.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][FORMAT: 1 byte][KIND: 1 byte]
//! [FRAME 1: codec-encoded WalEntry]
//! [FRAME 2: codec-encoded WalEntry]
//! ...
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::SubjectId;
use crate::policy::Policy;
use crate::subject::Application;

use super::codec::{self, FileKind};

/// A single entry in the write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number.
    pub sequence: u64,
    /// Commit time of the mutation.
    pub timestamp: DateTime<Utc>,
    /// Mutation recorded by the entry.
    pub kind: WalEntryKind,
}

/// The type of WAL entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Subject written.
    SubjectPut { id: SubjectId, document: Value },
    /// Subject removed.
    SubjectDelete { id: SubjectId },
    /// Policy written.
    PolicyPut(Policy),
    /// Application written.
    ApplicationPut(Application),
}

struct WalState {
    writer: BufWriter<File>,
    sequence: u64,
}

/// Write-Ahead Log.
///
/// Thread-safe via internal mutex; appends are serialized.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl WriteAheadLog {
    /// Opens or creates a WAL file, returning it with the entries it
    /// already holds (in order).
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Vec<WalEntry>)> {
        let (file, recovered) = codec::open_append::<WalEntry>(path, FileKind::Wal, sync_on_write)?;
        if recovered.discarded_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                bytes = recovered.discarded_bytes,
                "WAL tail was damaged and has been truncated"
            );
        }

        let mut sequence = 0;
        for entry in &recovered.records {
            if entry.sequence <= sequence {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("WAL sequence went backwards: {} after {sequence}", entry.sequence),
                ));
            }
            sequence = entry.sequence;
        }

        let wal = Self {
            path: path.to_path_buf(),
            state: Mutex::new(WalState {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        };
        Ok((wal, recovered.records))
    }

    /// Appends an entry and returns it with its assigned sequence.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<WalEntry> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| std::io::Error::other("poisoned lock: wal.append"))?;

        let entry = WalEntry {
            sequence: state.sequence + 1,
            timestamp: Utc::now(),
            kind,
        };
        let encoded = codec::encode(&entry)?;

        state.writer.write_all(&encoded)?;
        state.writer.flush()?;
        if self.sync_on_write {
            state.writer.get_ref().sync_data()?;
        }

        state.sequence = entry.sequence;
        Ok(entry)
    }

    /// Reads every entry back from disk, in order.
    ///
    /// Holds the append lock so the result ends at the current sequence.
    pub fn read_entries(&self) -> IoResult<Vec<WalEntry>> {
        let _state = self
            .state
            .lock()
            .map_err(|_| std::io::Error::other("poisoned lock: wal.read_entries"))?;

        let mut reader = BufReader::new(File::open(&self.path)?);
        codec::read_header(&mut reader, FileKind::Wal)?;
        let mut entries = Vec::new();
        while let Some(entry) = codec::read_frame::<WalEntry>(&mut reader)? {
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Sequence of the last appended entry.
    pub fn current_sequence(&self) -> u64 {
        self.state.lock().map(|s| s.sequence).unwrap_or(0)
    }

    /// Size of the WAL file in bytes.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn put(id: &str) -> WalEntryKind {
        WalEntryKind::SubjectPut {
            id: SubjectId::new(id),
            document: serde_json::json!({"id": id, "policies": []}),
        }
    }

    #[test]
    fn test_wal_append_and_replay() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let (wal, existing) = WriteAheadLog::open(&wal_path, false).unwrap();
            assert!(existing.is_empty());
            assert_eq!(wal.append(put("u1")).unwrap().sequence, 1);
            assert_eq!(wal.append(WalEntryKind::SubjectDelete { id: SubjectId::new("u1") }).unwrap().sequence, 2);
        }

        let (wal, entries) = WriteAheadLog::open(&wal_path, false).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0].kind, WalEntryKind::SubjectPut { .. }));
        assert_eq!(wal.current_sequence(), 2);
        assert_eq!(wal.append(put("u2")).unwrap().sequence, 3);
    }

    #[test]
    fn test_read_entries_sees_live_appends() {
        let dir = tempdir().unwrap();
        let (wal, _) = WriteAheadLog::open(&dir.path().join("live.wal"), false).unwrap();
        wal.append(put("u1")).unwrap();
        wal.append(put("u2")).unwrap();

        let entries = wal.read_entries().unwrap();
        assert_eq!(entries.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_wal_survives_torn_append() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("torn.wal");
        {
            let (wal, _) = WriteAheadLog::open(&wal_path, true).unwrap();
            wal.append(put("u1")).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[0x20, 0x00, 0x00]).unwrap();
        }

        let (wal, entries) = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(wal.append(put("u2")).unwrap().sequence, 2);
        drop(wal);

        let (_, entries) = WriteAheadLog::open(&wal_path, true).unwrap();
        assert_eq!(entries.len(), 2);
    }
}

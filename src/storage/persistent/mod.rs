//! Persistent storage backend.
//!
//! Durable, crash-safe storage with:
//! - Write-Ahead Logging (WAL) replayed on open
//! - File locking for single-process access
//! - CRC32 checksums for corruption detection
//! - An atomically replaced cursor file
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     PersistentStores                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  subjects ─┐                                                 │
//! │  policies ─┼──> WriteAheadLog (append-only, CRC frames)      │
//! │  apps ─────┘          │                                      │
//! │                       ↓                                      │
//! │              FileLock (.store.lock)                          │
//! └──────────────────────────────────────────────────────────────┘
//!   FileCursorStore: watch.cursor (temp + fsync + rename)
//! ```

pub(crate) mod codec;
mod cursor_file;
mod file_lock;
mod stores;
mod wal;

pub use cursor_file::FileCursorStore;
pub use file_lock::FileLock;
pub use stores::{PersistentApplicationCatalog, PersistentConsentStore, PersistentPolicyCatalog, PersistentStores};
pub use wal::{WalEntry, WalEntryKind, WriteAheadLog};

use std::path::Path;

use super::memory::ChangeLogConfig;
use super::traits::StorageError;

/// Configuration for persistent storage.
#[derive(Debug, Clone)]
pub struct PersistentConfig {
    /// Whether to fsync after every WAL append (slower but safer).
    pub sync_on_write: bool,
    /// Retained change log and subscriber buffers.
    pub changelog: ChangeLogConfig,
}

impl Default for PersistentConfig {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            changelog: ChangeLogConfig::default(),
        }
    }
}

impl PersistentConfig {
    const MIN_RETAINED_CHANGES: usize = 16;

    /// Rejects settings the store cannot run with.
    pub fn validate(self) -> Result<Self, StorageError> {
        if self.changelog.retained_changes < Self::MIN_RETAINED_CHANGES {
            return Err(StorageError::BackendError(format!(
                "retained_changes must be at least {} (got {})",
                Self::MIN_RETAINED_CHANGES,
                self.changelog.retained_changes
            )));
        }
        if self.changelog.subscriber_buffer == 0 {
            return Err(StorageError::BackendError(
                "subscriber_buffer must be non-zero".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Opens or creates a persistent consent database at `path`.
///
/// # Errors
/// - If the path cannot be created or accessed
/// - If another process holds the lock
/// - If the WAL cannot be read
///
/// # Example
/// ```rust,ignore
/// use consent_relay::storage::persistent::open_database;
///
/// let stores = open_database("./consent-data", None)?;
/// let subjects = Arc::new(stores.subjects);
/// ```
pub fn open_database(path: impl AsRef<Path>, config: Option<PersistentConfig>) -> Result<PersistentStores, StorageError> {
    let cfg = config.unwrap_or_default().validate()?;
    PersistentStores::open(path.as_ref(), cfg)
}

//! Persistent store implementations.
//!
//! Each store keeps its state in memory and writes through a shared WAL.
//! The subject store reuses the in-memory change log so its feed behaves
//! exactly like the in-memory store's, with positions taken from the WAL.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::cursor::FeedPosition;
use crate::ids::{ApplicationId, PolicyId, SubjectId};
use crate::policy::{Policy, PolicySet};
use crate::storage::changelog::SubjectTable;
use crate::storage::memory::lock_err;
use crate::storage::traits::{
    decode_subject, encode_subject, ApplicationCatalog, ChangeSubscription, ConsentStore, FeedMessage, FeedStart,
    PolicyCatalog, RawChange, StorageError, UpdateResult,
};
use crate::subject::{Application, Subject};

use super::file_lock::FileLock;
use super::wal::{WalEntry, WalEntryKind, WriteAheadLog};
use super::PersistentConfig;

const WAL_FILE: &str = "consent.wal";
const LOCK_FILE: &str = ".store.lock";

fn wal_err(e: std::io::Error) -> StorageError {
    StorageError::BackendError(format!("WAL write failed: {e}"))
}

/// Aggregate type containing all persistent stores.
///
/// This is the primary entry point for persistent storage.
pub struct PersistentStores {
    /// The database directory.
    pub dir: PathBuf,
    _lock: FileLock,
    wal: Arc<WriteAheadLog>,

    /// Subject store and change feed.
    pub subjects: PersistentConsentStore,
    /// Policy catalog.
    pub policies: PersistentPolicyCatalog,
    /// Application catalog.
    pub applications: PersistentApplicationCatalog,
}

impl std::fmt::Debug for PersistentStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStores").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl PersistentStores {
    /// Opens or creates a persistent database and replays its WAL.
    pub fn open(dir: &Path, config: PersistentConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(dir).map_err(|e| {
            StorageError::BackendError(format!("failed to create database directory: {e}"))
        })?;

        let lock = FileLock::acquire(dir, LOCK_FILE)
            .map_err(|e| StorageError::BackendError(format!("failed to acquire lock: {e}")))?;

        let (wal, entries) = WriteAheadLog::open(&dir.join(WAL_FILE), config.sync_on_write)
            .map_err(|e| StorageError::BackendError(format!("failed to open WAL: {e}")))?;
        let wal = Arc::new(wal);

        let stores = Self {
            dir: dir.to_path_buf(),
            _lock: lock,
            subjects: PersistentConsentStore {
                wal: wal.clone(),
                table: RwLock::new(SubjectTable::new(
                    config.changelog.retained_changes,
                    config.changelog.subscriber_buffer,
                )),
            },
            policies: PersistentPolicyCatalog {
                wal: wal.clone(),
                index: RwLock::new(BTreeMap::new()),
            },
            applications: PersistentApplicationCatalog {
                wal: wal.clone(),
                index: RwLock::new(BTreeMap::new()),
            },
            wal,
        };

        stores.replay(entries)?;
        Ok(stores)
    }

    fn replay(&self, entries: Vec<WalEntry>) -> Result<(), StorageError> {
        let count = entries.len();
        let mut table = self.subjects.table.write().map_err(|_| lock_err("subject.replay"))?;
        let mut policies = self.policies.index.write().map_err(|_| lock_err("policy.replay"))?;
        let mut applications = self
            .applications
            .index
            .write()
            .map_err(|_| lock_err("application.replay"))?;

        for entry in entries {
            let position = FeedPosition::new(entry.sequence);
            match entry.kind {
                WalEntryKind::SubjectPut { id, document } => {
                    table.apply(position, entry.timestamp, id, Some(document));
                }
                WalEntryKind::SubjectDelete { id } => {
                    table.apply(position, entry.timestamp, id, None);
                }
                WalEntryKind::PolicyPut(policy) => {
                    policies.insert(policy.id.clone(), policy);
                }
                WalEntryKind::ApplicationPut(application) => {
                    applications.insert(application.id.clone(), application);
                }
            }
        }

        if count > 0 {
            tracing::info!(entries = count, head = %table.head(), "replayed WAL");
        }
        Ok(())
    }

    /// Size of the WAL in bytes.
    pub fn wal_size(&self) -> u64 {
        self.wal.size_bytes().unwrap_or(0)
    }
}

// --- Subject Store ---

/// WAL-backed subject store with a resumable change feed.
pub struct PersistentConsentStore {
    wal: Arc<WriteAheadLog>,
    table: RwLock<SubjectTable>,
}

impl PersistentConsentStore {
    fn write_document(&self, id: &SubjectId, new: Option<Value>) -> Result<Option<FeedPosition>, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("subject.write"))?;
        if !table.would_change(id, new.as_ref()) {
            return Ok(None);
        }
        Ok(Some(self.commit(&mut table, id, new)?))
    }

    /// Logs then applies a change. Caller holds the table lock so WAL order
    /// and feed order agree.
    fn commit(&self, table: &mut SubjectTable, id: &SubjectId, new: Option<Value>) -> Result<FeedPosition, StorageError> {
        let kind = match &new {
            Some(document) => WalEntryKind::SubjectPut {
                id: id.clone(),
                document: document.clone(),
            },
            None => WalEntryKind::SubjectDelete { id: id.clone() },
        };
        let entry = self.wal.append(kind).map_err(wal_err)?;
        let position = FeedPosition::new(entry.sequence);
        table.apply(position, entry.timestamp, id.clone(), new);
        Ok(position)
    }

    /// Every subject change after `after`, rebuilt from the WAL with the
    /// document each change replaced.
    fn history_after(&self, after: FeedPosition) -> Result<VecDeque<FeedMessage>, StorageError> {
        let entries = self
            .wal
            .read_entries()
            .map_err(|e| StorageError::BackendError(format!("WAL read failed: {e}")))?;

        let mut documents: BTreeMap<SubjectId, Value> = BTreeMap::new();
        let mut backlog = VecDeque::new();
        for entry in entries {
            let position = FeedPosition::new(entry.sequence);
            let (id, new) = match entry.kind {
                WalEntryKind::SubjectPut { id, document } => (id, Some(document)),
                WalEntryKind::SubjectDelete { id } => (id, None),
                WalEntryKind::PolicyPut(_) | WalEntryKind::ApplicationPut(_) => continue,
            };
            let old = match &new {
                Some(document) => documents.insert(id.clone(), document.clone()),
                None => documents.remove(&id),
            };
            if position > after {
                backlog.push_back(FeedMessage::Change(RawChange {
                    position,
                    subject_id: id,
                    old,
                    new,
                    changed_at: entry.timestamp,
                    checkpoint: Some(position),
                }));
            }
        }
        Ok(backlog)
    }
}

impl ConsentStore for PersistentConsentStore {
    fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StorageError> {
        let table = self.table.read().map_err(|_| lock_err("subject.get"))?;
        table
            .get(id)
            .map(|entry| decode_subject(id, &entry.document))
            .transpose()
    }

    fn put_subject(&self, subject: Subject) -> Result<Option<FeedPosition>, StorageError> {
        let document = encode_subject(&subject)?;
        self.write_document(&subject.id, Some(document))
    }

    fn put_document(&self, id: &SubjectId, document: Value) -> Result<Option<FeedPosition>, StorageError> {
        self.write_document(id, Some(document))
    }

    fn update_subject(&self, id: &SubjectId, subject: Subject) -> Result<UpdateResult, StorageError> {
        let document = encode_subject(&subject)?;
        let mut table = self.table.write().map_err(|_| lock_err("subject.update"))?;
        if table.get(id).is_none() {
            return Ok(UpdateResult::default());
        }
        if !table.would_change(id, Some(&document)) {
            return Ok(UpdateResult { matched: 1, changed: 0 });
        }
        self.commit(&mut table, id, Some(document))?;
        Ok(UpdateResult { matched: 1, changed: 1 })
    }

    fn delete_subject(&self, id: &SubjectId) -> Result<bool, StorageError> {
        Ok(self.write_document(id, None)?.is_some())
    }

    fn list_subject_ids(&self) -> Result<Vec<SubjectId>, StorageError> {
        Ok(self.table.read().map_err(|_| lock_err("subject.list"))?.ids())
    }

    fn head(&self) -> Result<FeedPosition, StorageError> {
        Ok(self.table.read().map_err(|_| lock_err("subject.head"))?.head())
    }

    fn subscribe_changes(&self, start: FeedStart) -> Result<ChangeSubscription, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("subject.subscribe"))?;
        match start {
            // Older than the in-memory window but still on disk.
            FeedStart::After(requested) if requested < table.evicted_through() && requested <= table.head() => {
                let backlog = self.history_after(requested)?;
                tracing::info!(
                    after = %requested,
                    head = %table.head(),
                    changes = backlog.len(),
                    "replaying change feed from WAL"
                );
                Ok(table.attach(backlog))
            }
            _ => table.subscribe(start),
        }
    }
}

// --- Policy Catalog ---

/// WAL-backed policy catalog.
pub struct PersistentPolicyCatalog {
    wal: Arc<WriteAheadLog>,
    index: RwLock<BTreeMap<PolicyId, Policy>>,
}

impl PolicyCatalog for PersistentPolicyCatalog {
    fn list_policies(&self, filter: Option<&PolicySet>) -> Result<Vec<Policy>, StorageError> {
        let index = self.index.read().map_err(|_| lock_err("policy.list"))?;
        Ok(index
            .values()
            .filter(|p| filter.map_or(true, |f| f.contains(&p.id)))
            .cloned()
            .collect())
    }

    fn put_policy(&self, policy: Policy) -> Result<(), StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("policy.put"))?;
        if index.get(&policy.id) == Some(&policy) {
            return Ok(());
        }
        self.wal.append(WalEntryKind::PolicyPut(policy.clone())).map_err(wal_err)?;
        index.insert(policy.id.clone(), policy);
        Ok(())
    }
}

// --- Application Catalog ---

/// WAL-backed application catalog.
pub struct PersistentApplicationCatalog {
    wal: Arc<WriteAheadLog>,
    index: RwLock<BTreeMap<ApplicationId, Application>>,
}

impl ApplicationCatalog for PersistentApplicationCatalog {
    fn get_application(&self, id: &ApplicationId) -> Result<Option<Application>, StorageError> {
        Ok(self
            .index
            .read()
            .map_err(|_| lock_err("application.get"))?
            .get(id)
            .cloned())
    }

    fn list_applications(&self) -> Result<Vec<Application>, StorageError> {
        Ok(self
            .index
            .read()
            .map_err(|_| lock_err("application.list"))?
            .values()
            .cloned()
            .collect())
    }

    fn put_application(&self, application: Application) -> Result<(), StorageError> {
        let mut index = self.index.write().map_err(|_| lock_err("application.put"))?;
        if index.get(&application.id) == Some(&application) {
            return Ok(());
        }
        self.wal
            .append(WalEntryKind::ApplicationPut(application.clone()))
            .map_err(wal_err)?;
        index.insert(application.id.clone(), application);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::storage::ChangeLogConfig;

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let position = {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            stores.policies.put_policy(Policy::new("p1", "d", "l", "pr", "pu", "r")).unwrap();
            stores
                .applications
                .put_application(Application::new("a1", "App", ["p1"]))
                .unwrap();
            stores
                .subjects
                .put_subject(Subject::new("u1", "Alice").with_policies(["p1"]))
                .unwrap()
                .unwrap()
        };

        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        assert_eq!(stores.subjects.head().unwrap(), position);
        let subject = stores.subjects.get_subject(&SubjectId::new("u1")).unwrap().unwrap();
        assert!(subject.policies.contains(&PolicyId::new("p1")));
        assert_eq!(stores.policies.list_policies(None).unwrap().len(), 1);
        assert!(stores
            .applications
            .get_application(&ApplicationId::new("a1"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_feed_resumes_across_reopen() {
        let dir = tempdir().unwrap();
        let first = {
            let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
            let first = stores.subjects.put_subject(Subject::new("u1", "a")).unwrap().unwrap();
            stores
                .subjects
                .put_subject(Subject::new("u1", "a").with_policies(["p2"]))
                .unwrap();
            first
        };

        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        let mut sub = stores.subjects.subscribe_changes(FeedStart::After(first)).unwrap();
        match sub.next_timeout(Duration::ZERO).unwrap() {
            Some(FeedMessage::Change(change)) => {
                assert!(change.position > first);
                assert!(change.old.is_some());
            }
            other => panic!("expected replayed change, got {other:?}"),
        }
        assert_eq!(sub.next_timeout(Duration::ZERO).unwrap(), Some(FeedMessage::Ready));
    }

    #[test]
    fn test_feed_replays_evicted_history_from_wal() {
        let dir = tempdir().unwrap();
        let config = PersistentConfig {
            sync_on_write: false,
            changelog: ChangeLogConfig {
                retained_changes: 2,
                subscriber_buffer: 64,
            },
        };
        {
            let stores = PersistentStores::open(dir.path(), config.clone()).unwrap();
            stores.subjects.put_subject(Subject::new("u1", "a")).unwrap();
            stores
                .subjects
                .put_subject(Subject::new("u1", "a").with_policies(["p1"]))
                .unwrap();
            stores.policies.put_policy(Policy::new("p1", "d", "l", "pr", "pu", "r")).unwrap();
            stores.subjects.delete_subject(&SubjectId::new("u1")).unwrap();
            stores.subjects.put_subject(Subject::new("u2", "b")).unwrap();
            stores.subjects.put_subject(Subject::new("u3", "c")).unwrap();
        }

        let stores = PersistentStores::open(dir.path(), config).unwrap();
        assert_eq!(stores.subjects.head().unwrap(), FeedPosition::new(6));
        let mut sub = stores
            .subjects
            .subscribe_changes(FeedStart::After(FeedPosition::new(1)))
            .unwrap();

        let mut changes = Vec::new();
        loop {
            match sub.next_timeout(Duration::ZERO).unwrap() {
                Some(FeedMessage::Change(change)) => changes.push(change),
                Some(FeedMessage::Ready) => break,
                None => panic!("backlog ended without Ready"),
            }
        }
        let positions: Vec<u64> = changes.iter().map(|c| c.position.as_u64()).collect();
        assert_eq!(positions, vec![2, 4, 5, 6]);
        assert!(changes.iter().all(|c| c.checkpoint == Some(c.position)));

        let update = &changes[0];
        let u1 = SubjectId::new("u1");
        assert!(decode_subject(&u1, update.old.as_ref().unwrap()).unwrap().policies.is_empty());
        assert_eq!(decode_subject(&u1, update.new.as_ref().unwrap()).unwrap().policies.len(), 1);

        let tombstone = &changes[1];
        assert_eq!(tombstone.subject_id, u1);
        assert!(tombstone.new.is_none());
        assert_eq!(tombstone.old, update.new);

        assert!(changes[2].old.is_none());

        stores.subjects.put_subject(Subject::new("u4", "d")).unwrap();
        match sub.next_timeout(Duration::from_secs(1)).unwrap() {
            Some(FeedMessage::Change(change)) => assert_eq!(change.position, FeedPosition::new(7)),
            other => panic!("expected live change, got {other:?}"),
        }
    }

    #[test]
    fn test_second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let _stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        assert!(PersistentStores::open(dir.path(), PersistentConfig::default()).is_err());
    }

    #[test]
    fn test_update_missing_subject_writes_nothing() {
        let dir = tempdir().unwrap();
        let stores = PersistentStores::open(dir.path(), PersistentConfig::default()).unwrap();
        let result = stores
            .subjects
            .update_subject(&SubjectId::new("ghost"), Subject::new("ghost", ""))
            .unwrap();
        assert_eq!(result.matched, 0);
        assert_eq!(stores.subjects.head().unwrap(), FeedPosition::ORIGIN);
    }
}

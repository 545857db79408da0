//! In-memory storage backend.
//!
//! Thread-safe implementations of the storage traits for embedded usage,
//! tests, and as a reference for external adapters. The consent store can
//! simulate outages and dropped change feeds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use chrono::Utc;
use serde_json::Value;

use crate::cursor::FeedPosition;
use crate::ids::{ApplicationId, PolicyId, SubjectId};
use crate::policy::{Policy, PolicySet};
use crate::subject::{Application, Subject};

use super::changelog::SubjectTable;
use super::traits::{
    decode_subject, encode_subject, ApplicationCatalog, ChangeSubscription, ConsentStore, FeedStart,
    PolicyCatalog, StorageError, UpdateResult,
};

pub(crate) fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

/// Sizing of the retained change log and subscriber buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeLogConfig {
    /// Changes kept for resuming subscriptions.
    pub retained_changes: usize,
    /// Per-subscriber live buffer; overflowing subscribers are disconnected.
    pub subscriber_buffer: usize,
}

impl Default for ChangeLogConfig {
    fn default() -> Self {
        Self {
            retained_changes: 100_000,
            subscriber_buffer: 4_096,
        }
    }
}

/// In-memory consent store.
#[derive(Debug)]
pub struct MemoryConsentStore {
    table: RwLock<SubjectTable>,
    available: AtomicBool,
}

impl Default for MemoryConsentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConsentStore {
    /// Empty store with the default change log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(ChangeLogConfig::default())
    }

    /// Empty store with the given change log settings.
    #[must_use]
    pub fn with_config(config: ChangeLogConfig) -> Self {
        Self {
            table: RwLock::new(SubjectTable::new(config.retained_changes, config.subscriber_buffer)),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable every call fails with
    /// `ConnectionError` and live feeds are dropped.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        if !available {
            let _ = self.disconnect_feeds();
        }
    }

    /// Drops every live change feed. Returns how many were dropped.
    pub fn disconnect_feeds(&self) -> Result<usize, StorageError> {
        let mut table = self.table.write().map_err(|_| lock_err("subject.disconnect"))?;
        Ok(table.disconnect_all())
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StorageError::ConnectionError("consent store unavailable".to_string()))
        }
    }

    fn write_document(&self, id: &SubjectId, new: Option<Value>) -> Result<Option<FeedPosition>, StorageError> {
        self.check_available()?;
        let mut table = self.table.write().map_err(|_| lock_err("subject.write"))?;
        if !table.would_change(id, new.as_ref()) {
            return Ok(None);
        }
        let position = table.head().next();
        table.apply(position, Utc::now(), id.clone(), new);
        Ok(Some(position))
    }
}

impl ConsentStore for MemoryConsentStore {
    fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StorageError> {
        self.check_available()?;
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
        self.check_available()?;
        let document = encode_subject(&subject)?;
        let mut table = self.table.write().map_err(|_| lock_err("subject.update"))?;
        if table.get(id).is_none() {
            return Ok(UpdateResult::default());
        }
        if !table.would_change(id, Some(&document)) {
            return Ok(UpdateResult { matched: 1, changed: 0 });
        }
        let position = table.head().next();
        table.apply(position, Utc::now(), id.clone(), Some(document));
        Ok(UpdateResult { matched: 1, changed: 1 })
    }

    fn delete_subject(&self, id: &SubjectId) -> Result<bool, StorageError> {
        Ok(self.write_document(id, None)?.is_some())
    }

    fn list_subject_ids(&self) -> Result<Vec<SubjectId>, StorageError> {
        self.check_available()?;
        Ok(self.table.read().map_err(|_| lock_err("subject.list"))?.ids())
    }

    fn head(&self) -> Result<FeedPosition, StorageError> {
        self.check_available()?;
        Ok(self.table.read().map_err(|_| lock_err("subject.head"))?.head())
    }

    fn subscribe_changes(&self, start: FeedStart) -> Result<ChangeSubscription, StorageError> {
        self.check_available()?;
        self.table
            .write()
            .map_err(|_| lock_err("subject.subscribe"))?
            .subscribe(start)
    }
}

/// In-memory policy catalog.
#[derive(Debug, Default)]
pub struct MemoryPolicyCatalog {
    policies: RwLock<BTreeMap<PolicyId, Policy>>,
}

impl MemoryPolicyCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PolicyCatalog for MemoryPolicyCatalog {
    fn list_policies(&self, filter: Option<&PolicySet>) -> Result<Vec<Policy>, StorageError> {
        let policies = self.policies.read().map_err(|_| lock_err("policy.list"))?;
        Ok(policies
            .values()
            .filter(|p| filter.map_or(true, |f| f.contains(&p.id)))
            .cloned()
            .collect())
    }

    fn put_policy(&self, policy: Policy) -> Result<(), StorageError> {
        self.policies
            .write()
            .map_err(|_| lock_err("policy.put"))?
            .insert(policy.id.clone(), policy);
        Ok(())
    }
}

/// In-memory application catalog.
#[derive(Debug, Default)]
pub struct MemoryApplicationCatalog {
    applications: RwLock<BTreeMap<ApplicationId, Application>>,
}

impl MemoryApplicationCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApplicationCatalog for MemoryApplicationCatalog {
    fn get_application(&self, id: &ApplicationId) -> Result<Option<Application>, StorageError> {
        Ok(self
            .applications
            .read()
            .map_err(|_| lock_err("application.get"))?
            .get(id)
            .cloned())
    }

    fn list_applications(&self) -> Result<Vec<Application>, StorageError> {
        Ok(self
            .applications
            .read()
            .map_err(|_| lock_err("application.list"))?
            .values()
            .cloned()
            .collect())
    }

    fn put_application(&self, application: Application) -> Result<(), StorageError> {
        self.applications
            .write()
            .map_err(|_| lock_err("application.put"))?
            .insert(application.id.clone(), application);
        Ok(())
    }
}

/// Convenience bundle of in-memory stores.
#[derive(Debug, Default)]
pub struct InMemoryStores {
    /// Subjects and their change feed.
    pub subjects: MemoryConsentStore,
    /// Policy catalog.
    pub policies: MemoryPolicyCatalog,
    /// Application catalog.
    pub applications: MemoryApplicationCatalog,
}

impl InMemoryStores {
    /// Create a new bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::storage::FeedMessage;

    #[test]
    fn test_put_and_get_subject() {
        let store = MemoryConsentStore::new();
        let subject = Subject::new("u1", "Alice").with_policies(["p1"]);
        assert_eq!(store.put_subject(subject.clone()).unwrap(), Some(FeedPosition::new(1)));
        assert_eq!(store.get_subject(&SubjectId::new("u1")).unwrap(), Some(subject.clone()));

        // identical write is a no-op
        assert_eq!(store.put_subject(subject).unwrap(), None);
        assert_eq!(store.head().unwrap(), FeedPosition::new(1));
    }

    #[test]
    fn test_update_missing_subject_matches_nothing() {
        let store = MemoryConsentStore::new();
        let result = store
            .update_subject(&SubjectId::new("ghost"), Subject::new("ghost", "x"))
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 0, changed: 0 });
        assert_eq!(store.head().unwrap(), FeedPosition::ORIGIN);
    }

    #[test]
    fn test_update_unchanged_reports_zero_changed() {
        let store = MemoryConsentStore::new();
        let subject = Subject::new("u1", "Alice").with_policies(["p1"]);
        store.put_subject(subject.clone()).unwrap();
        let result = store.update_subject(&subject.id, subject.clone()).unwrap();
        assert_eq!(result, UpdateResult { matched: 1, changed: 0 });

        let result = store
            .update_subject(&subject.id, subject.clone().with_policies(["p2"]))
            .unwrap();
        assert_eq!(result, UpdateResult { matched: 1, changed: 1 });
    }

    #[test]
    fn test_delete_subject() {
        let store = MemoryConsentStore::new();
        store.put_subject(Subject::new("u1", "Alice")).unwrap();
        assert!(store.delete_subject(&SubjectId::new("u1")).unwrap());
        assert!(!store.delete_subject(&SubjectId::new("u1")).unwrap());
        assert!(store.list_subject_ids().unwrap().is_empty());
    }

    #[test]
    fn test_unavailable_store_fails_transiently() {
        let store = MemoryConsentStore::new();
        let mut sub = store.subscribe_changes(FeedStart::IncludeInitial).unwrap();
        assert_eq!(sub.next_timeout(Duration::ZERO).unwrap(), Some(FeedMessage::Ready));

        store.set_available(false);
        let err = store.head().unwrap_err();
        assert!(err.is_transient());
        assert!(sub.next_timeout(Duration::from_millis(1)).is_err());

        store.set_available(true);
        assert!(store.subscribe_changes(FeedStart::After(FeedPosition::ORIGIN)).is_ok());
    }

    #[test]
    fn test_policy_catalog_filter() {
        let catalog = MemoryPolicyCatalog::new();
        catalog.put_policy(Policy::new("p2", "d", "l", "pr", "pu", "r")).unwrap();
        catalog.put_policy(Policy::new("p1", "d", "l", "pr", "pu", "r")).unwrap();

        let all = catalog.list_policies(None).unwrap();
        assert_eq!(all.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), vec!["p1", "p2"]);

        let filter: PolicySet = ["p2", "p9"].into_iter().collect();
        let some = catalog.list_policies(Some(&filter)).unwrap();
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].id.as_str(), "p2");
    }

    #[test]
    fn test_application_catalog() {
        let catalog = MemoryApplicationCatalog::new();
        catalog.put_application(Application::new("a1", "App", ["p1"])).unwrap();
        assert!(catalog.get_application(&ApplicationId::new("a1")).unwrap().is_some());
        assert!(catalog.get_application(&ApplicationId::new("a2")).unwrap().is_none());
        assert_eq!(catalog.list_applications().unwrap().len(), 1);
    }
}

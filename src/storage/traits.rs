//! Abstract storage traits for consent-relay.
//!
//! These traits define the contract the relay expects from its
//! collaborators:
//! - a consent store holding subjects, with a resumable change feed
//! - a read-mostly policy catalog
//! - a read-mostly application catalog
//!
//! In-memory backends live in [`super::memory`], durable ones in
//! `super::persistent` (feature `persistent`). Adapters for external
//! document stores implement the same traits and hand out
//! [`ChangeSubscription`]s built with [`ChangeSubscription::from_parts`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::cursor::FeedPosition;
use crate::error::RelayError;
use crate::ids::{ApplicationId, SubjectId};
use crate::policy::{Policy, PolicySet};
use crate::subject::{Application, Subject};

pub use super::changelog::ChangeSubscription;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Subject not found.
    #[error("Subject not found: {0}")]
    SubjectNotFound(SubjectId),

    /// Application not found.
    #[error("Application not found: {0}")]
    ApplicationNotFound(ApplicationId),

    /// A stored document does not decode as the expected record.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// The requested resume position is no longer (or not yet) in the change log.
    #[error("Feed position {requested} unavailable (retained range {oldest}..={head})")]
    CursorExpired {
        requested: FeedPosition,
        oldest: FeedPosition,
        head: FeedPosition,
    },

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Connection failed or the change feed was dropped.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl StorageError {
    /// Returns true if retrying (after a backoff) can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionError(_))
    }
}

impl From<StorageError> for RelayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::SubjectNotFound(id) => Self::RecordNotFound {
                kind: "Subject",
                id: id.to_string(),
            },
            StorageError::ApplicationNotFound(id) => Self::RecordNotFound {
                kind: "Application",
                id: id.to_string(),
            },
            StorageError::ConnectionError(message) => Self::TransientInfra {
                component: "consent store",
                message,
            },
            other => Self::internal(other.to_string()),
        }
    }
}

/// Outcome of an update, in document-store terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Records matched by the update (0 when the subject does not exist).
    pub matched: u64,
    /// Records whose content actually changed.
    pub changed: u64,
}

/// Where a change feed subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStart {
    /// Emit every current subject first (as a creation), then live changes.
    IncludeInitial,
    /// Replay every change after this position, then live changes.
    After(FeedPosition),
    /// Like `IncludeInitial`, preceded by a tombstone (last document as
    /// `old`, no `new`) for every subject deleted after this position.
    /// Resumes a position the store can no longer replay.
    SnapshotSince(FeedPosition),
}

/// One change of one subject document, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    /// Feed position of the change (for initial snapshots: of the last
    /// change that produced the current document).
    pub position: FeedPosition,
    /// Subject the document belongs to.
    pub subject_id: SubjectId,
    /// Document before the change.
    pub old: Option<Value>,
    /// Document after the change.
    pub new: Option<Value>,
    /// Store commit time.
    pub changed_at: DateTime<Utc>,
    /// Position that becomes a valid resume point once this change and
    /// everything before it is confirmed. `None` inside an initial snapshot.
    pub checkpoint: Option<FeedPosition>,
}

/// Message on a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// One change.
    Change(RawChange),
    /// Backlog (replay or initial snapshot) fully delivered; live from here.
    Ready,
}

/// Storage trait for subjects and their change feed.
///
/// # Feed Semantics
/// - Positions are strictly increasing across the store's lifetime
/// - A subscription started `After(p)` yields every change with position `> p`
///   in order, then `Ready`, then live changes
/// - A dropped or overflowing subscription surfaces as `ConnectionError`
pub trait ConsentStore: Send + Sync {
    /// Get a subject by id.
    fn get_subject(&self, id: &SubjectId) -> Result<Option<Subject>, StorageError>;

    /// Insert or replace a subject. Returns the feed position of the change,
    /// or `None` when the stored document was already identical.
    fn put_subject(&self, subject: Subject) -> Result<Option<FeedPosition>, StorageError>;

    /// Insert or replace a raw document (no schema check).
    fn put_document(&self, id: &SubjectId, document: Value) -> Result<Option<FeedPosition>, StorageError>;

    /// Replace an existing subject. Missing subjects match nothing.
    fn update_subject(&self, id: &SubjectId, subject: Subject) -> Result<UpdateResult, StorageError>;

    /// Delete a subject. Returns false if it did not exist.
    fn delete_subject(&self, id: &SubjectId) -> Result<bool, StorageError>;

    /// All subject ids, ascending.
    fn list_subject_ids(&self) -> Result<Vec<SubjectId>, StorageError>;

    /// Position of the most recent change.
    fn head(&self) -> Result<FeedPosition, StorageError>;

    /// Subscribe to the change feed.
    fn subscribe_changes(&self, start: FeedStart) -> Result<ChangeSubscription, StorageError>;
}

/// Storage trait for the policy catalog.
pub trait PolicyCatalog: Send + Sync {
    /// Policies ordered by id, optionally restricted to `filter`.
    fn list_policies(&self, filter: Option<&PolicySet>) -> Result<Vec<Policy>, StorageError>;

    /// Insert or replace a policy.
    fn put_policy(&self, policy: Policy) -> Result<(), StorageError>;
}

/// Storage trait for the application catalog.
pub trait ApplicationCatalog: Send + Sync {
    /// Get an application by id.
    fn get_application(&self, id: &ApplicationId) -> Result<Option<Application>, StorageError>;

    /// All applications ordered by id.
    fn list_applications(&self) -> Result<Vec<Application>, StorageError>;

    /// Insert or replace an application.
    fn put_application(&self, application: Application) -> Result<(), StorageError>;
}

/// Decodes a stored subject document.
pub fn decode_subject(id: &SubjectId, document: &Value) -> Result<Subject, StorageError> {
    let subject: Subject = serde_json::from_value(document.clone()).map_err(|e| StorageError::Corrupt {
        id: id.to_string(),
        reason: e.to_string(),
    })?;
    if &subject.id != id {
        return Err(StorageError::Corrupt {
            id: id.to_string(),
            reason: format!("document carries id {}", subject.id),
        });
    }
    Ok(subject)
}

/// Encodes a subject as a stored document.
pub fn encode_subject(subject: &Subject) -> Result<Value, StorageError> {
    serde_json::to_value(subject).map_err(|e| StorageError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time test: ensure traits are object-safe
    fn _assert_consent_store_object_safe(_: &dyn ConsentStore) {}
    fn _assert_policy_catalog_object_safe(_: &dyn PolicyCatalog) {}
    fn _assert_application_catalog_object_safe(_: &dyn ApplicationCatalog) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::SubjectNotFound(SubjectId::new("u1"));
        assert!(err.to_string().contains("Subject not found"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_relay_error_mapping() {
        let err: RelayError = StorageError::SubjectNotFound(SubjectId::new("u1")).into();
        assert_eq!(err.status_code(), 404);

        let err: RelayError = StorageError::ConnectionError("reset".to_string()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_decode_subject_checks_id() {
        let doc = serde_json::json!({"id": "u2", "name": "x", "policies": []});
        let err = decode_subject(&SubjectId::new("u1"), &doc).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[test]
    fn test_decode_subject_rejects_garbage() {
        let doc = serde_json::json!({"id": "u1", "policies": 17});
        assert!(decode_subject(&SubjectId::new("u1"), &doc).is_err());
    }
}

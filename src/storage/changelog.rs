//! Subject table with a retained change log and live subscribers.
//!
//! Shared by the in-memory and the persistent consent stores: both keep the
//! current documents plus the most recent changes in memory, and differ only
//! in where positions come from and whether writes hit a WAL first.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde_json::Value;

use crate::cursor::FeedPosition;
use crate::ids::SubjectId;

use super::traits::{FeedMessage, FeedStart, RawChange, StorageError};

/// A live change feed subscription.
///
/// Buffered backlog (replay or initial snapshot) is served first, then live
/// messages. Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct ChangeSubscription {
    backlog: VecDeque<FeedMessage>,
    rx: Receiver<FeedMessage>,
}

impl ChangeSubscription {
    /// Builds a subscription from a backlog and a live channel.
    ///
    /// The sender side signals a lost feed by disconnecting.
    #[must_use]
    pub fn from_parts(backlog: VecDeque<FeedMessage>, rx: Receiver<FeedMessage>) -> Self {
        Self { backlog, rx }
    }

    /// Next message, waiting at most `timeout`.
    ///
    /// `Ok(None)` on timeout; `ConnectionError` once the feed is gone.
    pub fn next_timeout(&mut self, timeout: Duration) -> Result<Option<FeedMessage>, StorageError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(Some(msg));
        }
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StorageError::ConnectionError(
                "change feed closed".to_string(),
            )),
        }
    }

    /// Messages buffered locally (backlog plus channel).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.backlog.len() + self.rx.len()
    }
}

/// Current document of one subject.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub document: Value,
    pub position: FeedPosition,
    pub changed_at: DateTime<Utc>,
}

/// Last deletion of a subject that is currently absent or was re-created.
#[derive(Debug, Clone)]
struct Tombstone {
    position: FeedPosition,
    document: Value,
    deleted_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct SubjectTable {
    entries: BTreeMap<SubjectId, Entry>,
    /// One per subject ever deleted; outlives log eviction so a snapshot
    /// resume can still announce the deletion.
    tombstones: BTreeMap<SubjectId, Tombstone>,
    log: VecDeque<RawChange>,
    log_capacity: usize,
    subscriber_buffer: usize,
    head: FeedPosition,
    /// Changes at or before this position were evicted from the log.
    evicted_through: FeedPosition,
    subscribers: Vec<Sender<FeedMessage>>,
}

impl SubjectTable {
    pub fn new(log_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            log: VecDeque::new(),
            log_capacity: log_capacity.max(1),
            subscriber_buffer: subscriber_buffer.max(1),
            head: FeedPosition::ORIGIN,
            evicted_through: FeedPosition::ORIGIN,
            subscribers: Vec::new(),
        }
    }

    pub fn head(&self) -> FeedPosition {
        self.head
    }

    /// Positions at or before this are no longer in the log.
    #[cfg_attr(not(feature = "persistent"), allow(dead_code))]
    pub fn evicted_through(&self) -> FeedPosition {
        self.evicted_through
    }

    pub fn get(&self, id: &SubjectId) -> Option<&Entry> {
        self.entries.get(id)
    }

    pub fn ids(&self) -> Vec<SubjectId> {
        self.entries.keys().cloned().collect()
    }

    /// True if writing `new` for `id` would change the stored state.
    pub fn would_change(&self, id: &SubjectId, new: Option<&Value>) -> bool {
        match (self.entries.get(id), new) {
            (None, None) => false,
            (Some(entry), Some(doc)) => &entry.document != doc,
            _ => true,
        }
    }

    /// Applies a change at `position` and fans it out to subscribers.
    ///
    /// Callers check `would_change` first; positions must increase.
    pub fn apply(
        &mut self,
        position: FeedPosition,
        changed_at: DateTime<Utc>,
        id: SubjectId,
        new: Option<Value>,
    ) -> RawChange {
        debug_assert!(position > self.head, "feed positions must increase");

        let old = match &new {
            Some(doc) => self
                .entries
                .insert(
                    id.clone(),
                    Entry {
                        document: doc.clone(),
                        position,
                        changed_at,
                    },
                )
                .map(|e| e.document),
            None => self.entries.remove(&id).map(|e| e.document),
        };
        if let (None, Some(document)) = (&new, &old) {
            self.tombstones.insert(
                id.clone(),
                Tombstone {
                    position,
                    document: document.clone(),
                    deleted_at: changed_at,
                },
            );
        }

        let change = RawChange {
            position,
            subject_id: id,
            old,
            new,
            changed_at,
            checkpoint: Some(position),
        };

        self.head = position;
        self.log.push_back(change.clone());
        while self.log.len() > self.log_capacity {
            if let Some(evicted) = self.log.pop_front() {
                self.evicted_through = evicted.position;
            }
        }

        self.broadcast(&change);
        change
    }

    fn broadcast(&mut self, change: &RawChange) {
        // Slow subscribers are cut off; they resubscribe from their cursor.
        self.subscribers.retain(|tx| match tx.try_send(FeedMessage::Change(change.clone())) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(position = %change.position, "change feed subscriber overflowed; disconnecting");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscribe(&mut self, start: FeedStart) -> Result<ChangeSubscription, StorageError> {
        let backlog: VecDeque<FeedMessage> = match start {
            FeedStart::IncludeInitial => self.snapshot(Vec::new()),
            FeedStart::SnapshotSince(since) => {
                let mut deletions: Vec<RawChange> = self
                    .tombstones
                    .iter()
                    .filter(|(_, t)| t.position > since)
                    .map(|(id, t)| RawChange {
                        position: t.position,
                        subject_id: id.clone(),
                        old: Some(t.document.clone()),
                        new: None,
                        changed_at: t.deleted_at,
                        checkpoint: None,
                    })
                    .collect();
                deletions.sort_by_key(|c| c.position);
                self.snapshot(deletions)
            }
            FeedStart::After(requested) => {
                if requested > self.head || requested < self.evicted_through {
                    return Err(StorageError::CursorExpired {
                        requested,
                        oldest: self.evicted_through,
                        head: self.head,
                    });
                }
                self.log
                    .iter()
                    .filter(|c| c.position > requested)
                    .cloned()
                    .map(FeedMessage::Change)
                    .collect()
            }
        };
        Ok(self.attach(backlog))
    }

    /// `prefix` followed by every current subject as a creation. Only the
    /// last item carries a checkpoint (the head), so nothing is confirmed
    /// before the whole snapshot is.
    fn snapshot(&self, mut changes: Vec<RawChange>) -> VecDeque<FeedMessage> {
        changes.extend(self.entries.iter().map(|(id, entry)| RawChange {
            position: entry.position,
            subject_id: id.clone(),
            old: None,
            new: Some(entry.document.clone()),
            changed_at: entry.changed_at,
            checkpoint: None,
        }));
        if let Some(last) = changes.last_mut() {
            last.checkpoint = Some(self.head);
        }
        changes.into_iter().map(FeedMessage::Change).collect()
    }

    /// Registers a live subscriber behind `backlog` (plus `Ready`).
    ///
    /// The caller holds the table lock, so no change is applied between the
    /// backlog and the first live message.
    pub fn attach(&mut self, mut backlog: VecDeque<FeedMessage>) -> ChangeSubscription {
        backlog.push_back(FeedMessage::Ready);
        let (tx, rx) = bounded(self.subscriber_buffer);
        self.subscribers.push(tx);
        ChangeSubscription::from_parts(backlog, rx)
    }

    /// Drops every live subscription (their next read fails).
    pub fn disconnect_all(&mut self) -> usize {
        let n = self.subscribers.len();
        self.subscribers.clear();
        n
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

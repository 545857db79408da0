//! Change watcher.
//!
//! Turns a consent store's change feed into a restartable stream of decoded
//! before/after pairs. A lost feed is resubscribed from the last position
//! the coordinator acknowledged, with backoff. Items that fail to decode
//! are logged, counted and skipped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::cursor::{FeedPosition, WatchCursor};
use crate::error::RelayError;
use crate::ids::SubjectId;
use crate::shutdown::Shutdown;
use crate::storage::traits::decode_subject;
use crate::storage::{ChangeSubscription, ConsentStore, FeedMessage, FeedStart, RawChange, StorageError};
use crate::subject::Subject;

/// One decoded subject mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchItem {
    /// Subject the change is about.
    pub subject_id: SubjectId,
    /// Subject before the change.
    pub old: Option<Subject>,
    /// Subject after the change.
    pub new: Option<Subject>,
    /// Feed position of the change.
    pub position: FeedPosition,
    /// Resume point valid once this item and all before it are confirmed.
    pub checkpoint: Option<FeedPosition>,
    /// Store commit time.
    pub occurred_at: DateTime<Utc>,
}

/// What a [`WatchStream`] yields.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// A decoded change.
    Change(WatchItem),
    /// Backlog delivered; the stream is live.
    CaughtUp,
    /// Feed lost; the next poll resubscribes after `retry_in`.
    Disconnected { attempt: u32, retry_in: Duration },
}

/// Result of one bounded poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Polled {
    /// Next event.
    Event(WatchEvent),
    /// Nothing within the poll window.
    Idle,
    /// Shut down or retries exhausted.
    Closed,
}

/// Last acknowledged feed position, shared between coordinator and stream.
#[derive(Debug, Clone, Default)]
pub struct AckHandle {
    inner: Arc<AckInner>,
}

#[derive(Debug, Default)]
struct AckInner {
    position: AtomicU64,
    set: AtomicBool,
}

impl AckHandle {
    /// Handle starting at `initial`.
    #[must_use]
    pub fn new(initial: Option<FeedPosition>) -> Self {
        let handle = Self::default();
        handle.reset(initial);
        handle
    }

    /// Records `position` as acknowledged. Never moves backwards.
    pub fn acknowledge(&self, position: FeedPosition) {
        self.inner.position.fetch_max(position.as_u64(), Ordering::AcqRel);
        self.inner.set.store(true, Ordering::Release);
    }

    /// Overwrites the acknowledged position (rewind).
    pub fn reset(&self, position: Option<FeedPosition>) {
        self.inner
            .position
            .store(position.map_or(0, FeedPosition::as_u64), Ordering::Release);
        self.inner.set.store(position.is_some(), Ordering::Release);
    }

    /// Newest acknowledged position.
    #[must_use]
    pub fn position(&self) -> Option<FeedPosition> {
        self.inner
            .set
            .load(Ordering::Acquire)
            .then(|| FeedPosition::new(self.inner.position.load(Ordering::Acquire)))
    }
}

/// Watcher counters.
#[derive(Debug, Default)]
pub struct WatcherStats {
    decode_skipped: AtomicU64,
    resubscribes: AtomicU64,
    expired_fallbacks: AtomicU64,
}

impl WatcherStats {
    /// Items skipped because they did not decode.
    #[must_use]
    pub fn decode_skipped(&self) -> u64 {
        self.decode_skipped.load(Ordering::Relaxed)
    }

    /// Subscriptions opened.
    #[must_use]
    pub fn resubscribes(&self) -> u64 {
        self.resubscribes.load(Ordering::Relaxed)
    }

    /// Resumes that fell back to a snapshot.
    #[must_use]
    pub fn expired_fallbacks(&self) -> u64 {
        self.expired_fallbacks.load(Ordering::Relaxed)
    }
}

/// Factory for [`WatchStream`]s over one consent store.
pub struct ChangeWatcher {
    store: Arc<dyn ConsentStore>,
    backoff: BackoffPolicy,
    shutdown: Shutdown,
    stats: Arc<WatcherStats>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("backoff", &self.backoff)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl ChangeWatcher {
    /// Watcher over `store`, stopped by `shutdown`.
    #[must_use]
    pub fn new(store: Arc<dyn ConsentStore>, shutdown: Shutdown) -> Self {
        Self {
            store,
            backoff: BackoffPolicy::default(),
            shutdown,
            stats: Arc::new(WatcherStats::default()),
        }
    }

    /// Replaces the resubscribe backoff.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Shared counters of every stream this watcher starts.
    #[must_use]
    pub fn stats(&self) -> Arc<WatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Starts watching after `cursor`, or from the current state when there
    /// is none. The subscription is opened lazily on the first poll.
    #[must_use]
    pub fn watch(&self, cursor: Option<WatchCursor>) -> WatchStream {
        WatchStream {
            store: Arc::clone(&self.store),
            ack: AckHandle::new(cursor.map(|c| c.position)),
            subscription: None,
            backoff: self.backoff.start(),
            retry_at: None,
            carried_checkpoint: None,
            shutdown: self.shutdown.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

/// Cancellable, restartable stream of [`WatchEvent`]s.
pub struct WatchStream {
    store: Arc<dyn ConsentStore>,
    ack: AckHandle,
    subscription: Option<ChangeSubscription>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    /// Checkpoint of a skipped item, handed to the next emitted item.
    carried_checkpoint: Option<FeedPosition>,
    shutdown: Shutdown,
    stats: Arc<WatcherStats>,
}

impl std::fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStream")
            .field("ack", &self.ack.position())
            .field("subscribed", &self.subscription.is_some())
            .finish_non_exhaustive()
    }
}

impl WatchStream {
    /// Handle the consumer uses to acknowledge positions.
    #[must_use]
    pub fn ack_handle(&self) -> AckHandle {
        self.ack.clone()
    }

    /// Drops the current subscription and restarts after `cursor` (or from
    /// the current state). Takes effect on the next poll.
    pub fn rewind(&mut self, cursor: Option<WatchCursor>) {
        self.subscription = None;
        self.ack.reset(cursor.map(|c| c.position));
        self.carried_checkpoint = None;
        self.retry_at = None;
        self.backoff.reset();
        tracing::info!(cursor = ?cursor.map(|c| c.position.as_u64()), "rewinding change watcher");
    }

    /// Waits at most about `wait` for the next event.
    pub fn poll_event(&mut self, wait: Duration) -> Polled {
        if self.shutdown.is_triggered() {
            return Polled::Closed;
        }

        if let Some(retry_at) = self.retry_at {
            let remaining = retry_at.saturating_duration_since(Instant::now());
            if !remaining.is_zero() {
                let slice = remaining.min(wait);
                if !self.shutdown.sleep(slice) {
                    return Polled::Closed;
                }
                if slice < remaining {
                    return Polled::Idle;
                }
            }
            self.retry_at = None;
        }

        if self.subscription.is_none() {
            match self.subscribe() {
                Ok(subscription) => self.subscription = Some(subscription),
                Err(err) => return self.disconnected(&err),
            }
        }
        let Some(subscription) = self.subscription.as_mut() else {
            return Polled::Idle;
        };

        match subscription.next_timeout(wait) {
            Ok(None) => Polled::Idle,
            Ok(Some(FeedMessage::Ready)) => {
                self.backoff.reset();
                Polled::Event(WatchEvent::CaughtUp)
            }
            Ok(Some(FeedMessage::Change(raw))) => match self.decode(raw) {
                Some(item) => Polled::Event(WatchEvent::Change(item)),
                None => Polled::Idle,
            },
            Err(err) => {
                self.subscription = None;
                self.disconnected(&err)
            }
        }
    }

    /// Blocks until the next event; `None` once the stream is closed.
    pub fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            match self.poll_event(Duration::from_millis(250)) {
                Polled::Event(event) => return Some(event),
                Polled::Idle => {}
                Polled::Closed => return None,
            }
        }
    }

    fn subscribe(&mut self) -> Result<ChangeSubscription, StorageError> {
        let start = self.ack.position().map_or(FeedStart::IncludeInitial, FeedStart::After);
        match self.store.subscribe_changes(start) {
            Ok(subscription) => {
                self.stats.resubscribes.fetch_add(1, Ordering::Relaxed);
                tracing::info!(start = ?start, "subscribed to change feed");
                Ok(subscription)
            }
            Err(StorageError::CursorExpired { requested, oldest, head }) => {
                self.stats.expired_fallbacks.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    requested = %requested,
                    oldest = %oldest,
                    head = %head,
                    "resume position no longer in change log; replaying deletions and current state"
                );
                let subscription = self.store.subscribe_changes(FeedStart::SnapshotSince(requested))?;
                self.stats.resubscribes.fetch_add(1, Ordering::Relaxed);
                Ok(subscription)
            }
            Err(err) => Err(err),
        }
    }

    fn disconnected(&mut self, err: &StorageError) -> Polled {
        let attempt = self.backoff.attempts() + 1;
        let Some(retry_in) = self.backoff.next_delay() else {
            tracing::error!(error = %err, attempt, "change feed retries exhausted");
            return Polled::Closed;
        };
        tracing::warn!(
            error = %err,
            attempt,
            retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
            "change feed disconnected"
        );
        self.retry_at = Some(Instant::now() + retry_in);
        Polled::Event(WatchEvent::Disconnected { attempt, retry_in })
    }

    fn decode(&mut self, raw: RawChange) -> Option<WatchItem> {
        let decoded = raw
            .old
            .as_ref()
            .map(|doc| decode_subject(&raw.subject_id, doc))
            .transpose()
            .and_then(|old| {
                let new = raw
                    .new
                    .as_ref()
                    .map(|doc| decode_subject(&raw.subject_id, doc))
                    .transpose()?;
                Ok((old, new))
            });

        match decoded {
            Ok((old, new)) => {
                let checkpoint = match (raw.checkpoint, self.carried_checkpoint.take()) {
                    (Some(own), Some(carried)) => Some(own.max(carried)),
                    (own, carried) => own.or(carried),
                };
                Some(WatchItem {
                    subject_id: raw.subject_id,
                    old,
                    new,
                    position: raw.position,
                    checkpoint,
                    occurred_at: raw.changed_at,
                })
            }
            Err(err) => {
                self.stats.decode_skipped.fetch_add(1, Ordering::Relaxed);
                let corruption = RelayError::DecodeCorruption {
                    position: raw.position,
                    reason: err.to_string(),
                };
                tracing::warn!(subject_id = %raw.subject_id, error = %corruption, "skipping undecodable change");
                if let Some(checkpoint) = raw.checkpoint {
                    self.carried_checkpoint = Some(self.carried_checkpoint.map_or(checkpoint, |c| c.max(checkpoint)));
                }
                None
            }
        }
    }
}

impl Iterator for WatchStream {
    type Item = WatchEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event()
    }
}

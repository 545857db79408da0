//! Reconciliation coordinator.
//!
//! Owns the watch cursor and drives the pipeline:
//!
//! ```text
//!  WatchStream ──> coordinator ──(blake3(subject) % N)──> lane 0..N ──> EventPublisher ──> bus
//!       ^               ^                                                     │
//!       └── ack ────────┴──────────────── completions ────────────────────────┘
//! ```
//!
//! The coordinator thread is the only writer of the cursor. Each dispatched
//! item gets a ticket; the cursor advances to the checkpoint of the longest
//! fully confirmed ticket prefix, so it never passes an unconfirmed event.
//! When the publisher abandons an event the coordinator bumps its epoch
//! (stale lane work is dropped), waits for the bus, and rewinds the watcher
//! to the durable cursor. An event the bus keeps refusing is rewound at most
//! `max_event_rewinds` times, then dead-lettered: logged, counted and
//! confirmed so the feed moves on.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use uuid::Uuid;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::cursor::{CursorError, CursorStore, FeedPosition, WatchCursor};
use crate::delta::{ChangeKind, ConsentDelta};
use crate::error::{RelayError, RelayResult};
use crate::ids::SubjectId;
use crate::publisher::{EventPublisher, PublishAck, PublishError};
use crate::shutdown::Shutdown;
use crate::storage::ConsentStore;
use crate::watcher::{AckHandle, ChangeWatcher, Polled, WatchEvent, WatchItem, WatchStream};

/// Lifecycle of a coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorState {
    /// Loading the cursor and spawning lanes.
    Starting,
    /// Replaying the backlog or initial snapshot.
    CatchingUp,
    /// Following live changes.
    Live,
    /// Waiting for the feed or the bus to come back.
    Reconnecting,
    /// Finishing in-flight events before stopping.
    Draining,
    /// Run finished.
    Stopped,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::CatchingUp => "catching-up",
            Self::Live => "live",
            Self::Reconnecting => "reconnecting",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Worker lanes.
    pub lanes: usize,
    /// Queued items per lane.
    pub lane_buffer: usize,
    /// Poll granularity of the coordinator loop.
    pub tick: Duration,
    /// Time allowed for in-flight events at shutdown.
    pub shutdown_grace: Duration,
    /// Publish `Updated` deltas that neither add nor withdraw anything.
    pub emit_empty_updates: bool,
    /// Spacing of consecutive rewinds after bus failures.
    pub rewind_backoff: BackoffPolicy,
    /// Watcher resubscribe backoff.
    pub watch_backoff: BackoffPolicy,
    /// Rewinds allowed for one event the bus rejects before it is skipped.
    pub max_event_rewinds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lanes: thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get),
            lane_buffer: 1024,
            tick: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(10),
            emit_empty_updates: false,
            rewind_backoff: BackoffPolicy::default(),
            watch_backoff: BackoffPolicy::default(),
            max_event_rewinds: 5,
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Events confirmed by the bus.
    pub published: u64,
    /// Items that produced no event.
    pub suppressed: u64,
    /// Events the publisher gave up on.
    pub abandoned: u64,
    /// Rejected events skipped after exhausting their rewinds.
    pub dead_lettered: u64,
    /// Events shed by a full publish queue.
    pub shed: u64,
    /// Feed items that did not decode as subjects.
    pub decode_skipped: u64,
    /// Subscription periods (1 + rewinds).
    pub epochs: u64,
    /// Cursor saves that failed and were retried later.
    pub cursor_write_failures: u64,
    /// Cursor persisted when the run ended.
    pub final_cursor: Option<WatchCursor>,
}

/// Stable lane for a subject.
#[must_use]
pub fn lane_for(subject_id: &SubjectId, lanes: usize) -> usize {
    let hash = blake3::hash(subject_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    let lanes = lanes.max(1) as u64;
    usize::try_from(u64::from_le_bytes(prefix) % lanes).unwrap_or(0)
}

#[derive(Debug)]
struct StateCell {
    inner: Mutex<StateLog>,
    cv: Condvar,
}

#[derive(Debug)]
struct StateLog {
    current: CoordinatorState,
    history: Vec<CoordinatorState>,
}

impl StateCell {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StateLog {
                current: CoordinatorState::Starting,
                history: vec![CoordinatorState::Starting],
            }),
            cv: Condvar::new(),
        }
    }

    fn set(&self, next: CoordinatorState) {
        let Ok(mut log) = self.inner.lock() else {
            return;
        };
        if log.current == next {
            return;
        }
        tracing::info!(from = %log.current, to = %next, "coordinator state change");
        log.current = next;
        log.history.push(next);
        self.cv.notify_all();
    }

    fn get(&self) -> CoordinatorState {
        self.inner
            .lock()
            .map_or(CoordinatorState::Stopped, |log| log.current)
    }
}

/// Control handle of a coordinator running on its own thread.
#[derive(Debug)]
pub struct CoordinatorHandle {
    state: Arc<StateCell>,
    cursor: AckHandle,
    shutdown: Shutdown,
    join: Option<JoinHandle<RelayResult<RunSummary>>>,
}

impl CoordinatorHandle {
    /// Current state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        self.state.get()
    }

    /// Every state entered so far, in order.
    #[must_use]
    pub fn state_history(&self) -> Vec<CoordinatorState> {
        self.state
            .inner
            .lock()
            .map(|log| log.history.clone())
            .unwrap_or_default()
    }

    /// Waits until the coordinator is in `target`.
    pub fn wait_for_state(&self, target: CoordinatorState, timeout: Duration) -> bool {
        let Ok(log) = self.state.inner.lock() else {
            return false;
        };
        self.state
            .cv
            .wait_timeout_while(log, timeout, |log| log.current != target)
            .map(|(log, _)| log.current == target)
            .unwrap_or(false)
    }

    /// Last durably persisted cursor position.
    #[must_use]
    pub fn cursor_position(&self) -> Option<FeedPosition> {
        self.cursor.position()
    }

    /// Requests a graceful stop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Waits for the run to finish.
    pub fn join(mut self) -> RelayResult<RunSummary> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| RelayError::internal("coordinator thread panicked"))?,
            None => Err(RelayError::internal("coordinator already joined")),
        }
    }

    /// Requests a graceful stop and waits for it.
    pub fn stop(self) -> RelayResult<RunSummary> {
        self.shutdown();
        self.join()
    }
}

/// Drives watcher, lanes and publisher; sole owner of the cursor.
pub struct Coordinator {
    store: Arc<dyn ConsentStore>,
    cursor_store: Arc<dyn CursorStore>,
    publisher: Arc<EventPublisher>,
    config: CoordinatorConfig,
    shutdown: Shutdown,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Builds a coordinator; nothing runs until `spawn` or `run`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ConsentStore>,
        cursor_store: Arc<dyn CursorStore>,
        publisher: Arc<EventPublisher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            cursor_store,
            publisher,
            config,
            shutdown: Shutdown::new(),
        }
    }

    /// Uses an externally owned shutdown signal.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Runs on a dedicated thread.
    pub fn spawn(self) -> RelayResult<CoordinatorHandle> {
        let state = Arc::new(StateCell::new());
        let cursor = AckHandle::new(None);
        let shutdown = self.shutdown.clone();

        let thread_state = Arc::clone(&state);
        let thread_cursor = cursor.clone();
        let join = thread::Builder::new()
            .name("consent-coordinator".to_string())
            .spawn(move || self.run_with(&thread_state, &thread_cursor))
            .map_err(|e| RelayError::internal(format!("failed to spawn coordinator: {e}")))?;

        Ok(CoordinatorHandle {
            state,
            cursor,
            shutdown,
            join: Some(join),
        })
    }

    /// Runs on the calling thread until shutdown.
    pub fn run(self) -> RelayResult<RunSummary> {
        self.run_with(&StateCell::new(), &AckHandle::new(None))
    }

    fn run_with(self, state: &StateCell, durable_handle: &AckHandle) -> RelayResult<RunSummary> {
        state.set(CoordinatorState::Starting);

        let cursor = match self.cursor_store.load() {
            Ok(cursor) => cursor,
            Err(CursorError::Corrupt(reason)) => {
                tracing::error!(%reason, "cursor is corrupt; replaying from current state");
                None
            }
            Err(e) => {
                state.set(CoordinatorState::Stopped);
                return Err(e.into());
            }
        };
        if let Some(c) = cursor {
            durable_handle.reset(Some(c.position));
        }
        tracing::info!(cursor = ?cursor.map(|c| c.position.as_u64()), lanes = self.config.lanes, "coordinator starting");

        let watcher = ChangeWatcher::new(Arc::clone(&self.store), self.shutdown.clone())
            .with_backoff(self.config.watch_backoff);
        let watcher_stats = watcher.stats();
        let stream = watcher.watch(cursor);

        let epoch = Arc::new(AtomicU64::new(0));
        let (done_tx, done_rx) = unbounded::<Completion>();
        let mut lane_txs = Vec::with_capacity(self.config.lanes.max(1));
        let mut lane_joins = Vec::with_capacity(self.config.lanes.max(1));
        for idx in 0..self.config.lanes.max(1) {
            let (tx, rx) = bounded::<LaneWork>(self.config.lane_buffer.max(1));
            let lane = Lane {
                rx,
                publisher: Arc::clone(&self.publisher),
                epoch: Arc::clone(&epoch),
                done: done_tx.clone(),
                emit_empty_updates: self.config.emit_empty_updates,
            };
            let join = thread::Builder::new()
                .name(format!("consent-lane-{idx}"))
                .spawn(move || lane.run())
                .map_err(|e| RelayError::internal(format!("failed to spawn lane {idx}: {e}")))?;
            lane_txs.push(tx);
            lane_joins.push(join);
        }
        drop(done_tx);

        let mut run = Run {
            state,
            durable_handle,
            cursor_store: self.cursor_store.as_ref(),
            publisher: &self.publisher,
            shutdown: &self.shutdown,
            config: &self.config,
            stream,
            epoch,
            lane_txs,
            done_rx,
            tracker: Tracker::default(),
            durable: cursor,
            unsaved: None,
            reconnect: None,
            rewind_backoff: self.config.rewind_backoff.start(),
            rejections: HashMap::new(),
            summary: RunSummary::default(),
        };

        state.set(CoordinatorState::CatchingUp);
        run.pump();
        run.drain();

        for join in lane_joins {
            if join.join().is_err() {
                tracing::error!("lane thread panicked");
            }
        }

        let mut summary = run.summary;
        summary.decode_skipped = watcher_stats.decode_skipped();
        summary.shed = self.publisher.metrics().shed;
        state.set(CoordinatorState::Stopped);
        tracing::info!(
            published = summary.published,
            suppressed = summary.suppressed,
            abandoned = summary.abandoned,
            dead_lettered = summary.dead_lettered,
            cursor = ?summary.final_cursor.map(|c| c.position.as_u64()),
            "coordinator stopped"
        );
        Ok(summary)
    }
}

struct LaneWork {
    epoch: u64,
    ticket: u64,
    item: WatchItem,
}

#[derive(Debug)]
enum LaneOutcome {
    Published(PublishAck),
    Suppressed,
    Abandoned { event_id: Uuid, error: PublishError },
    Stale,
}

#[derive(Debug)]
struct Completion {
    epoch: u64,
    ticket: u64,
    outcome: LaneOutcome,
}

struct Lane {
    rx: Receiver<LaneWork>,
    publisher: Arc<EventPublisher>,
    epoch: Arc<AtomicU64>,
    done: Sender<Completion>,
    emit_empty_updates: bool,
}

impl Lane {
    fn run(self) {
        while let Ok(work) = self.rx.recv() {
            let LaneWork { epoch, ticket, item } = work;
            let finish = |outcome| {
                let _ = self.done.send(Completion { epoch, ticket, outcome });
            };

            if epoch != self.epoch.load(Ordering::Acquire) {
                finish(LaneOutcome::Stale);
                continue;
            }

            let both_absent = item.old.is_none() && item.new.is_none();
            let delta = ConsentDelta::from_change(
                item.subject_id,
                item.old.as_ref(),
                item.new.as_ref(),
                item.occurred_at,
                item.position,
            );
            let empty_update = delta.change_kind == ChangeKind::Updated && delta.is_empty();
            if both_absent || (empty_update && !self.emit_empty_updates) {
                tracing::trace!(subject_id = %delta.subject_id, sequence = %delta.sequence, "no consent change; suppressed");
                finish(LaneOutcome::Suppressed);
                continue;
            }

            let done = self.done.clone();
            let event_id = delta.event_id;
            self.publisher.publish_with(&delta, move |outcome| {
                let outcome = match outcome {
                    Ok(ack) => LaneOutcome::Published(ack),
                    Err(error) => LaneOutcome::Abandoned { event_id, error },
                };
                let _ = done.send(Completion { epoch, ticket, outcome });
            });
        }
    }
}

#[derive(Debug)]
struct Slot {
    checkpoint: Option<FeedPosition>,
    dispatched: bool,
    done: bool,
}

/// Orders completions back into feed order.
#[derive(Debug, Default)]
struct Tracker {
    slots: BTreeMap<u64, Slot>,
    next_ticket: u64,
}

impl Tracker {
    fn admit(&mut self, checkpoint: Option<FeedPosition>) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.slots.insert(
            ticket,
            Slot {
                checkpoint,
                dispatched: false,
                done: false,
            },
        );
        ticket
    }

    fn mark_dispatched(&mut self, ticket: u64) {
        if let Some(slot) = self.slots.get_mut(&ticket) {
            slot.dispatched = true;
        }
    }

    /// Marks `ticket` confirmed; returns the newest checkpoint now covered
    /// by a fully confirmed prefix.
    fn complete(&mut self, ticket: u64) -> Option<FeedPosition> {
        if let Some(slot) = self.slots.get_mut(&ticket) {
            slot.done = true;
        }
        let mut advanced = None;
        while let Some(entry) = self.slots.first_entry() {
            if !entry.get().done {
                break;
            }
            if let Some(checkpoint) = entry.remove().checkpoint {
                advanced = Some(advanced.map_or(checkpoint, |a: FeedPosition| a.max(checkpoint)));
            }
        }
        advanced
    }

    /// Dispatched but not yet confirmed.
    fn in_flight(&self) -> usize {
        self.slots.values().filter(|s| s.dispatched && !s.done).count()
    }

    fn clear(&mut self) {
        self.slots.clear();
    }
}

struct Reconnect {
    not_before: Instant,
}

struct Run<'a> {
    state: &'a StateCell,
    durable_handle: &'a AckHandle,
    cursor_store: &'a dyn CursorStore,
    publisher: &'a EventPublisher,
    shutdown: &'a Shutdown,
    config: &'a CoordinatorConfig,
    stream: WatchStream,
    epoch: Arc<AtomicU64>,
    lane_txs: Vec<Sender<LaneWork>>,
    done_rx: Receiver<Completion>,
    tracker: Tracker,
    durable: Option<WatchCursor>,
    /// Confirmed position whose persist failed.
    unsaved: Option<FeedPosition>,
    reconnect: Option<Reconnect>,
    rewind_backoff: Backoff,
    /// Rewinds spent on events the bus refused, by event id.
    rejections: HashMap<Uuid, u32>,
    summary: RunSummary,
}

impl Run<'_> {
    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Main loop until shutdown or the stream closes.
    fn pump(&mut self) {
        loop {
            self.drain_completions();
            if self.shutdown.is_triggered() {
                return;
            }

            if let Some(reconnect) = &self.reconnect {
                let remaining = reconnect.not_before.saturating_duration_since(Instant::now());
                if !remaining.is_zero() {
                    self.shutdown.sleep(remaining.min(self.config.tick));
                    continue;
                }
                if !self.publisher.wait_connected(self.config.tick) {
                    continue;
                }
                self.reconnect = None;
                self.stream.rewind(self.durable);
                self.state.set(CoordinatorState::CatchingUp);
                continue;
            }

            match self.stream.poll_event(self.config.tick) {
                Polled::Event(WatchEvent::Change(item)) => {
                    if self.state.get() == CoordinatorState::Reconnecting {
                        self.state.set(CoordinatorState::CatchingUp);
                    }
                    self.dispatch(item);
                }
                Polled::Event(WatchEvent::CaughtUp) => {
                    self.rewind_backoff.reset();
                    self.state.set(CoordinatorState::Live);
                }
                Polled::Event(WatchEvent::Disconnected { attempt, retry_in }) => {
                    tracing::warn!(attempt, retry_in_ms = u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX), "consent store feed lost");
                    self.state.set(CoordinatorState::Reconnecting);
                }
                Polled::Idle => {}
                Polled::Closed => return,
            }
        }
    }

    fn dispatch(&mut self, item: WatchItem) {
        let epoch = self.current_epoch();
        let ticket = self.tracker.admit(item.checkpoint);
        let lane = lane_for(&item.subject_id, self.lane_txs.len());
        let mut work = LaneWork { epoch, ticket, item };

        loop {
            match self.lane_txs[lane].send_timeout(work, self.config.tick) {
                Ok(()) => {
                    self.tracker.mark_dispatched(ticket);
                    return;
                }
                Err(SendTimeoutError::Timeout(back)) => {
                    work = back;
                    self.drain_completions();
                    // Leaving the slot undispatched keeps the cursor behind it.
                    if self.shutdown.is_triggered() || self.current_epoch() != epoch {
                        return;
                    }
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    tracing::error!(lane, "lane exited unexpectedly");
                    return;
                }
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.done_rx.try_recv() {
            self.on_completion(completion);
        }
    }

    fn on_completion(&mut self, completion: Completion) {
        let current = completion.epoch == self.current_epoch();
        match completion.outcome {
            LaneOutcome::Published(ack) => {
                self.summary.published += 1;
                self.rejections.remove(&ack.event_id);
                tracing::debug!(event_id = %ack.event_id, sequence = %ack.sequence, "event confirmed");
                if current {
                    self.confirm(completion.ticket);
                }
            }
            LaneOutcome::Suppressed => {
                self.summary.suppressed += 1;
                if current {
                    self.confirm(completion.ticket);
                }
            }
            LaneOutcome::Abandoned { event_id, error } => {
                self.summary.abandoned += 1;
                if !current {
                    return;
                }
                if self.exhausted_rewinds(event_id, &error) {
                    self.summary.dead_lettered += 1;
                    tracing::error!(
                        %event_id,
                        rewinds = self.config.max_event_rewinds,
                        error = %error,
                        "event keeps being rejected; dead-lettered and skipped"
                    );
                    self.confirm(completion.ticket);
                } else {
                    self.begin_reconnect(&error);
                }
            }
            LaneOutcome::Stale => {}
        }
    }

    fn confirm(&mut self, ticket: u64) {
        let advanced = self.tracker.complete(ticket);
        let candidate = match (advanced, self.unsaved) {
            (Some(a), Some(u)) => Some(a.max(u)),
            (a, u) => a.or(u),
        };
        if let Some(position) = candidate {
            self.stream.ack_handle().acknowledge(position);
            self.persist(position);
        }
    }

    fn persist(&mut self, position: FeedPosition) {
        if self.durable.is_some_and(|d| d.position >= position) {
            self.unsaved = None;
            return;
        }
        let cursor = WatchCursor::at(position);
        match self.cursor_store.save(&cursor) {
            Ok(()) => {
                self.durable = Some(cursor);
                self.unsaved = None;
                self.durable_handle.acknowledge(position);
                tracing::debug!(position = %position, "cursor persisted");
            }
            Err(e) => {
                self.summary.cursor_write_failures += 1;
                self.unsaved = Some(position);
                tracing::warn!(position = %position, error = %e, "cursor persist failed; retrying on next advance");
            }
        }
    }

    /// Counts a rewind for an event the bus refused outright. True once the
    /// event has used up its rewinds; bus outages never count.
    fn exhausted_rewinds(&mut self, event_id: Uuid, error: &PublishError) -> bool {
        if !matches!(error, PublishError::Rejected(_) | PublishError::Encode(_)) {
            return false;
        }
        let rewinds = self.rejections.entry(event_id).or_insert(0);
        if *rewinds >= self.config.max_event_rewinds {
            self.rejections.remove(&event_id);
            return true;
        }
        *rewinds += 1;
        false
    }

    fn begin_reconnect(&mut self, err: &PublishError) {
        if self.shutdown.is_triggered() {
            return;
        }
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.tracker.clear();
        let delay = self.rewind_backoff.next_delay().unwrap_or(self.config.rewind_backoff.cap);
        tracing::warn!(
            error = %err,
            epoch,
            rewind_to = ?self.durable.map(|c| c.position.as_u64()),
            "publish abandoned; rewinding after bus recovery"
        );
        self.reconnect = Some(Reconnect {
            not_before: Instant::now() + delay,
        });
        self.state.set(CoordinatorState::Reconnecting);
    }

    fn drain(&mut self) {
        self.state.set(CoordinatorState::Draining);
        let deadline = Instant::now() + self.config.shutdown_grace;

        // Closing the lanes lets them finish queued work and exit.
        self.lane_txs.clear();

        while self.tracker.in_flight() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(in_flight = self.tracker.in_flight(), "shutdown grace elapsed with events in flight");
                break;
            }
            match self.done_rx.recv_timeout(remaining.min(self.config.tick)) {
                Ok(completion) => self.on_completion(completion),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Some(position) = self.unsaved {
            self.persist(position);
        }

        self.publisher
            .shutdown(deadline.saturating_duration_since(Instant::now()));
        // Late completions (e.g. `Closed`) still count toward the summary.
        while let Ok(completion) = self.done_rx.recv_timeout(self.config.tick) {
            self.on_completion(completion);
        }

        self.summary.epochs = self.current_epoch() + 1;
        self.summary.final_cursor = self.durable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_routing_is_stable() {
        let id = SubjectId::new("subject-42");
        let lane = lane_for(&id, 8);
        for _ in 0..10 {
            assert_eq!(lane_for(&id, 8), lane);
        }
        assert!(lane < 8);
        assert_eq!(lane_for(&id, 1), 0);
        assert_eq!(lane_for(&id, 0), 0);
    }

    #[test]
    fn test_lane_routing_spreads_subjects() {
        let used: std::collections::HashSet<_> = (0..200)
            .map(|i| lane_for(&SubjectId::new(format!("u{i}")), 4))
            .collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn test_tracker_advances_on_contiguous_prefix() {
        let mut tracker = Tracker::default();
        let a = tracker.admit(Some(FeedPosition::new(1)));
        let b = tracker.admit(Some(FeedPosition::new(2)));
        let c = tracker.admit(Some(FeedPosition::new(3)));
        for t in [a, b, c] {
            tracker.mark_dispatched(t);
        }

        assert_eq!(tracker.complete(b), None);
        assert_eq!(tracker.complete(c), None);
        assert_eq!(tracker.in_flight(), 1);
        assert_eq!(tracker.complete(a), Some(FeedPosition::new(3)));
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn test_tracker_snapshot_without_checkpoints() {
        let mut tracker = Tracker::default();
        let a = tracker.admit(None);
        let b = tracker.admit(Some(FeedPosition::new(9)));
        assert_eq!(tracker.complete(a), None);
        assert_eq!(tracker.complete(b), Some(FeedPosition::new(9)));
    }

    #[test]
    fn test_undispatched_slot_blocks_cursor_but_not_drain() {
        let mut tracker = Tracker::default();
        let stuck = tracker.admit(Some(FeedPosition::new(1)));
        let b = tracker.admit(Some(FeedPosition::new(2)));
        tracker.mark_dispatched(b);
        assert_eq!(tracker.complete(b), None);
        assert_eq!(tracker.in_flight(), 0);
        assert!(tracker.slots.contains_key(&stuck));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CoordinatorState::CatchingUp.to_string(), "catching-up");
        assert_eq!(CoordinatorState::Reconnecting.to_string(), "reconnecting");
    }
}

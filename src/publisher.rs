//! Event publisher.
//!
//! A single background worker owns the bus connection and delivers queued
//! records FIFO. Callers hand deltas to a bounded queue; when the queue is
//! full they wait up to the shed timeout, after which the event is dropped
//! and counted. Connection failures are retried with backoff on the head
//! record, so per-key order is preserved.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, Sender};
use thiserror::Error;
use uuid::Uuid;

use crate::backoff::{Backoff, BackoffPolicy};
use crate::bus::{BusConnection, BusError, BusRecord, EventBus};
use crate::cursor::FeedPosition;
use crate::delta::ConsentDelta;
use crate::error::RelayError;
use crate::shutdown::Shutdown;

/// Header carrying the delta's event id.
pub const HEADER_EVENT_ID: &str = "event-id";
/// Header carrying the change kind.
pub const HEADER_CHANGE_KIND: &str = "change-kind";
/// Header carrying the feed position.
pub const HEADER_SEQUENCE: &str = "sequence";

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Topic deltas are published to.
    pub topic: String,
    /// Maximum queued records.
    pub queue_capacity: usize,
    /// How long `publish` waits for queue space before shedding.
    pub shed_timeout: Duration,
    /// How long the worker waits for one delivery confirmation.
    pub delivery_timeout: Duration,
    /// Reconnect and retry backoff.
    pub backoff: BackoffPolicy,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            topic: "consent-deltas".to_string(),
            queue_capacity: 10_000,
            shed_timeout: Duration::from_secs(60),
            delivery_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Why an event was not delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// Queue stayed full for the whole shed timeout.
    #[error("event shed: publish queue full")]
    Shed,

    /// Publisher shut down before the event was delivered.
    #[error("publisher closed")]
    Closed,

    /// The bus refused the record.
    #[error("bus rejected event: {0}")]
    Rejected(String),

    /// Bounded retries ran out.
    #[error("bus unavailable after {attempts} attempts")]
    Unavailable { attempts: u32 },

    /// The delta could not be encoded.
    #[error("event encoding failed: {0}")]
    Encode(String),
}

impl From<PublishError> for RelayError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Shed | PublishError::Unavailable { .. } => Self::transient("event publisher", err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Confirmation of one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Id of the confirmed event.
    pub event_id: Uuid,
    /// Feed position the event came from.
    pub sequence: FeedPosition,
    /// Offset assigned by the bus.
    pub offset: u64,
}

/// Result handed to a publish completion.
pub type PublishOutcome = Result<PublishAck, PublishError>;

type Completion = Box<dyn FnOnce(PublishOutcome) + Send>;

struct Job {
    record: BusRecord,
    event_id: Uuid,
    sequence: FeedPosition,
    completion: Completion,
}

impl Job {
    fn complete(self, outcome: PublishOutcome) {
        (self.completion)(outcome);
    }
}

/// Outcome of one `publish` call.
#[derive(Debug)]
pub struct PublishHandle {
    rx: Receiver<PublishOutcome>,
}

impl PublishHandle {
    /// Blocks until the event is confirmed or abandoned.
    pub fn wait(self) -> PublishOutcome {
        self.rx.recv().unwrap_or(Err(PublishError::Closed))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout` (`None`).
    pub fn wait_timeout(&self, timeout: Duration) -> Option<PublishOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PublishError::Closed)),
        }
    }
}

/// Point-in-time publisher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublisherMetrics {
    /// Events accepted into the queue.
    pub enqueued: u64,
    /// Events confirmed by the bus.
    pub confirmed: u64,
    /// Events that failed for good.
    pub failed: u64,
    /// Events shed by a full queue.
    pub shed: u64,
    /// Connections opened after a failure.
    pub reconnects: u64,
    /// Events waiting in the queue.
    pub queue_depth: usize,
    /// Whether a bus connection is currently up.
    pub connected: bool,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    confirmed: AtomicU64,
    failed: AtomicU64,
    shed: AtomicU64,
    reconnects: AtomicU64,
}

struct Shared {
    counters: Counters,
    connected: Mutex<bool>,
    connected_cv: Condvar,
    /// Set by `shutdown`; pending work after it fails with `Closed`.
    deadline: Mutex<Option<Instant>>,
    closing: Shutdown,
    has_connected: AtomicBool,
}

impl Shared {
    fn set_connected(&self, value: bool) {
        if let Ok(mut connected) = self.connected.lock() {
            if *connected != value {
                *connected = value;
                self.connected_cv.notify_all();
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.lock().map(|c| *c).unwrap_or(false)
    }

    fn past_deadline(&self) -> bool {
        self.deadline
            .lock()
            .ok()
            .and_then(|d| *d)
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Backoff pause. Before shutdown the pause ends early on `closing`;
    /// during the grace period it is capped at the deadline instead.
    fn pause(&self, delay: Duration) {
        if !self.closing.is_triggered() {
            self.closing.sleep(delay);
            return;
        }
        let remaining = self
            .deadline
            .lock()
            .ok()
            .and_then(|d| *d)
            .map_or(Duration::ZERO, |deadline| deadline.saturating_duration_since(Instant::now()));
        thread::sleep(delay.min(remaining));
    }
}

/// Queued, reconnecting producer of consent deltas.
pub struct EventPublisher {
    config: PublisherConfig,
    tx: Mutex<Option<Sender<Job>>>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("topic", &self.config.topic)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl EventPublisher {
    /// Starts the publisher worker.
    pub fn start(bus: Arc<dyn EventBus>, config: PublisherConfig) -> Result<Self, RelayError> {
        if config.topic.trim().is_empty() {
            return Err(RelayError::config("publisher topic must not be empty"));
        }
        let (tx, rx) = bounded::<Job>(config.queue_capacity.max(1));
        let shared = Arc::new(Shared {
            counters: Counters::default(),
            connected: Mutex::new(false),
            connected_cv: Condvar::new(),
            deadline: Mutex::new(None),
            closing: Shutdown::new(),
            has_connected: AtomicBool::new(false),
        });

        let worker = Worker {
            bus,
            rx,
            shared: Arc::clone(&shared),
            delivery_timeout: config.delivery_timeout,
            backoff: config.backoff.start(),
            conn: None,
        };
        let join = thread::Builder::new()
            .name("consent-publisher".to_string())
            .spawn(move || worker.run())
            .map_err(|e| RelayError::internal(format!("failed to spawn publisher worker: {e}")))?;

        tracing::info!(topic = %config.topic, capacity = config.queue_capacity, "event publisher started");
        Ok(Self {
            config,
            tx: Mutex::new(Some(tx)),
            shared,
            worker: Mutex::new(Some(join)),
        })
    }

    /// Topic deltas are published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Queues a delta; the returned handle resolves on confirmation.
    pub fn publish(&self, delta: &ConsentDelta) -> PublishHandle {
        let (tx, rx) = bounded(1);
        self.publish_with(delta, move |outcome| {
            let _ = tx.send(outcome);
        });
        PublishHandle { rx }
    }

    /// Queues a delta; `on_complete` runs exactly once with the outcome.
    ///
    /// Blocks while the queue is full, for at most the shed timeout.
    pub fn publish_with<F>(&self, delta: &ConsentDelta, on_complete: F)
    where
        F: FnOnce(PublishOutcome) + Send + 'static,
    {
        let value = match delta.encode_payload() {
            Ok(value) => value,
            Err(e) => {
                self.shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                on_complete(Err(PublishError::Encode(e.to_string())));
                return;
            }
        };

        let job = Job {
            record: BusRecord {
                topic: self.config.topic.clone(),
                key: delta.subject_id.as_bytes().to_vec(),
                value,
                timestamp: delta.occurred_at,
                headers: vec![
                    (HEADER_EVENT_ID.to_string(), delta.event_id.to_string()),
                    (HEADER_CHANGE_KIND.to_string(), format!("{:?}", delta.change_kind)),
                    (HEADER_SEQUENCE.to_string(), delta.sequence.to_string()),
                ],
            },
            event_id: delta.event_id,
            sequence: delta.sequence,
            completion: Box::new(on_complete),
        };

        let sender = self.tx.lock().ok().and_then(|guard| guard.clone());
        let Some(sender) = sender else {
            job.complete(Err(PublishError::Closed));
            return;
        };
        self.enqueue(&sender, job);
    }

    fn enqueue(&self, sender: &Sender<Job>, job: Job) {
        let counters = &self.shared.counters;

        let mut sel = Select::new();
        let send_idx = sel.send(sender);
        let close_idx = sel.recv(self.shared.closing.receiver());
        match sel.select_timeout(self.config.shed_timeout) {
            Ok(op) if op.index() == send_idx => match op.send(sender, job) {
                Ok(()) => {
                    counters.enqueued.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => err.into_inner().complete(Err(PublishError::Closed)),
            },
            Ok(op) => {
                debug_assert_eq!(op.index(), close_idx);
                let _ = op.recv(self.shared.closing.receiver());
                job.complete(Err(PublishError::Closed));
            }
            Err(_) => {
                counters.shed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %job.event_id,
                    sequence = %job.sequence,
                    shed_timeout_ms = u64::try_from(self.config.shed_timeout.as_millis()).unwrap_or(u64::MAX),
                    "publish queue full; shedding event"
                );
                job.complete(Err(PublishError::Shed));
            }
        }
    }

    /// Waits until the worker holds a live bus connection.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let Ok(guard) = self.shared.connected.lock() else {
            return false;
        };
        self.shared
            .connected_cv
            .wait_timeout_while(guard, timeout, |connected| !*connected)
            .map(|(connected, _)| *connected)
            .unwrap_or(false)
    }

    /// Point-in-time counters.
    #[must_use]
    pub fn metrics(&self) -> PublisherMetrics {
        let c = &self.shared.counters;
        let queue_depth = self
            .tx
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(Sender::len))
            .unwrap_or(0);
        PublisherMetrics {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            confirmed: c.confirmed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            shed: c.shed.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            queue_depth,
            connected: self.shared.is_connected(),
        }
    }

    /// Stops intake, delivers queued records until `grace` elapses, then
    /// fails whatever is left with `Closed`. Idempotent.
    pub fn shutdown(&self, grace: Duration) {
        let sender = self.tx.lock().ok().and_then(|mut guard| guard.take());
        if sender.is_none() {
            return;
        }
        if let Ok(mut deadline) = self.shared.deadline.lock() {
            *deadline = Some(Instant::now() + grace);
        }
        self.shared.closing.trigger();
        drop(sender);

        let join = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(join) = join {
            if join.join().is_err() {
                tracing::error!("publisher worker panicked");
            }
        }
        let m = self.metrics();
        tracing::info!(
            confirmed = m.confirmed,
            failed = m.failed,
            shed = m.shed,
            "event publisher stopped"
        );
    }
}

impl Drop for EventPublisher {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

struct Worker {
    bus: Arc<dyn EventBus>,
    rx: Receiver<Job>,
    shared: Arc<Shared>,
    delivery_timeout: Duration,
    backoff: Backoff,
    conn: Option<Box<dyn BusConnection>>,
}

impl Worker {
    fn run(mut self) {
        loop {
            if self.conn.is_none() && !self.shared.closing.is_triggered() {
                self.try_connect();
            }

            let next = if self.conn.is_some() || self.shared.closing.is_triggered() {
                self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
            } else {
                // Idle but disconnected: keep reconnecting so waiters learn
                // about recovery.
                let wait = self.backoff.next_delay().unwrap_or(Duration::from_secs(1));
                self.rx.recv_timeout(wait)
            };

            match next {
                Ok(job) => self.deliver(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.shared.set_connected(false);
        tracing::debug!("publisher worker exiting");
    }

    fn try_connect(&mut self) -> bool {
        match self.bus.connect() {
            Ok(conn) => {
                self.conn = Some(conn);
                if self.shared.has_connected.swap(true, Ordering::AcqRel) {
                    self.shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(attempts = self.backoff.attempts(), "reconnected to event bus");
                } else {
                    tracing::info!("connected to event bus");
                }
                self.backoff.reset();
                self.shared.set_connected(true);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt = self.backoff.attempts(), "event bus connect failed");
                self.shared.set_connected(false);
                false
            }
        }
    }

    fn drop_connection(&mut self, err: &BusError) {
        if self.conn.take().is_some() {
            tracing::warn!(error = %err, "lost event bus connection");
        }
        self.shared.set_connected(false);
    }

    fn deliver(&mut self, job: Job) {
        let shared = Arc::clone(&self.shared);
        let counters = &shared.counters;
        loop {
            if self.shared.past_deadline() {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                job.complete(Err(PublishError::Closed));
                return;
            }

            if self.conn.is_none() && !self.try_connect() {
                let Some(delay) = self.backoff.next_delay() else {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    let attempts = self.backoff.attempts();
                    self.backoff.reset();
                    job.complete(Err(PublishError::Unavailable { attempts }));
                    return;
                };
                self.shared.pause(delay);
                continue;
            }

            let Some(conn) = self.conn.as_mut() else {
                continue;
            };
            let outcome = conn
                .send(job.record.clone())
                .and_then(|delivery| delivery.wait(self.delivery_timeout));

            match outcome {
                Ok(ack) => {
                    counters.confirmed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(event_id = %job.event_id, offset = ack.offset, "event delivered");
                    let ack = PublishAck {
                        event_id: job.event_id,
                        sequence: job.sequence,
                        offset: ack.offset,
                    };
                    job.complete(Ok(ack));
                    return;
                }
                Err(e) if e.is_connection() => {
                    self.drop_connection(&e);
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(event_id = %job.event_id, error = %e, "event rejected by bus");
                    job.complete(Err(PublishError::Rejected(e.to_string())));
                    return;
                }
            }
        }
    }
}

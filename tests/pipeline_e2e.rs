//! End-to-end tests for the relay pipeline.
//!
//! These tests run the full pipeline against the in-memory store and bus:
//! - Created / Updated / Deleted deltas and tombstones
//! - Per-subject ordering across lanes
//! - Cursor advancement and restart safety
//! - Bus outage with shedding and replay
//! - Expired resume positions and dead-lettered rejections

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use consent_relay::bus::BusRecord;
use consent_relay::publisher::{HEADER_CHANGE_KIND, HEADER_EVENT_ID, HEADER_SEQUENCE};
use consent_relay::{
    BackoffPolicy, ChangeKind, ConsentDelta, ConsentStore, Coordinator, CoordinatorConfig, CoordinatorHandle,
    ChangeLogConfig, CoordinatorState, CursorError, CursorStore, EventPublisher, FeedPosition, MemoryBus,
    MemoryConsentStore, MemoryCursorStore, PolicySet, PublisherConfig, Subject, SubjectId, WatchCursor,
};

const TOPIC: &str = "consent-deltas";

fn publisher_config(capacity: usize, shed: Duration) -> PublisherConfig {
    PublisherConfig {
        topic: TOPIC.to_string(),
        queue_capacity: capacity,
        shed_timeout: shed,
        delivery_timeout: Duration::from_millis(500),
        backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(25)),
    }
}

fn coordinator_config(lanes: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        lanes,
        lane_buffer: 64,
        tick: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
        emit_empty_updates: false,
        rewind_backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(50)),
        watch_backoff: BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(25)),
        max_event_rewinds: 3,
    }
}

struct Harness {
    store: Arc<MemoryConsentStore>,
    bus: MemoryBus,
    cursor: Arc<MemoryCursorStore>,
    publisher: Arc<EventPublisher>,
    handle: CoordinatorHandle,
}

fn start(
    store: Arc<MemoryConsentStore>,
    bus: MemoryBus,
    cursor: Arc<MemoryCursorStore>,
    publisher: PublisherConfig,
    lanes: usize,
) -> Harness {
    let publisher = Arc::new(EventPublisher::start(Arc::new(bus.clone()), publisher).unwrap());
    let handle = Coordinator::new(
        Arc::clone(&store) as Arc<dyn ConsentStore>,
        Arc::clone(&cursor) as Arc<dyn CursorStore>,
        Arc::clone(&publisher),
        coordinator_config(lanes),
    )
    .spawn()
    .unwrap();
    Harness {
        store,
        bus,
        cursor,
        publisher,
        handle,
    }
}

fn start_default(store: Arc<MemoryConsentStore>) -> Harness {
    start(
        store,
        MemoryBus::new(),
        Arc::new(MemoryCursorStore::new()),
        publisher_config(256, Duration::from_secs(5)),
        4,
    )
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn decode(record: &BusRecord) -> ConsentDelta {
    serde_json::from_slice(record.value.as_deref().expect("not a tombstone")).unwrap()
}

fn sequence(record: &BusRecord) -> u64 {
    record.header(HEADER_SEQUENCE).unwrap().parse().unwrap()
}

fn set(ids: &[&str]) -> PolicySet {
    ids.iter().copied().collect()
}

#[test]
fn test_created_subject_emits_created_delta() {
    let store = Arc::new(MemoryConsentStore::new());
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();

    let h = start_default(store);
    assert!(wait_until(Duration::from_secs(5), || h.bus.records(TOPIC).len() == 1));

    let records = h.bus.records(TOPIC);
    assert_eq!(records[0].key, b"u1".to_vec());
    assert_eq!(records[0].header(HEADER_CHANGE_KIND), Some("Created"));

    let delta = decode(&records[0]);
    assert_eq!(delta.change_kind, ChangeKind::Created);
    assert_eq!(delta.added_policies, set(&["p1"]));
    assert!(delta.withdrawn_policies.is_empty());
    assert_eq!(records[0].header(HEADER_EVENT_ID), Some(delta.event_id.to_string().as_str()));

    let summary = h.handle.stop().unwrap();
    assert_eq!(summary.published, 1);
    assert_eq!(summary.final_cursor.map(|c| c.position), Some(FeedPosition::new(1)));
}

#[test]
fn test_policy_swap_emits_added_and_withdrawn() {
    let store = Arc::new(MemoryConsentStore::new());
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1", "p2"])).unwrap();

    let h = start_default(store);
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    let result = h
        .store
        .update_subject(&SubjectId::new("u1"), Subject::new("u1", "Alice").with_policies(["p2", "p3"]))
        .unwrap();
    assert_eq!((result.matched, result.changed), (1, 1));
    assert!(wait_until(Duration::from_secs(5), || h.bus.records(TOPIC).len() == 2));

    let delta = decode(&h.bus.records(TOPIC)[1]);
    assert_eq!(delta.change_kind, ChangeKind::Updated);
    assert_eq!(delta.added_policies, set(&["p3"]));
    assert_eq!(delta.withdrawn_policies, set(&["p1"]));
    h.handle.stop().unwrap();
}

#[test]
fn test_deleted_subject_emits_tombstone() {
    let store = Arc::new(MemoryConsentStore::new());
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();

    let h = start_default(store);
    assert!(wait_until(Duration::from_secs(5), || h.bus.records(TOPIC).len() == 1));

    assert!(h.store.delete_subject(&SubjectId::new("u1")).unwrap());
    assert!(wait_until(Duration::from_secs(5), || h.bus.records(TOPIC).len() == 2));

    let tombstone = &h.bus.records(TOPIC)[1];
    assert_eq!(tombstone.key, b"u1".to_vec());
    assert!(tombstone.value.is_none());
    assert_eq!(tombstone.header(HEADER_CHANGE_KIND), Some("Deleted"));
    h.handle.stop().unwrap();
}

#[test]
fn test_per_subject_order_preserved_across_lanes() {
    let h = start_default(Arc::new(MemoryConsentStore::new()));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    let subjects: Vec<String> = (0..5).map(|i| format!("subject-{i}")).collect();
    for round in 0..20 {
        for id in &subjects {
            h.store
                .put_subject(Subject::new(id.as_str(), "n").with_policies([format!("p{round}")]))
                .unwrap();
        }
    }

    assert!(wait_until(Duration::from_secs(10), || h.bus.records(TOPIC).len() == 100));
    let head = h.store.head().unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.handle.cursor_position() == Some(head)));

    let records = h.bus.records(TOPIC);
    for id in &subjects {
        let sequences: Vec<u64> = records
            .iter()
            .filter(|r| r.key == id.as_bytes())
            .map(sequence)
            .collect();
        assert_eq!(sequences.len(), 20);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{id}: {sequences:?}");
    }

    let summary = h.handle.stop().unwrap();
    assert_eq!(summary.published, 100);
    assert_eq!(summary.final_cursor.map(|c| c.position), Some(head));
}

#[test]
fn test_empty_update_is_suppressed_but_advances_cursor() {
    let h = start_default(Arc::new(MemoryConsentStore::new()));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    h.store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    // name change only
    h.store.put_subject(Subject::new("u1", "Alicia").with_policies(["p1"])).unwrap();
    let head = h.store.head().unwrap();

    assert!(wait_until(Duration::from_secs(5), || h.handle.cursor_position() == Some(head)));
    assert_eq!(h.bus.records(TOPIC).len(), 1);

    let summary = h.handle.stop().unwrap();
    assert_eq!(summary.suppressed, 1);
}

#[test]
fn test_restart_resumes_after_cursor_without_republishing() {
    let store = Arc::new(MemoryConsentStore::new());
    let cursor = Arc::new(MemoryCursorStore::new());
    let bus = MemoryBus::new();
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    store.put_subject(Subject::new("u2", "Bob").with_policies(["p2"])).unwrap();

    let first = start(
        Arc::clone(&store),
        bus.clone(),
        Arc::clone(&cursor),
        publisher_config(64, Duration::from_secs(5)),
        2,
    );
    assert!(wait_until(Duration::from_secs(5), || bus.records(TOPIC).len() == 2));
    let summary = first.handle.stop().unwrap();
    assert_eq!(summary.final_cursor.map(|c| c.position), Some(store.head().unwrap()));

    let second = start(
        Arc::clone(&store),
        bus.clone(),
        Arc::clone(&cursor),
        publisher_config(64, Duration::from_secs(5)),
        2,
    );
    assert!(second.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(bus.records(TOPIC).len(), 2);

    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1", "p3"])).unwrap();
    assert!(wait_until(Duration::from_secs(5), || bus.records(TOPIC).len() == 3));
    assert_eq!(decode(&bus.records(TOPIC)[2]).added_policies, set(&["p3"]));
    second.handle.stop().unwrap();
}

#[test]
fn test_replay_after_lost_cursor_write_is_byte_identical() {
    let store = Arc::new(MemoryConsentStore::new());
    let first = start_default(Arc::clone(&store));
    assert!(first.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p2"])).unwrap();
    store.put_subject(Subject::new("u2", "Bob").with_policies(["p1"])).unwrap();
    let head = store.head().unwrap();
    assert!(wait_until(Duration::from_secs(5), || first.bus.records(TOPIC).len() == 3));
    assert!(wait_until(Duration::from_secs(5), || first.handle.cursor_position() == Some(head)));
    let published = first.bus.records(TOPIC);
    first.handle.stop().unwrap();

    // Crash after the publish of positions 2 and 3 but before their cursor write.
    let stale = Arc::new(MemoryCursorStore::with_cursor(WatchCursor::at(FeedPosition::new(1))));
    let second = start(
        Arc::clone(&store),
        MemoryBus::new(),
        stale,
        publisher_config(64, Duration::from_secs(5)),
        2,
    );
    assert!(wait_until(Duration::from_secs(5), || second.bus.records(TOPIC).len() == 2));
    assert!(wait_until(Duration::from_secs(5), || second.handle.cursor_position() == Some(head)));
    let replayed = second.bus.records(TOPIC);

    let mut sequences: Vec<u64> = replayed.iter().map(sequence).collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![2, 3]);
    for record in &replayed {
        let original = published
            .iter()
            .find(|p| sequence(p) == sequence(record))
            .expect("replayed sequence was published before");
        assert_eq!(original.key, record.key);
        assert_eq!(original.value, record.value);
        assert_eq!(original.timestamp, record.timestamp);
        assert_eq!(original.headers, record.headers);
    }
    second.handle.stop().unwrap();
}

#[test]
fn test_expired_cursor_still_publishes_deletion() {
    let store = Arc::new(MemoryConsentStore::with_config(ChangeLogConfig {
        retained_changes: 2,
        subscriber_buffer: 64,
    }));
    let cursor = Arc::new(MemoryCursorStore::new());
    let bus = MemoryBus::new();

    let first = start(
        Arc::clone(&store),
        bus.clone(),
        Arc::clone(&cursor),
        publisher_config(64, Duration::from_secs(5)),
        2,
    );
    assert!(first.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    assert!(wait_until(Duration::from_secs(5), || first.handle.cursor_position() == Some(FeedPosition::new(1))));
    first.handle.stop().unwrap();

    // While the relay is down the deletion falls out of the retained log.
    assert!(store.delete_subject(&SubjectId::new("u1")).unwrap());
    for i in 0..3 {
        store
            .put_subject(Subject::new(format!("x{i}"), "n").with_policies(["p2"]))
            .unwrap();
    }
    let head = store.head().unwrap();

    let second = start(
        Arc::clone(&store),
        bus.clone(),
        Arc::clone(&cursor),
        publisher_config(64, Duration::from_secs(5)),
        2,
    );
    assert!(wait_until(Duration::from_secs(5), || bus.records(TOPIC).len() == 5));
    assert!(wait_until(Duration::from_secs(5), || second.handle.cursor_position() == Some(head)));

    let records = bus.records(TOPIC);
    let tombstones: Vec<_> = records.iter().filter(|r| r.value.is_none()).collect();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].key, b"u1".to_vec());
    assert_eq!(tombstones[0].header(HEADER_CHANGE_KIND), Some("Deleted"));
    assert_eq!(sequence(tombstones[0]), 2);
    for i in 0..3 {
        let key = format!("x{i}");
        assert!(records.iter().any(|r| r.key == key.as_bytes()), "{key} never delivered");
    }

    let summary = second.handle.stop().unwrap();
    assert_eq!(summary.final_cursor.map(|c| c.position), Some(head));
    assert_eq!(cursor.load().unwrap().map(|c| c.position), Some(head));
}

#[test]
fn test_feed_loss_resubscribes_from_acknowledged_position() {
    let h = start_default(Arc::new(MemoryConsentStore::new()));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    h.store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.handle.cursor_position() == Some(FeedPosition::new(1))));

    h.store.disconnect_feeds().unwrap();
    h.store.put_subject(Subject::new("u1", "Alice").with_policies(["p1", "p2"])).unwrap();

    assert!(wait_until(Duration::from_secs(5), || h.bus.records(TOPIC).len() == 2));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));
    assert!(h.handle.state_history().contains(&CoordinatorState::Reconnecting));

    let records = h.bus.records(TOPIC);
    assert_eq!(decode(&records[1]).added_policies, set(&["p2"]));
    // No duplicate of the first event: the resubscription started after it.
    assert_eq!(records.iter().filter(|r| sequence(r) == sequence(&records[0])).count(), 1);
    h.handle.stop().unwrap();
}

#[test]
fn test_bus_outage_sheds_then_replays_everything() {
    let store = Arc::new(MemoryConsentStore::new());
    let bus = MemoryBus::new();
    let h = start(
        Arc::clone(&store),
        bus.clone(),
        Arc::new(MemoryCursorStore::new()),
        publisher_config(2, Duration::from_millis(100)),
        2,
    );
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    bus.set_available(false);
    for i in 0..20 {
        store
            .put_subject(Subject::new(format!("u{i}"), "n").with_policies(["p1"]))
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(10), || h.publisher.metrics().shed > 0));
    assert!(wait_until(Duration::from_secs(5), || h
        .handle
        .state_history()
        .contains(&CoordinatorState::Reconnecting)));
    // Nothing was confirmed, so nothing may be checkpointed.
    assert_eq!(h.handle.cursor_position(), None);
    assert_eq!(h.cursor.load().unwrap(), None);

    bus.set_available(true);
    let head = store.head().unwrap();
    assert!(wait_until(Duration::from_secs(15), || h.handle.cursor_position() == Some(head)));

    let records = bus.records(TOPIC);
    for i in 0..20 {
        let key = format!("u{i}");
        assert!(records.iter().any(|r| r.key == key.as_bytes()), "{key} never delivered");
    }

    let summary = h.handle.stop().unwrap();
    assert!(summary.shed > 0);
    assert!(summary.abandoned > 0);
    assert!(summary.epochs >= 2);
    assert_eq!(summary.final_cursor.map(|c| c.position), Some(head));
}

#[test]
fn test_rejected_event_is_retried_after_rewind() {
    let store = Arc::new(MemoryConsentStore::new());
    let h = start_default(Arc::clone(&store));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    h.bus.reject_next(1);
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();

    let head = store.head().unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.handle.cursor_position() == Some(head)));
    assert_eq!(h.bus.records(TOPIC).len(), 1);

    let summary = h.handle.stop().unwrap();
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.published, 1);
}

#[test]
fn test_persistently_rejected_event_is_dead_lettered() {
    let store = Arc::new(MemoryConsentStore::new());
    let h = start_default(Arc::clone(&store));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    // One first attempt plus three rewinds, all refused.
    h.bus.reject_next(4);
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.handle.cursor_position() == Some(FeedPosition::new(1))));
    assert!(h.bus.records(TOPIC).is_empty());

    store.put_subject(Subject::new("u2", "Bob").with_policies(["p1"])).unwrap();
    let head = store.head().unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.handle.cursor_position() == Some(head)));

    let records = h.bus.records(TOPIC);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key, b"u2".to_vec());

    let summary = h.handle.stop().unwrap();
    assert_eq!(summary.abandoned, 4);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.published, 1);
}

/// Cursor store whose saves fail while `failing` is set.
#[derive(Default)]
struct FlakyCursorStore {
    inner: MemoryCursorStore,
    failing: AtomicBool,
}

impl CursorStore for FlakyCursorStore {
    fn load(&self) -> Result<Option<WatchCursor>, CursorError> {
        self.inner.load()
    }

    fn save(&self, cursor: &WatchCursor) -> Result<(), CursorError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CursorError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(cursor)
    }
}

#[test]
fn test_failed_cursor_write_is_retried_on_next_advance() {
    let store = Arc::new(MemoryConsentStore::new());
    let cursor = Arc::new(FlakyCursorStore::default());
    cursor.failing.store(true, Ordering::SeqCst);

    let publisher = Arc::new(
        EventPublisher::start(Arc::new(MemoryBus::new()), publisher_config(16, Duration::from_secs(5))).unwrap(),
    );
    let handle = Coordinator::new(
        Arc::clone(&store) as Arc<dyn ConsentStore>,
        Arc::clone(&cursor) as Arc<dyn CursorStore>,
        publisher,
        coordinator_config(1),
    )
    .spawn()
    .unwrap();
    assert!(handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(cursor.load().unwrap(), None);

    cursor.failing.store(false, Ordering::SeqCst);
    store.put_subject(Subject::new("u2", "Bob").with_policies(["p1"])).unwrap();
    let head = store.head().unwrap();
    assert!(wait_until(Duration::from_secs(5), || handle.cursor_position() == Some(head)));

    let summary = handle.stop().unwrap();
    assert!(summary.cursor_write_failures >= 1);
    assert_eq!(cursor.load().unwrap().map(|c| c.position), Some(head));
}

#[test]
fn test_shutdown_with_unconfirmed_events_keeps_cursor() {
    let store = Arc::new(MemoryConsentStore::new());
    let h = start_default(Arc::clone(&store));
    assert!(h.handle.wait_for_state(CoordinatorState::Live, Duration::from_secs(5)));

    h.bus.hold_acks(true);
    store.put_subject(Subject::new("u1", "Alice").with_policies(["p1"])).unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    let summary = h.handle.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.final_cursor, None);
    assert_eq!(h.cursor.load().unwrap(), None);
}

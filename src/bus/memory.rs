//! In-memory event bus.
//!
//! Records are kept per topic and can be inspected. Tests drive failures
//! through the injection knobs: outages, rejected records, and withheld
//! acknowledgements.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BusAck, BusConnection, BusError, BusRecord, DeliveryFuture, DeliverySender, EventBus};

#[derive(Debug, Default)]
struct BusState {
    topics: BTreeMap<String, Vec<BusRecord>>,
    available: bool,
    /// Bumped on every outage; connections from older generations are dead.
    generation: u64,
    reject_next: u32,
    hold_acks: bool,
    held: Vec<(DeliverySender, BusRecord)>,
    connects: u64,
}

impl BusState {
    fn append(&mut self, record: BusRecord) -> BusAck {
        let log = self.topics.entry(record.topic.clone()).or_default();
        let ack = BusAck {
            topic: record.topic.clone(),
            offset: log.len() as u64,
        };
        log.push(record);
        ack
    }
}

/// Inspectable in-memory bus. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Creates an empty, available bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                available: true,
                ..BusState::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        // A panicking test thread must not wedge the bus for everyone else.
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Simulates an outage (`false`) or recovery (`true`).
    ///
    /// Going down kills live connections and fails withheld deliveries.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        if state.available && !available {
            state.generation += 1;
            for (tx, _) in state.held.drain(..) {
                tx.complete(Err(BusError::Disconnected("bus went down".to_string())));
            }
        }
        state.available = available;
    }

    /// Rejects the next `count` records.
    pub fn reject_next(&self, count: u32) {
        self.lock().reject_next = count;
    }

    /// While held, records are stored only on release and their deliveries
    /// stay pending.
    pub fn hold_acks(&self, hold: bool) {
        let mut state = self.lock();
        state.hold_acks = hold;
        if !hold {
            let held: Vec<_> = state.held.drain(..).collect();
            for (tx, record) in held {
                let ack = state.append(record);
                tx.complete(Ok(ack));
            }
        }
    }

    /// Records delivered to `topic`, in order.
    #[must_use]
    pub fn records(&self, topic: &str) -> Vec<BusRecord> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }
}

impl EventBus for MemoryBus {
    fn connect(&self) -> Result<Box<dyn BusConnection>, BusError> {
        let mut state = self.lock();
        if !state.available {
            return Err(BusError::Disconnected("bus unavailable".to_string()));
        }
        state.connects += 1;
        Ok(Box::new(MemoryConnection {
            bus: self.clone(),
            generation: state.generation,
        }))
    }
}

struct MemoryConnection {
    bus: MemoryBus,
    generation: u64,
}

impl BusConnection for MemoryConnection {
    fn send(&mut self, record: BusRecord) -> Result<DeliveryFuture, BusError> {
        let mut state = self.bus.lock();
        if !state.available || state.generation != self.generation {
            return Err(BusError::Disconnected("connection lost".to_string()));
        }
        if state.reject_next > 0 {
            state.reject_next -= 1;
            return Ok(DeliveryFuture::ready(Err(BusError::Rejected(
                "injected rejection".to_string(),
            ))));
        }
        if state.hold_acks {
            let (tx, fut) = DeliveryFuture::pending();
            state.held.push((tx, record));
            return Ok(fut);
        }
        let ack = state.append(record);
        Ok(DeliveryFuture::ready(Ok(ack)))
    }
}

//! Event bus abstraction.
//!
//! The publisher holds one long-lived [`BusConnection`] obtained from an
//! injected [`EventBus`]. Sending a record returns a [`DeliveryFuture`] that
//! resolves once the bus has durably accepted (or refused) the record.

mod memory;
#[cfg(feature = "persistent")]
mod log;

#[cfg(feature = "persistent")]
pub use log::{LogBus, LoggedRecord};
pub use memory::MemoryBus;

use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::error::RelayError;

/// Errors raised by event bus backends.
#[derive(Debug, Error)]
pub enum BusError {
    /// The connection is gone; reconnecting may help.
    #[error("Bus disconnected: {0}")]
    Disconnected(String),

    /// No delivery confirmation within the deadline.
    #[error("Bus delivery timed out after {0:?}")]
    Timeout(Duration),

    /// The bus refused this record.
    #[error("Bus rejected record: {0}")]
    Rejected(String),

    /// Log file I/O failed.
    #[error("Bus I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BusError {
    /// True if the connection should be dropped and re-established.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::Timeout(_) | Self::Io(_))
    }
}

impl From<BusError> for RelayError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Rejected(message) => Self::internal(format!("bus rejected record: {message}")),
            other => Self::transient("event bus", other.to_string()),
        }
    }
}

/// One record as handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    /// Destination topic.
    pub topic: String,
    /// Partitioning key.
    pub key: Vec<u8>,
    /// `None` marks a tombstone.
    pub value: Option<Vec<u8>>,
    /// Event time carried by the record.
    pub timestamp: DateTime<Utc>,
    /// Record headers, in order.
    pub headers: Vec<(String, String)>,
}

impl BusRecord {
    /// Looks up a header by name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Delivery confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAck {
    /// Topic the record was appended to.
    pub topic: String,
    /// Offset of the record within its topic.
    pub offset: u64,
}

/// Completes a [`DeliveryFuture`].
#[derive(Debug)]
pub struct DeliverySender {
    tx: Sender<Result<BusAck, BusError>>,
}

impl DeliverySender {
    /// Resolves the delivery. Later calls are ignored.
    pub fn complete(self, outcome: Result<BusAck, BusError>) {
        // The waiter may have given up already.
        let _ = self.tx.send(outcome);
    }
}

/// Pending delivery outcome of one record.
#[derive(Debug)]
pub struct DeliveryFuture {
    rx: Receiver<Result<BusAck, BusError>>,
}

impl DeliveryFuture {
    /// A future with its completing half.
    #[must_use]
    pub fn pending() -> (DeliverySender, Self) {
        let (tx, rx) = bounded(1);
        (DeliverySender { tx }, Self { rx })
    }

    /// An already resolved future.
    #[must_use]
    pub fn ready(outcome: Result<BusAck, BusError>) -> Self {
        let (tx, fut) = Self::pending();
        tx.complete(outcome);
        fut
    }

    /// Blocks until the outcome is known or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> Result<BusAck, BusError> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(BusError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(BusError::Disconnected("delivery abandoned by the bus".to_string()))
            }
        }
    }
}

/// A connected producer.
pub trait BusConnection: Send {
    /// Hands a record to the bus.
    ///
    /// An `Err` means the record was not accepted for delivery at all.
    fn send(&mut self, record: BusRecord) -> Result<DeliveryFuture, BusError>;
}

/// Factory for bus connections.
pub trait EventBus: Send + Sync {
    /// Opens a new connection.
    fn connect(&self) -> Result<Box<dyn BusConnection>, BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_event_bus_object_safe(_: &dyn EventBus) {}
    fn _assert_connection_object_safe(_: &dyn BusConnection) {}

    #[test]
    fn test_ready_future_resolves() {
        let ack = BusAck {
            topic: "t".to_string(),
            offset: 4,
        };
        let fut = DeliveryFuture::ready(Ok(ack.clone()));
        assert_eq!(fut.wait(Duration::from_millis(1)).unwrap(), ack);
    }

    #[test]
    fn test_pending_future_times_out() {
        let (_tx, fut) = DeliveryFuture::pending();
        let err = fut.wait(Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert!(err.is_connection());
    }

    #[test]
    fn test_dropped_sender_is_disconnect() {
        let (tx, fut) = DeliveryFuture::pending();
        drop(tx);
        assert!(matches!(fut.wait(Duration::from_secs(1)), Err(BusError::Disconnected(_))));
    }

    #[test]
    fn test_rejection_is_not_retryable() {
        assert!(!BusError::Rejected("too large".to_string()).is_connection());
        let relay: RelayError = BusError::Disconnected("x".to_string()).into();
        assert!(relay.is_retryable());
    }
}

//! Feed positions, watch cursors, and cursor persistence.
//!
//! A [`WatchCursor`] is the durable resume point of the relay: the feed
//! position up to which every change has been confirmed by the event bus.
//! It is owned by the coordinator, which is the only writer.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque, monotonically increasing position in a store's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedPosition(u64);

impl FeedPosition {
    /// Position before any change was recorded.
    pub const ORIGIN: Self = Self(0);

    /// Wraps a raw store position.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw position value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The position right after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable resume point of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCursor {
    /// Every change at or before this position has been confirmed.
    pub position: FeedPosition,
    /// When the cursor was committed.
    pub committed_at: DateTime<Utc>,
}

impl WatchCursor {
    /// Cursor at `position`, committed now.
    #[must_use]
    pub fn at(position: FeedPosition) -> Self {
        Self {
            position,
            committed_at: Utc::now(),
        }
    }
}

/// Errors raised by cursor stores.
#[derive(Debug, Error)]
pub enum CursorError {
    /// Reading or writing the cursor failed.
    #[error("Cursor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored cursor does not decode.
    #[error("Cursor file is corrupt: {0}")]
    Corrupt(String),

    /// A lock guarding the cursor was poisoned.
    #[error("Cursor store lock poisoned")]
    Poisoned,
}

impl From<CursorError> for crate::error::RelayError {
    fn from(err: CursorError) -> Self {
        match err {
            CursorError::Io(e) => Self::transient("cursor store", e.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Durable storage for the single watch cursor.
///
/// `save` must be atomic: after a crash, `load` returns either the previous
/// or the new cursor, never a partial write.
pub trait CursorStore: Send + Sync {
    /// Loads the last committed cursor, `None` on first run.
    fn load(&self) -> Result<Option<WatchCursor>, CursorError>;

    /// Atomically replaces the committed cursor.
    fn save(&self, cursor: &WatchCursor) -> Result<(), CursorError>;
}

/// Cursor store that keeps the cursor in memory.
///
/// Useful for tests and for embedded relays whose store is also in memory.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursor: Mutex<Option<WatchCursor>>,
    saves: Mutex<u64>,
}

impl MemoryCursorStore {
    /// Creates a store with no cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from an existing cursor (simulates a restart).
    #[must_use]
    pub fn with_cursor(cursor: WatchCursor) -> Self {
        Self {
            cursor: Mutex::new(Some(cursor)),
            saves: Mutex::new(0),
        }
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.lock().map(|g| *g).unwrap_or(0)
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self) -> Result<Option<WatchCursor>, CursorError> {
        Ok(*self.cursor.lock().map_err(|_| CursorError::Poisoned)?)
    }

    fn save(&self, cursor: &WatchCursor) -> Result<(), CursorError> {
        *self.cursor.lock().map_err(|_| CursorError::Poisoned)? = Some(*cursor);
        *self.saves.lock().map_err(|_| CursorError::Poisoned)? += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_position_ordering() {
        assert!(FeedPosition::new(2) > FeedPosition::new(1));
        assert_eq!(FeedPosition::ORIGIN.next(), FeedPosition::new(1));
    }

    #[test]
    fn test_memory_cursor_store() {
        let store = MemoryCursorStore::new();
        assert!(store.load().unwrap().is_none());

        let cursor = WatchCursor::at(FeedPosition::new(42));
        store.save(&cursor).unwrap();
        assert_eq!(store.load().unwrap().unwrap().position, FeedPosition::new(42));
        assert_eq!(store.save_count(), 1);
    }

    #[test]
    fn test_cursor_json_shape() {
        let cursor = WatchCursor::at(FeedPosition::new(5));
        let json = serde_json::to_value(cursor).unwrap();
        assert_eq!(json["position"], 5);
        assert!(json.get("committed_at").is_some());
    }
}

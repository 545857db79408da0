//! # consent-relay
//!
//! Turns consent store mutations into an ordered stream of consent-delta
//! events on an event bus, at least once per change, across restarts and
//! event bus outages.
//!
//! ## Pipeline
//!
//! - **Consent Store** ([`storage::ConsentStore`]): subjects plus a change
//!   feed of before/after snapshots
//! - **Change Watcher** ([`watcher::ChangeWatcher`]): decodes the feed and
//!   resubscribes with backoff
//! - **Diff Engine** ([`delta::diff`]): added and withdrawn policies
//! - **Event Publisher** ([`publisher::EventPublisher`]): bounded queue over
//!   one reconnecting bus connection
//! - **Coordinator** ([`coordinator::Coordinator`]): subject-partitioned
//!   lanes and sole owner of the durable [`cursor::WatchCursor`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use consent_relay::{
//!     Coordinator, CoordinatorConfig, EventPublisher, MemoryBus, MemoryConsentStore,
//!     MemoryCursorStore, PublisherConfig,
//! };
//!
//! let store = Arc::new(MemoryConsentStore::new());
//! let publisher = Arc::new(EventPublisher::start(Arc::new(MemoryBus::new()), PublisherConfig::default())?);
//! let handle = Coordinator::new(store, Arc::new(MemoryCursorStore::new()), publisher, CoordinatorConfig::default())
//!     .spawn()?;
//! // ... mutate the store ...
//! let summary = handle.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Model
pub mod error;
pub mod ids;
pub mod policy;
pub mod subject;

// Pipeline
pub mod backoff;
pub mod bus;
pub mod coordinator;
pub mod cursor;
pub mod delta;
pub mod publisher;
pub mod shutdown;
pub mod storage;
pub mod watcher;

// Outer layers
pub mod config;
#[cfg(feature = "http")]
pub mod http;
pub mod seed;
pub mod session;

pub use backoff::{Backoff, BackoffPolicy};
pub use bus::{BusAck, BusConnection, BusError, BusRecord, DeliveryFuture, EventBus, MemoryBus};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorState, RunSummary};
pub use cursor::{CursorError, CursorStore, FeedPosition, MemoryCursorStore, WatchCursor};
pub use delta::{diff, ChangeKind, ConsentDelta, PolicyDiff};
pub use error::{RelayError, RelayResult, ValidationError};
pub use ids::{ApplicationId, PolicyId, SubjectId};
pub use policy::{Policy, PolicySet};
pub use publisher::{EventPublisher, PublishAck, PublishError, PublisherConfig, PublisherMetrics};
pub use shutdown::Shutdown;
pub use storage::{
    ApplicationCatalog, ChangeLogConfig, ConsentStore, MemoryApplicationCatalog, MemoryConsentStore, MemoryPolicyCatalog,
    PolicyCatalog, StorageError,
};
pub use subject::{Application, Subject};
pub use watcher::{ChangeWatcher, WatchEvent, WatchItem, WatchStream};

#[cfg(feature = "persistent")]
pub use bus::LogBus;
#[cfg(feature = "persistent")]
pub use storage::persistent::{open_database, FileCursorStore, PersistentConfig, PersistentStores};

//! Storage traits and backends.
//!
//! [`traits`] defines what the relay needs from a consent store and the two
//! catalogs. [`memory`] holds in-memory backends; `persistent` (feature
//! `persistent`) holds WAL-backed ones and the file cursor store.

mod changelog;
pub mod memory;
#[cfg(feature = "persistent")]
pub mod persistent;
pub mod traits;

pub use memory::{
    ChangeLogConfig, InMemoryStores, MemoryApplicationCatalog, MemoryConsentStore, MemoryPolicyCatalog,
};
pub use traits::{
    ApplicationCatalog, ChangeSubscription, ConsentStore, FeedMessage, FeedStart, PolicyCatalog, RawChange,
    StorageError, UpdateResult,
};

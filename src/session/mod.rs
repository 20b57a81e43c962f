//! Session management: durable store, cross-process locking, read cache,
//! and session key/freshness resolution.
//!
//! The store owns all on-disk session state. Everything else reads snapshots
//! and writes through the locked transaction API.

pub mod cache;
pub mod lock;
pub mod resolver;
pub mod store;
pub mod types;

pub use cache::StoreCache;
pub use resolver::{ChatType, SessionCriteria, SessionResolution, SessionResolver};
pub use store::{LoadOptions, SessionStore};
pub use types::{SessionEntry, SessionStoreFile};

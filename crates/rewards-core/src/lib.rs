//! # Rewards Core
//!
//! Core library for the household points/redemption ledger.
//!
//! This crate provides the domain entities, validation rules, storage
//! abstractions, batch execution, and offline-first sync logic independent
//! of any UI or CLI surface.
//!
//! ## Architecture
//!
//! - **model**: validated domain entities (categories, entries, redemptions,
//!   goals, achievements) and derived statistics
//! - **storage**: the `LedgerStore` port plus in-memory and SQLite backends
//! - **batch**: atomic multi-operation application against a store
//! - **sync**: reconciliation of locally-pending changes with a remote store
//! - **clock**: injectable time and id-generation collaborators
//!
//! All fallible operations return [`error::Result`]; business-rule
//! violations carry their rule code (e.g. "BR-008") in the error message.

pub mod batch;
pub mod clock;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;

pub use batch::BatchExecutor;
pub use clock::{Clock, IdGenerator, SystemClock, UuidGenerator};
pub use error::{LedgerError, Result};
pub use storage::{LedgerStore, MemoryStore, SqliteStore};
pub use sync::{CancelToken, InMemoryRemote, RemoteStore, SyncEngine, SyncResult};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}

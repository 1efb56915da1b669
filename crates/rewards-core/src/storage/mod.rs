//! Storage layer: the ledger store port and its backends.

mod memory;
mod sqlite;
mod traits;
mod types;
mod watch;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{LedgerStore, MAX_CUSTOM_CATEGORIES};
pub use types::{
    BatchOperation, DateRange, HistoryFilter, HistoryPage, LedgerRecord, PendingChange,
    RecordKey, RecordKind, RemoteChange,
};
pub use watch::TotalPointsWatch;

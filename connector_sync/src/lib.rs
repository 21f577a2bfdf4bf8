//! Connector sync bookkeeping: per-connector cursors plus a deduplicated
//! retry / dead-letter ledger for individual connector failures.

pub mod backoff;
pub mod cli;
pub mod clock;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod service;
pub mod sqlite;
pub mod sync_state;
pub mod telemetry;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use backoff::{next_backoff_seconds, BackoffPolicy};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RecoveryConfig, StoreBackend, StoreConfig};
pub use dedupe::dedupe_key;
pub use error::{Error, Result};
pub use memory::MemoryConnectorStore;
pub use models::{
    ConnectorErrorRecord, ConnectorSyncState, ErrorStatus, ErrorSummary, RegisterErrorOptions,
    RegisteredError, SyncCursor, SyncStatus, SyncSuccessPatch, TenantId,
};
pub use postgres::PgConnectorStore;
pub use service::{ConnectorSyncService, RecoveryMetrics};
pub use sqlite::SqliteConnectorStore;
pub use traits::{ErrorLedger, SyncStateStore};

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use connector_sync::{
    Clock, ErrorLedger, ManualClock, MemoryConnectorStore, RecoveryConfig, SqliteConnectorStore,
    SyncStateStore, TenantId,
};
use tempfile::TempDir;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Sqlite,
}

pub const BACKENDS: [Backend; 2] = [Backend::Memory, Backend::Sqlite];

/// One store behind both trait objects, plus the clock that drives it.
pub struct Harness {
    pub backend: Backend,
    pub state: Arc<dyn SyncStateStore>,
    pub ledger: Arc<dyn ErrorLedger>,
    pub clock: ManualClock,
    _dir: Option<TempDir>,
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn tenant() -> TenantId {
    TenantId(Uuid::new_v4())
}

impl Harness {
    pub async fn new(backend: Backend, cfg: RecoveryConfig) -> Self {
        let clock = ManualClock::new(start());
        match backend {
            Backend::Memory => {
                let store = Arc::new(MemoryConnectorStore::with_clock(
                    cfg,
                    Arc::new(clock.clone()),
                ));
                Self {
                    backend,
                    state: store.clone(),
                    ledger: store,
                    clock,
                    _dir: None,
                }
            }
            Backend::Sqlite => {
                let dir = tempfile::tempdir().unwrap();
                let store = SqliteConnectorStore::open(dir.path().join("sync.db"), cfg)
                    .await
                    .unwrap()
                    .with_clock(Arc::new(clock.clone()));
                let store = Arc::new(store);
                Self {
                    backend,
                    state: store.clone(),
                    ledger: store,
                    clock,
                    _dir: Some(dir),
                }
            }
        }
    }

    pub async fn with_defaults(backend: Backend) -> Self {
        Self::new(backend, RecoveryConfig::default()).await
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

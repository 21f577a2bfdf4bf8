use crate::models::{
    ConnectorErrorRecord, ConnectorSyncState, ErrorSummary, RegisterErrorOptions,
    RegisteredError, SyncSuccessPatch, TenantId,
};
use crate::Result;
use async_trait::async_trait;
use uuid::Uuid;

/// Per-connector ingestion progress, one row per (tenant, connector).
///
/// Every `mark_*` call is a single atomic upsert on that key. `prior` must be the
/// state the caller fetched right before starting the run.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn get_state(
        &self,
        tenant: TenantId,
        connector: &str,
    ) -> Result<Option<ConnectorSyncState>>;

    /// Idempotent. Keeps cursor, `last_error` and `meta` of an existing row.
    async fn mark_running(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()>;

    /// Resets the retry count, clears `last_error` and replaces the cursor.
    async fn mark_success(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        patch: &SyncSuccessPatch,
    ) -> Result<()>;

    async fn mark_failure(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        error_message: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()>;
}

/// Deduplicated retry / dead-letter ledger for individual connector failures.
#[async_trait]
pub trait ErrorLedger: Send + Sync {
    /// Create or advance the active record for the failure's fingerprint.
    async fn register_error(
        &self,
        tenant: TenantId,
        options: RegisterErrorOptions,
    ) -> Result<RegisteredError>;

    /// Resolve every active record of a connector. Returns the number resolved.
    async fn resolve_errors(&self, tenant: TenantId, connector: &str) -> Result<u64>;

    /// Active records whose `next_retry_at` has passed, oldest first, ties by id.
    async fn list_due(&self, tenant: TenantId, limit: usize) -> Result<Vec<ConnectorErrorRecord>>;

    /// Dead-lettered records, most recently updated first.
    async fn list_dead_letter(
        &self,
        tenant: TenantId,
        limit: usize,
    ) -> Result<Vec<ConnectorErrorRecord>>;

    /// Move a dead-lettered record back to `pending` with a fresh budget.
    ///
    /// Returns `None` (and changes nothing) when the record is missing or not
    /// dead-lettered.
    async fn retry_dead_letter(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Option<ConnectorErrorRecord>>;

    /// Resolve one record regardless of its status.
    async fn resolve_by_id(&self, tenant: TenantId, id: Uuid) -> Result<Option<Uuid>>;

    async fn get_error(&self, tenant: TenantId, id: Uuid) -> Result<Option<ConnectorErrorRecord>>;

    async fn summarize(&self, tenant: TenantId) -> Result<ErrorSummary>;
}

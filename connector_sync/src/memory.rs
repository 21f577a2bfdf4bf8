use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{to_millis_precision, Clock, SystemClock};
use crate::config::RecoveryConfig;
use crate::ledger::{
    clamp_list_limit, normalize_connector, normalize_mode, status_for_attempt, NormalizedError,
};
use crate::models::{
    ConnectorErrorRecord, ConnectorSyncState, ErrorStatus, ErrorSummary, RegisterErrorOptions,
    RegisteredError, SyncCursor, SyncStatus, SyncSuccessPatch, TenantId,
};
use crate::sync_state::{failure_retry_count, running_retry_count, truncate_last_error};
use crate::traits::{ErrorLedger, SyncStateStore};
use crate::{Error, Result};

/// In-memory sync state + error ledger for local development and unit tests.
///
/// Each operation runs under a single lock, which gives the same atomicity the
/// SQL backends get from their unique-key upserts.
#[derive(Clone)]
pub struct MemoryConnectorStore {
    cfg: RecoveryConfig,
    clock: Arc<dyn Clock>,
    states: Arc<Mutex<HashMap<(TenantId, String), ConnectorSyncState>>>,
    errors: Arc<Mutex<Vec<ConnectorErrorRecord>>>,
}

impl MemoryConnectorStore {
    pub fn new(cfg: RecoveryConfig) -> Self {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: RecoveryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            cfg,
            clock,
            states: Arc::new(Mutex::new(HashMap::new())),
            errors: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of every ledger record across all tenants.
    pub async fn all_errors(&self) -> Vec<ConnectorErrorRecord> {
        self.errors.lock().await.clone()
    }

    fn now(&self) -> DateTime<Utc> {
        to_millis_precision(self.clock.now())
    }

    async fn upsert_state<F>(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        apply: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut ConnectorSyncState, DateTime<Utc>) + Send,
    {
        let connector = normalize_connector(connector)?;
        let mode = normalize_mode(Some(mode));
        let now = self.now();

        let mut states = self.states.lock().await;
        let row = states
            .entry((tenant, connector.clone()))
            .or_insert_with(|| ConnectorSyncState {
                tenant_id: tenant,
                connector,
                mode: mode.clone(),
                status: SyncStatus::Running,
                cursor: SyncCursor::default(),
                retry_count: 0,
                last_error: None,
                last_attempt_at: None,
                last_success_at: None,
                meta: serde_json::json!({}),
                updated_at: now,
            });
        row.mode = mode;
        row.updated_at = now;
        apply(row, now);
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for MemoryConnectorStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_state(
        &self,
        tenant: TenantId,
        connector: &str,
    ) -> Result<Option<ConnectorSyncState>> {
        let connector = normalize_connector(connector)?;
        Ok(self.states.lock().await.get(&(tenant, connector)).cloned())
    }

    #[tracing::instrument(level = "debug", skip(self, prior))]
    async fn mark_running(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()> {
        let retry_count = running_retry_count(prior);
        self.upsert_state(tenant, connector, mode, |row, now| {
            row.status = SyncStatus::Running;
            row.retry_count = retry_count;
            row.last_attempt_at = Some(now);
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn mark_success(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        patch: &SyncSuccessPatch,
    ) -> Result<()> {
        let cursor = patch.cursor.clone();
        let meta = patch.meta.clone();
        self.upsert_state(tenant, connector, mode, |row, now| {
            row.status = SyncStatus::Ok;
            row.retry_count = 0;
            row.last_error = None;
            row.cursor = cursor;
            if let Some(meta) = meta {
                row.meta = meta;
            }
            row.last_success_at = Some(now);
            row.last_attempt_at = Some(now);
        })
        .await
    }

    #[tracing::instrument(level = "debug", skip(self, error_message, prior))]
    async fn mark_failure(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        error_message: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()> {
        let retry_count = failure_retry_count(prior);
        let last_error = truncate_last_error(error_message);
        self.upsert_state(tenant, connector, mode, |row, now| {
            row.status = SyncStatus::Failed;
            row.retry_count = retry_count;
            row.last_error = Some(last_error);
            row.last_attempt_at = Some(now);
        })
        .await
    }
}

#[async_trait]
impl ErrorLedger for MemoryConnectorStore {
    #[tracing::instrument(level = "debug", skip(self, options))]
    async fn register_error(
        &self,
        tenant: TenantId,
        options: RegisterErrorOptions,
    ) -> Result<RegisteredError> {
        let n = NormalizedError::from_options(options)?;
        let now = self.now();
        let backoff = self.cfg.backoff();

        let mut errors = self.errors.lock().await;
        let active = errors.iter_mut().find(|r| {
            r.tenant_id == tenant
                && r.connector == n.connector
                && r.dedupe_key == n.dedupe_key
                && r.status.is_active()
        });

        let record = match active {
            Some(existing) => {
                let attempt = existing.attempt.saturating_add(1);
                existing.attempt = attempt;
                existing.status = status_for_attempt(attempt, self.cfg.max_attempts());
                existing.next_retry_at = backoff.next_retry_at(attempt, now);
                existing.mode = n.mode;
                existing.operation = n.operation;
                existing.source_ref = n.source_ref;
                existing.error_kind = n.error_kind;
                existing.error_message = n.error_message;
                existing.payload = n.payload;
                existing.updated_at = now;
                existing.clone()
            }
            None => {
                let record = ConnectorErrorRecord {
                    id: Uuid::new_v4(),
                    tenant_id: tenant,
                    connector: n.connector,
                    mode: n.mode,
                    operation: n.operation,
                    source_ref: n.source_ref,
                    error_kind: n.error_kind,
                    dedupe_key: n.dedupe_key,
                    attempt: 1,
                    status: status_for_attempt(1, self.cfg.max_attempts()),
                    next_retry_at: backoff.next_retry_at(1, now),
                    error_message: n.error_message,
                    payload: n.payload,
                    created_at: now,
                    updated_at: now,
                    resolved_at: None,
                };
                errors.push(record.clone());
                record
            }
        };

        Ok(RegisteredError {
            id: record.id,
            attempt: record.attempt,
            status: record.status,
            next_retry_at: record.next_retry_at,
        })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_errors(&self, tenant: TenantId, connector: &str) -> Result<u64> {
        let connector = normalize_connector(connector)?;
        let now = self.now();
        let mut count = 0;
        for r in self.errors.lock().await.iter_mut() {
            if r.tenant_id == tenant && r.connector == connector && r.status.is_active() {
                r.status = ErrorStatus::Resolved;
                r.resolved_at = Some(now);
                r.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_due(&self, tenant: TenantId, limit: usize) -> Result<Vec<ConnectorErrorRecord>> {
        let now = self.now();
        let mut due: Vec<ConnectorErrorRecord> = self
            .errors
            .lock()
            .await
            .iter()
            .filter(|r| r.tenant_id == tenant && r.status.is_active() && r.next_retry_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_retry_at
                .cmp(&b.next_retry_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        due.truncate(clamp_list_limit(limit));
        Ok(due)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_dead_letter(
        &self,
        tenant: TenantId,
        limit: usize,
    ) -> Result<Vec<ConnectorErrorRecord>> {
        let mut dead: Vec<ConnectorErrorRecord> = self
            .errors
            .lock()
            .await
            .iter()
            .filter(|r| r.tenant_id == tenant && r.status == ErrorStatus::DeadLetter)
            .cloned()
            .collect();
        dead.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        dead.truncate(clamp_list_limit(limit));
        Ok(dead)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn retry_dead_letter(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Option<ConnectorErrorRecord>> {
        let now = self.now();
        let mut errors = self.errors.lock().await;

        let Some(idx) = errors.iter().position(|r| {
            r.tenant_id == tenant && r.id == id && r.status == ErrorStatus::DeadLetter
        }) else {
            return Ok(None);
        };

        let target = &errors[idx];
        let shadowed = errors.iter().any(|r| {
            r.tenant_id == tenant
                && r.connector == target.connector
                && r.dedupe_key == target.dedupe_key
                && r.status.is_active()
        });
        if shadowed {
            return Err(Error::Conflict(format!(
                "retry dead letter {id}: an active record already tracks this fingerprint"
            )));
        }

        let record = &mut errors[idx];
        record.status = ErrorStatus::Pending;
        record.attempt = 0;
        record.next_retry_at = now;
        record.updated_at = now;
        Ok(Some(record.clone()))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_by_id(&self, tenant: TenantId, id: Uuid) -> Result<Option<Uuid>> {
        let now = self.now();
        let mut errors = self.errors.lock().await;
        match errors.iter_mut().find(|r| r.tenant_id == tenant && r.id == id) {
            Some(record) => {
                record.status = ErrorStatus::Resolved;
                record.resolved_at = Some(now);
                record.updated_at = now;
                Ok(Some(record.id))
            }
            None => Ok(None),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_error(&self, tenant: TenantId, id: Uuid) -> Result<Option<ConnectorErrorRecord>> {
        Ok(self
            .errors
            .lock()
            .await
            .iter()
            .find(|r| r.tenant_id == tenant && r.id == id)
            .cloned())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn summarize(&self, tenant: TenantId) -> Result<ErrorSummary> {
        let mut summary = ErrorSummary::default();
        for r in self.errors.lock().await.iter().filter(|r| r.tenant_id == tenant) {
            summary.add(r.status, 1);
        }
        Ok(summary)
    }
}

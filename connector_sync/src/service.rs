use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ledger::{DEFAULT_DEAD_LETTER_LIMIT, DEFAULT_DUE_LIMIT};
use crate::models::{
    ConnectorErrorRecord, ConnectorSyncState, ErrorStatus, ErrorSummary, RegisterErrorOptions,
    RegisteredError, SyncSuccessPatch, TenantId,
};
use crate::sync_state::cursor_regressed;
use crate::traits::{ErrorLedger, SyncStateStore};
use crate::Result;

/// Counters for the recovery layer, owned by one service instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub errors_registered: u64,
    pub dead_lettered: u64,
    pub errors_resolved: u64,
    pub dead_letters_retried: u64,
    pub sync_failures: u64,
    pub sync_successes: u64,
    pub cursor_regressions: u64,
}

/// Front door for connector sync bookkeeping.
///
/// Connectors call this around every run: `mark_*` for run-level state, the ledger
/// methods for individual failures. Nothing here raises on connector failures;
/// only store errors propagate.
#[derive(Clone)]
pub struct ConnectorSyncService {
    state: Arc<dyn SyncStateStore>,
    ledger: Arc<dyn ErrorLedger>,
    metrics: Arc<Mutex<RecoveryMetrics>>,
}

impl ConnectorSyncService {
    #[tracing::instrument(level = "debug", skip(state, ledger))]
    pub fn new(
        state: Arc<dyn SyncStateStore>,
        ledger: Arc<dyn ErrorLedger>,
        metrics: RecoveryMetrics,
    ) -> Self {
        Self {
            state,
            ledger,
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    /// Build a service over a single store that implements both halves.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: SyncStateStore + ErrorLedger + 'static,
    {
        Self::new(store.clone(), store, RecoveryMetrics::default())
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        *self.lock_metrics()
    }

    fn lock_metrics(&self) -> MutexGuard<'_, RecoveryMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, f: impl FnOnce(&mut RecoveryMetrics)) {
        f(&mut self.lock_metrics());
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_connector_sync_state(
        &self,
        tenant: TenantId,
        connector: &str,
    ) -> Result<Option<ConnectorSyncState>> {
        self.state.get_state(tenant, connector).await
    }

    #[tracing::instrument(level = "debug", skip(self, prior))]
    pub async fn mark_connector_sync_running(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()> {
        self.state.mark_running(tenant, connector, mode, prior).await
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    pub async fn mark_connector_sync_success(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        patch: &SyncSuccessPatch,
    ) -> Result<()> {
        self.state.mark_success(tenant, connector, mode, patch).await?;
        self.bump(|m| m.sync_successes += 1);
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, error_message, prior))]
    pub async fn mark_connector_sync_failure(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        error_message: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()> {
        self.state
            .mark_failure(tenant, connector, mode, error_message, prior)
            .await?;
        self.bump(|m| m.sync_failures += 1);
        tracing::info!(%tenant, connector, "connector sync failed");
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, options))]
    pub async fn register_connector_error(
        &self,
        tenant: TenantId,
        options: RegisterErrorOptions,
    ) -> Result<RegisteredError> {
        let connector = options.connector.clone();
        let registered = self.ledger.register_error(tenant, options).await?;

        let dead = registered.status == ErrorStatus::DeadLetter;
        self.bump(|m| {
            m.errors_registered += 1;
            if dead {
                m.dead_lettered += 1;
            }
        });
        if dead {
            tracing::warn!(
                %tenant,
                connector = %connector,
                error_id = %registered.id,
                attempt = registered.attempt,
                "connector error dead-lettered"
            );
        } else {
            tracing::debug!(
                %tenant,
                connector = %connector,
                error_id = %registered.id,
                attempt = registered.attempt,
                next_retry_at = %registered.next_retry_at,
                "connector error scheduled for retry"
            );
        }
        Ok(registered)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve_connector_errors(&self, tenant: TenantId, connector: &str) -> Result<u64> {
        let resolved = self.ledger.resolve_errors(tenant, connector).await?;
        if resolved > 0 {
            self.bump(|m| m.errors_resolved += resolved);
            tracing::info!(%tenant, connector, resolved, "connector errors resolved");
        }
        Ok(resolved)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_due_connector_errors(
        &self,
        tenant: TenantId,
        limit: Option<usize>,
    ) -> Result<Vec<ConnectorErrorRecord>> {
        self.ledger
            .list_due(tenant, limit.unwrap_or(DEFAULT_DUE_LIMIT))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn list_dead_letter_errors(
        &self,
        tenant: TenantId,
        limit: Option<usize>,
    ) -> Result<Vec<ConnectorErrorRecord>> {
        self.ledger
            .list_dead_letter(tenant, limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT))
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retry_dead_letter_error(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Option<ConnectorErrorRecord>> {
        let record = self.ledger.retry_dead_letter(tenant, id).await?;
        if let Some(r) = &record {
            self.bump(|m| m.dead_letters_retried += 1);
            tracing::info!(%tenant, connector = %r.connector, error_id = %id, "dead letter requeued");
        }
        Ok(record)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve_connector_error_by_id(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Option<Uuid>> {
        let resolved = self.ledger.resolve_by_id(tenant, id).await?;
        if resolved.is_some() {
            self.bump(|m| m.errors_resolved += 1);
        }
        Ok(resolved)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get_connector_error(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Option<ConnectorErrorRecord>> {
        self.ledger.get_error(tenant, id).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn summarize_connector_errors(&self, tenant: TenantId) -> Result<ErrorSummary> {
        self.ledger.summarize(tenant).await
    }

    /// Close out a clean run: advance the cursor, then resolve the connector's
    /// outstanding failures. Returns how many ledger records were resolved.
    #[tracing::instrument(level = "debug", skip(self, prior, patch))]
    pub async fn record_sync_success(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        prior: Option<&ConnectorSyncState>,
        patch: &SyncSuccessPatch,
    ) -> Result<u64> {
        if let Some(prior) = prior {
            if cursor_regressed(&prior.cursor, &patch.cursor) {
                self.bump(|m| m.cursor_regressions += 1);
                tracing::warn!(
                    %tenant,
                    connector,
                    prior_cursor = ?prior.cursor.timestamp,
                    next_cursor = ?patch.cursor.timestamp,
                    "sync cursor moved backwards"
                );
            }
        }
        self.mark_connector_sync_success(tenant, connector, mode, patch)
            .await?;
        self.resolve_connector_errors(tenant, connector).await
    }

    /// Record a failed run in both the sync state and the ledger.
    ///
    /// The two writes are independent; a crash between them is tolerated.
    #[tracing::instrument(level = "debug", skip(self, prior, options))]
    pub async fn record_sync_failure(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        prior: Option<&ConnectorSyncState>,
        mut options: RegisterErrorOptions,
    ) -> Result<RegisteredError> {
        self.mark_connector_sync_failure(tenant, connector, mode, &options.error_message, prior)
            .await?;
        if options.connector.trim().is_empty() {
            options.connector = connector.to_string();
        }
        if options.mode.is_none() {
            options.mode = Some(mode.to_string());
        }
        self.register_connector_error(tenant, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::RecoveryConfig;
    use crate::memory::MemoryConnectorStore;
    use crate::models::{SyncCursor, SyncStatus};
    use chrono::{Duration, TimeZone, Utc};

    fn service(max_attempts: u32) -> (ConnectorSyncService, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let store = MemoryConnectorStore::with_clock(
            RecoveryConfig::new(max_attempts, 30),
            Arc::new(clock.clone()),
        );
        (ConnectorSyncService::from_store(Arc::new(store)), clock)
    }

    fn tenant() -> TenantId {
        TenantId(Uuid::new_v4())
    }

    #[tokio::test]
    async fn failure_flow_updates_state_and_ledger() {
        let (svc, _clock) = service(5);
        let t = tenant();

        let reg = svc
            .record_sync_failure(
                t,
                "chatwoot",
                "http",
                None,
                RegisterErrorOptions::new("", "upstream 502"),
            )
            .await
            .unwrap();
        assert_eq!(reg.attempt, 1);
        assert_eq!(reg.status, ErrorStatus::Pending);

        let state = svc
            .get_connector_sync_state(t, "chatwoot")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, SyncStatus::Failed);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("upstream 502"));

        let record = svc.get_connector_error(t, reg.id).await.unwrap().unwrap();
        assert_eq!(record.connector, "chatwoot");
        assert_eq!(record.mode, "http");

        let m = svc.metrics();
        assert_eq!(m.sync_failures, 1);
        assert_eq!(m.errors_registered, 1);
        assert_eq!(m.dead_lettered, 0);
    }

    #[tokio::test]
    async fn success_flow_resolves_open_errors() {
        let (svc, _clock) = service(5);
        let t = tenant();
        for op in ["list", "fetch"] {
            svc.register_connector_error(
                t,
                RegisterErrorOptions::new("chatwoot", "timeout").operation(op),
            )
            .await
            .unwrap();
        }

        let prior = svc.get_connector_sync_state(t, "chatwoot").await.unwrap();
        let resolved = svc
            .record_sync_success(
                t,
                "chatwoot",
                "http",
                prior.as_ref(),
                &SyncSuccessPatch::new(SyncCursor::new(None, Some("99".into()), None)),
            )
            .await
            .unwrap();
        assert_eq!(resolved, 2);

        let summary = svc.summarize_connector_errors(t).await.unwrap();
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.open(), 0);
        assert_eq!(svc.metrics().errors_resolved, 2);
        assert_eq!(svc.metrics().sync_successes, 1);
    }

    #[tokio::test]
    async fn cursor_regression_is_counted_but_written() {
        let (svc, clock) = service(5);
        let t = tenant();
        let now = clock.now();

        let ahead = SyncSuccessPatch::new(SyncCursor::new(Some(now), None, None));
        svc.mark_connector_sync_success(t, "slack", "http", &ahead)
            .await
            .unwrap();
        let prior = svc.get_connector_sync_state(t, "slack").await.unwrap();

        let behind = SyncSuccessPatch::new(SyncCursor::new(
            Some(now - Duration::hours(1)),
            None,
            None,
        ));
        svc.record_sync_success(t, "slack", "http", prior.as_ref(), &behind)
            .await
            .unwrap();

        let state = svc.get_connector_sync_state(t, "slack").await.unwrap().unwrap();
        assert_eq!(state.cursor.timestamp, Some(now - Duration::hours(1)));
        assert_eq!(svc.metrics().cursor_regressions, 1);
    }

    #[tokio::test]
    async fn advancing_by_id_alone_is_not_counted_as_regression() {
        let (svc, clock) = service(5);
        let t = tenant();

        let first = SyncSuccessPatch::new(SyncCursor::new(Some(clock.now()), Some("41".into()), None));
        svc.mark_connector_sync_success(t, "intercom", "http", &first)
            .await
            .unwrap();
        let prior = svc.get_connector_sync_state(t, "intercom").await.unwrap();

        let by_id = SyncSuccessPatch::new(SyncCursor::new(None, Some("42".into()), None));
        svc.record_sync_success(t, "intercom", "http", prior.as_ref(), &by_id)
            .await
            .unwrap();

        assert_eq!(svc.metrics().cursor_regressions, 0);
        let state = svc.get_connector_sync_state(t, "intercom").await.unwrap().unwrap();
        assert_eq!(state.cursor, by_id.cursor);
    }

    #[tokio::test]
    async fn dead_letter_and_manual_retry_are_counted() {
        let (svc, _clock) = service(2);
        let t = tenant();
        let opts = RegisterErrorOptions::new("gmail", "quota exceeded").source_ref("msg-1");

        svc.register_connector_error(t, opts.clone()).await.unwrap();
        let dead = svc.register_connector_error(t, opts).await.unwrap();
        assert_eq!(dead.status, ErrorStatus::DeadLetter);

        let listed = svc.list_dead_letter_errors(t, None).await.unwrap();
        assert_eq!(listed.len(), 1);

        let retried = svc
            .retry_dead_letter_error(t, dead.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.status, ErrorStatus::Pending);
        assert_eq!(retried.attempt, 0);

        // Immediately due again.
        let due = svc.list_due_connector_errors(t, None).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, dead.id);

        let m = svc.metrics();
        assert_eq!(m.dead_lettered, 1);
        assert_eq!(m.dead_letters_retried, 1);
    }

    #[tokio::test]
    async fn metrics_start_from_the_supplied_value() {
        let store = Arc::new(MemoryConnectorStore::new(RecoveryConfig::default()));
        let seed = RecoveryMetrics {
            errors_registered: 7,
            ..RecoveryMetrics::default()
        };
        let svc = ConnectorSyncService::new(store.clone(), store, seed);
        svc.register_connector_error(tenant(), RegisterErrorOptions::new("hubspot", "boom"))
            .await
            .unwrap();
        assert_eq!(svc.metrics().errors_registered, 8);
    }

    #[tokio::test]
    async fn resolving_unknown_id_changes_nothing() {
        let (svc, _clock) = service(5);
        let out = svc
            .resolve_connector_error_by_id(tenant(), Uuid::new_v4())
            .await
            .unwrap();
        assert!(out.is_none());
        assert_eq!(svc.metrics().errors_resolved, 0);
    }
}

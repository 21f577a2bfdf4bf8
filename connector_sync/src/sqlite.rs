//! SQLite-backed sync state + error ledger.
//!
//! Single WAL-mode file, schema applied on open. Ledger timestamps are stored
//! as INTEGER unix milliseconds so due-ordering and backoff arithmetic happen
//! inside SQL.
//!
//! Usage:
//! ```ignore
//! let store = SqliteConnectorStore::open("/path/to/connector_sync.db", RecoveryConfig::from_env()).await?;
//! ```

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::{RecoveryConfig, StoreConfig};
use crate::ledger::{clamp_list_limit, normalize_connector, normalize_mode, NormalizedError};
use crate::models::{
    ConnectorErrorRecord, ConnectorSyncState, ErrorStatus, ErrorSummary, RegisterErrorOptions,
    RegisteredError, SyncCursor, SyncStatus, SyncSuccessPatch, TenantId,
};
use crate::sync_state::{failure_retry_count, running_retry_count, truncate_last_error};
use crate::traits::{ErrorLedger, SyncStateStore};
use crate::{Error, Result};

#[derive(Clone)]
pub struct SqliteConnectorStore {
    pool: SqlitePool,
    cfg: RecoveryConfig,
    clock: Arc<dyn Clock>,
}

impl SqliteConnectorStore {
    /// Create (or open) the store at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist.
    pub async fn open(path: impl AsRef<Path>, cfg: RecoveryConfig) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_connector_store mkdir", e))?;
        }
        Self::connect(&StoreConfig::new(format!("sqlite://{}", path.display())), cfg).await
    }

    #[tracing::instrument(level = "debug", skip(store_cfg, cfg))]
    pub async fn connect(store_cfg: &StoreConfig, cfg: RecoveryConfig) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(&store_cfg.url)
            .map_err(|e| Error::backend("sqlite_connector_store connect options", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(store_cfg.max_connections)
            .acquire_timeout(store_cfg.acquire_timeout)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_connector_store connect", e))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_connector_store schema", e))?;

        Ok(Self {
            pool,
            cfg,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS connector_sync_state (
    tenant_id TEXT NOT NULL,
    connector TEXT NOT NULL,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    cursor_ts TEXT,
    cursor_id TEXT,
    cursor_page_token TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    last_attempt_at_ms INTEGER,
    last_success_at_ms INTEGER,
    meta_json TEXT NOT NULL DEFAULT '{}',
    updated_at_ms INTEGER NOT NULL,
    PRIMARY KEY (tenant_id, connector)
);

CREATE TABLE IF NOT EXISTS connector_errors (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    connector TEXT NOT NULL,
    mode TEXT NOT NULL,
    operation TEXT NOT NULL,
    source_ref TEXT,
    error_kind TEXT NOT NULL,
    dedupe_key TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    next_retry_at_ms INTEGER NOT NULL,
    error_message TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    updated_at_ms INTEGER NOT NULL,
    resolved_at_ms INTEGER
);

CREATE UNIQUE INDEX IF NOT EXISTS connector_errors_active_key_idx
  ON connector_errors(tenant_id, connector, dedupe_key)
  WHERE status IN ('pending', 'retrying');
CREATE INDEX IF NOT EXISTS connector_errors_due_idx
  ON connector_errors(tenant_id, status, next_retry_at_ms, id);
CREATE INDEX IF NOT EXISTS connector_errors_updated_idx
  ON connector_errors(tenant_id, status, updated_at_ms DESC, id);
"#;

const ERROR_COLUMNS: &str = "id, tenant_id, connector, mode, operation, source_ref, error_kind, \
     dedupe_key, attempt, status, next_retry_at_ms, error_message, payload_json, created_at_ms, \
     updated_at_ms, resolved_at_ms";

// The conflict target names the partial index, so only an active record for the
// fingerprint is advanced; resolved and dead-lettered rows never match. The
// increment, status and next_retry_at are all computed from the stored row in
// this one statement.
const REGISTER_ERROR: &str = r#"
INSERT INTO connector_errors
  (id, tenant_id, connector, mode, operation, source_ref, error_kind, dedupe_key,
   attempt, status, next_retry_at_ms, error_message, payload_json, created_at_ms,
   updated_at_ms, resolved_at_ms)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
   1, 'pending', ?9, ?10, ?11, ?12,
   ?12, NULL)
ON CONFLICT(tenant_id, connector, dedupe_key) WHERE status IN ('pending', 'retrying')
DO UPDATE SET
  attempt = connector_errors.attempt + 1,
  status = CASE
    WHEN connector_errors.attempt + 1 >= ?13 THEN 'dead_letter'
    WHEN connector_errors.attempt + 1 > 1 THEN 'retrying'
    ELSE 'pending'
  END,
  next_retry_at_ms = ?12 + 1000 * min(?15, ?14 * (1 << min(max(connector_errors.attempt, 0), 10))),
  mode = excluded.mode,
  operation = excluded.operation,
  source_ref = excluded.source_ref,
  error_kind = excluded.error_kind,
  error_message = excluded.error_message,
  payload_json = excluded.payload_json,
  updated_at_ms = excluded.updated_at_ms
RETURNING id, attempt, status, next_retry_at_ms
"#;

#[async_trait]
impl SyncStateStore for SqliteConnectorStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_state(
        &self,
        tenant: TenantId,
        connector: &str,
    ) -> Result<Option<ConnectorSyncState>> {
        let connector = normalize_connector(connector)?;
        let row = sqlx::query(
            r#"
SELECT tenant_id, connector, mode, status, cursor_ts, cursor_id, cursor_page_token,
       retry_count, last_error, last_attempt_at_ms, last_success_at_ms, meta_json, updated_at_ms
FROM connector_sync_state
WHERE tenant_id = ?1 AND connector = ?2
"#,
        )
        .bind(tenant.to_string())
        .bind(&connector)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get sync state", e))?;

        row.as_ref().map(row_to_sync_state).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self, prior))]
    async fn mark_running(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        prior: Option<&ConnectorSyncState>,
    ) -> Result<()> {
        let connector = normalize_connector(connector)?;
        sqlx::query(
            r#"
INSERT INTO connector_sync_state
  (tenant_id, connector, mode, status, retry_count, last_attempt_at_ms, meta_json, updated_at_ms)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, '{}', ?6)
ON CONFLICT(tenant_id, connector) DO UPDATE SET
  mode = excluded.mode,
  status = excluded.status,
  retry_count = excluded.retry_count,
  last_attempt_at_ms = excluded.last_attempt_at_ms,
  updated_at_ms = excluded.updated_at_ms
"#,
        )
        .bind(tenant.to_string())
        .bind(&connector)
        .bind(normalize_mode(Some(mode)))
        .bind(SyncStatus::Running.as_str())
        .bind(i64::from(running_retry_count(prior)))
        .bind(self.now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("mark sync running", e))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, patch))]
    async fn mark_success(
        &self,
        tenant: TenantId,
        connector: &str,
        mode: &str,
        patch: &SyncSuccessPatch,
    ) -> Result<()> {
        let connector = normalize_connector(connector)?;
        let meta_json = patch
            .meta
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::backend("serialize sync meta", e))?;

        sqlx::query(
            r#"
INSERT INTO connector_sync_state
  (tenant_id, connector, mode, status, cursor_ts, cursor_id, cursor_page_token,
   retry_count, last_error, last_attempt_at_ms, last_success_at_ms, meta_json, updated_at_ms)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7,
   0, NULL, ?8, ?8, COALESCE(?9, '{}'), ?8)
ON CONFLICT(tenant_id, connector) DO UPDATE SET
  mode = excluded.mode,
  status = excluded.status,
  cursor_ts = excluded.cursor_ts,
  cursor_id = excluded.cursor_id,
  cursor_page_token = excluded.cursor_page_token,
  retry_count = 0,
  last_error = NULL,
  last_attempt_at_ms = excluded.last_attempt_at_ms,
  last_success_at_ms = excluded.last_success_at_ms,
  meta_json = COALESCE(?9, connector_sync_state.meta_json),
  updated_at_ms = excluded.updated_at_ms
"#,
        )
        .bind(tenant.to_string())
        .bind(&connector)
        .bind(normalize_mode(Some(mode)))
        .bind(SyncStatus::Ok.as_str())
        .bind(patch.cursor.timestamp.map(format_dt))
        .bind(&patch.cursor.id)
        .bind(&patch.cursor.page_token)
        .bind(self.now_ms())
        .bind(meta_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("mark sync success", e))?;
        Ok(())
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
        let connector = normalize_connector(connector)?;
        sqlx::query(
            r#"
INSERT INTO connector_sync_state
  (tenant_id, connector, mode, status, retry_count, last_error, last_attempt_at_ms,
   meta_json, updated_at_ms)
VALUES
  (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?7)
ON CONFLICT(tenant_id, connector) DO UPDATE SET
  mode = excluded.mode,
  status = excluded.status,
  retry_count = excluded.retry_count,
  last_error = excluded.last_error,
  last_attempt_at_ms = excluded.last_attempt_at_ms,
  updated_at_ms = excluded.updated_at_ms
"#,
        )
        .bind(tenant.to_string())
        .bind(&connector)
        .bind(normalize_mode(Some(mode)))
        .bind(SyncStatus::Failed.as_str())
        .bind(i64::from(failure_retry_count(prior)))
        .bind(truncate_last_error(error_message))
        .bind(self.now_ms())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("mark sync failure", e))?;
        Ok(())
    }
}

#[async_trait]
impl ErrorLedger for SqliteConnectorStore {
    #[tracing::instrument(level = "debug", skip(self, options))]
    async fn register_error(
        &self,
        tenant: TenantId,
        options: RegisterErrorOptions,
    ) -> Result<RegisteredError> {
        let n = NormalizedError::from_options(options)?;
        let now = self.clock.now();
        let backoff = self.cfg.backoff();
        let first_retry_at = backoff.next_retry_at(1, now).timestamp_millis();
        let payload_json = serde_json::to_string(&n.payload)
            .map_err(|e| Error::backend("serialize error payload", e))?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(REGISTER_ERROR)
            .bind(Uuid::new_v4().to_string())
            .bind(tenant.to_string())
            .bind(&n.connector)
            .bind(&n.mode)
            .bind(&n.operation)
            .bind(&n.source_ref)
            .bind(&n.error_kind)
            .bind(&n.dedupe_key)
            .bind(first_retry_at)
            .bind(&n.error_message)
            .bind(payload_json)
            .bind(now.timestamp_millis())
            .bind(i64::from(self.cfg.max_attempts()))
            .bind(to_i64(self.cfg.retry_base_seconds()))
            .bind(to_i64(self.cfg.retry_cap_seconds()))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::from_write("register connector error", e))?;

        let mut registered = RegisteredError {
            id: parse_uuid(&row.try_get::<String, _>("id")?)?,
            attempt: to_u32(row.try_get::<i64, _>("attempt")?),
            status: parse_status(&row.try_get::<String, _>("status")?)?,
            next_retry_at: from_millis(row.try_get("next_retry_at_ms")?)?,
        };

        // A fresh insert always lands as `pending` so it is covered by the
        // active-key index; a one-attempt budget still dead-letters it here.
        if registered.attempt >= self.cfg.max_attempts()
            && registered.status != ErrorStatus::DeadLetter
        {
            sqlx::query("UPDATE connector_errors SET status = ?2 WHERE id = ?1")
                .bind(registered.id.to_string())
                .bind(ErrorStatus::DeadLetter.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::backend("dead-letter fresh error", e))?;
            registered.status = ErrorStatus::DeadLetter;
        }
        tx.commit().await?;

        Ok(registered)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_errors(&self, tenant: TenantId, connector: &str) -> Result<u64> {
        let connector = normalize_connector(connector)?;
        let now = self.now_ms();
        let res = sqlx::query(
            r#"
UPDATE connector_errors
SET status = 'resolved', resolved_at_ms = ?3, updated_at_ms = ?3
WHERE tenant_id = ?1 AND connector = ?2 AND status IN ('pending', 'retrying')
"#,
        )
        .bind(tenant.to_string())
        .bind(&connector)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("resolve connector errors", e))?;
        Ok(res.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_due(&self, tenant: TenantId, limit: usize) -> Result<Vec<ConnectorErrorRecord>> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {ERROR_COLUMNS}
FROM connector_errors
WHERE tenant_id = ?1 AND status IN ('pending', 'retrying') AND next_retry_at_ms <= ?2
ORDER BY next_retry_at_ms ASC, id ASC
LIMIT ?3
"#
        ))
        .bind(tenant.to_string())
        .bind(self.now_ms())
        .bind(clamp_list_limit(limit) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list due connector errors", e))?;

        rows.iter().map(row_to_error).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_dead_letter(
        &self,
        tenant: TenantId,
        limit: usize,
    ) -> Result<Vec<ConnectorErrorRecord>> {
        let rows = sqlx::query(&format!(
            r#"
SELECT {ERROR_COLUMNS}
FROM connector_errors
WHERE tenant_id = ?1 AND status = 'dead_letter'
ORDER BY updated_at_ms DESC, id ASC
LIMIT ?2
"#
        ))
        .bind(tenant.to_string())
        .bind(clamp_list_limit(limit) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list dead letter errors", e))?;

        rows.iter().map(row_to_error).collect()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn retry_dead_letter(
        &self,
        tenant: TenantId,
        id: Uuid,
    ) -> Result<Option<ConnectorErrorRecord>> {
        let row = sqlx::query(&format!(
            r#"
UPDATE connector_errors
SET status = 'pending', attempt = 0, next_retry_at_ms = ?3, updated_at_ms = ?3
WHERE tenant_id = ?1 AND id = ?2 AND status = 'dead_letter'
RETURNING {ERROR_COLUMNS}
"#
        ))
        .bind(tenant.to_string())
        .bind(id.to_string())
        .bind(self.now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::from_write("retry dead letter error", e))?;

        row.as_ref().map(row_to_error).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_by_id(&self, tenant: TenantId, id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
UPDATE connector_errors
SET status = 'resolved', resolved_at_ms = ?3, updated_at_ms = ?3
WHERE tenant_id = ?1 AND id = ?2
RETURNING id
"#,
        )
        .bind(tenant.to_string())
        .bind(id.to_string())
        .bind(self.now_ms())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("resolve connector error", e))?;

        row.map(|r| parse_uuid(&r.try_get::<String, _>("id")?))
            .transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_error(&self, tenant: TenantId, id: Uuid) -> Result<Option<ConnectorErrorRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ERROR_COLUMNS} FROM connector_errors WHERE tenant_id = ?1 AND id = ?2"
        ))
        .bind(tenant.to_string())
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get connector error", e))?;

        row.as_ref().map(row_to_error).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn summarize(&self, tenant: TenantId) -> Result<ErrorSummary> {
        let rows = sqlx::query(
            r#"
SELECT status, COUNT(*) AS n
FROM connector_errors
WHERE tenant_id = ?1
GROUP BY status
"#,
        )
        .bind(tenant.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("summarize connector errors", e))?;

        let mut summary = ErrorSummary::default();
        for row in rows {
            let status = parse_status(&row.try_get::<String, _>("status")?)?;
            summary.add(status, row.try_get::<i64, _>("n")?.max(0) as u64);
        }
        Ok(summary)
    }
}

fn row_to_sync_state(row: &SqliteRow) -> Result<ConnectorSyncState> {
    let status: String = row.try_get("status")?;
    let meta_json: String = row.try_get("meta_json")?;
    let cursor_ts: Option<String> = row.try_get("cursor_ts")?;

    Ok(ConnectorSyncState {
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id")?)?,
        connector: row.try_get("connector")?,
        mode: row.try_get("mode")?,
        status: SyncStatus::parse_str(&status)
            .ok_or_else(|| Error::BackendMessage(format!("invalid sync status in db: {status}")))?,
        cursor: SyncCursor {
            timestamp: cursor_ts.as_deref().map(parse_dt).transpose()?,
            id: row.try_get("cursor_id")?,
            page_token: row.try_get("cursor_page_token")?,
        },
        retry_count: to_u32(row.try_get("retry_count")?),
        last_error: row.try_get("last_error")?,
        last_attempt_at: opt_from_millis(row.try_get("last_attempt_at_ms")?)?,
        last_success_at: opt_from_millis(row.try_get("last_success_at_ms")?)?,
        meta: serde_json::from_str(&meta_json)
            .map_err(|e| Error::backend("decode sync meta", e))?,
        updated_at: from_millis(row.try_get("updated_at_ms")?)?,
    })
}

fn row_to_error(row: &SqliteRow) -> Result<ConnectorErrorRecord> {
    let payload_json: String = row.try_get("payload_json")?;

    Ok(ConnectorErrorRecord {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_id: parse_tenant(&row.try_get::<String, _>("tenant_id")?)?,
        connector: row.try_get("connector")?,
        mode: row.try_get("mode")?,
        operation: row.try_get("operation")?,
        source_ref: row.try_get("source_ref")?,
        error_kind: row.try_get("error_kind")?,
        dedupe_key: row.try_get("dedupe_key")?,
        attempt: to_u32(row.try_get("attempt")?),
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        next_retry_at: from_millis(row.try_get("next_retry_at_ms")?)?,
        error_message: row.try_get("error_message")?,
        payload: serde_json::from_str(&payload_json)
            .map_err(|e| Error::backend("decode error payload", e))?,
        created_at: from_millis(row.try_get("created_at_ms")?)?,
        updated_at: from_millis(row.try_get("updated_at_ms")?)?,
        resolved_at: opt_from_millis(row.try_get("resolved_at_ms")?)?,
    })
}

fn parse_status(s: &str) -> Result<ErrorStatus> {
    ErrorStatus::parse_str(s)
        .ok_or_else(|| Error::BackendMessage(format!("invalid error status in db: {s}")))
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::backend("parse uuid", e))
}

fn parse_tenant(s: &str) -> Result<TenantId> {
    TenantId::from_str(s).map_err(|e| Error::backend("parse tenant id", e))
}

fn format_dt(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_dt(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::backend("parse datetime", e))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| Error::BackendMessage(format!("timestamp out of range: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn to_u32(v: i64) -> u32 {
    v.clamp(0, i64::from(u32::MAX)) as u32
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

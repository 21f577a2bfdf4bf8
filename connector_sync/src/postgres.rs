use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

use crate::clock::{to_millis_precision, Clock, SystemClock};
use crate::config::{RecoveryConfig, StoreConfig};
use crate::ledger::{clamp_list_limit, normalize_connector, normalize_mode, NormalizedError};
use crate::models::{
    ConnectorErrorRecord, ConnectorSyncState, ErrorStatus, ErrorSummary, RegisterErrorOptions,
    RegisteredError, SyncCursor, SyncStatus, SyncSuccessPatch, TenantId,
};
use crate::sync_state::{failure_retry_count, running_retry_count, truncate_last_error};
use crate::traits::{ErrorLedger, SyncStateStore};
use crate::{Error, Result};

/// Postgres-backed sync state + error ledger for multi-node deployments.
#[derive(Clone)]
pub struct PgConnectorStore {
    pool: PgPool,
    cfg: RecoveryConfig,
    clock: Arc<dyn Clock>,
}

impl PgConnectorStore {
    #[tracing::instrument(level = "debug", skip(store_cfg, cfg))]
    pub async fn connect(store_cfg: &StoreConfig, cfg: RecoveryConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(store_cfg.max_connections)
            .acquire_timeout(store_cfg.acquire_timeout)
            .connect(&store_cfg.url)
            .await
            .map_err(|e| Error::backend("connect postgres", e))?;
        Ok(Self::new(pool, cfg))
    }

    #[tracing::instrument(level = "debug", skip(pool))]
    pub fn new(pool: PgPool, cfg: RecoveryConfig) -> Self {
        Self {
            pool,
            cfg,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn now(&self) -> DateTime<Utc> {
        to_millis_precision(self.clock.now())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connector_sync_state (
                tenant_id         UUID NOT NULL,
                connector         TEXT NOT NULL,
                mode              TEXT NOT NULL,
                status            TEXT NOT NULL,
                cursor_ts         TIMESTAMPTZ NULL,
                cursor_id         TEXT NULL,
                cursor_page_token TEXT NULL,
                retry_count       INTEGER NOT NULL DEFAULT 0,
                last_error        TEXT NULL,
                last_attempt_at   TIMESTAMPTZ NULL,
                last_success_at   TIMESTAMPTZ NULL,
                meta              JSONB NOT NULL DEFAULT '{}'::jsonb,
                updated_at        TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (tenant_id, connector)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS connector_errors (
                id             UUID PRIMARY KEY,
                tenant_id      UUID NOT NULL,
                connector      TEXT NOT NULL,
                mode           TEXT NOT NULL,
                operation      TEXT NOT NULL,
                source_ref     TEXT NULL,
                error_kind     TEXT NOT NULL,
                dedupe_key     TEXT NOT NULL,
                attempt        INTEGER NOT NULL,
                status         TEXT NOT NULL,
                next_retry_at  TIMESTAMPTZ NOT NULL,
                error_message  TEXT NOT NULL,
                payload        JSONB NOT NULL,
                created_at     TIMESTAMPTZ NOT NULL,
                updated_at     TIMESTAMPTZ NOT NULL,
                resolved_at    TIMESTAMPTZ NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one active record per fingerprint; also the upsert conflict target.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS connector_errors_active_key_idx
              ON connector_errors (tenant_id, connector, dedupe_key)
              WHERE status IN ('pending', 'retrying');
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS connector_errors_due_idx
              ON connector_errors (tenant_id, status, next_retry_at, id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS connector_errors_updated_idx
              ON connector_errors (tenant_id, status, updated_at DESC, id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

const ERROR_COLUMNS: &str = "id, tenant_id, connector, mode, operation, source_ref, error_kind, \
     dedupe_key, attempt, status, next_retry_at, error_message, payload, created_at, updated_at, \
     resolved_at";

const REGISTER_ERROR: &str = r#"
    INSERT INTO connector_errors
        (id, tenant_id, connector, mode, operation, source_ref, error_kind, dedupe_key,
         attempt, status, next_retry_at, error_message, payload, created_at,
         updated_at, resolved_at)
    VALUES
        ($1, $2, $3, $4, $5, $6, $7, $8,
         1, 'pending', $9, $10, $11, $12,
         $12, NULL)
    ON CONFLICT (tenant_id, connector, dedupe_key) WHERE status IN ('pending', 'retrying')
    DO UPDATE SET
        attempt = connector_errors.attempt + 1,
        status = CASE
            WHEN connector_errors.attempt + 1 >= $13 THEN 'dead_letter'
            WHEN connector_errors.attempt + 1 > 1 THEN 'retrying'
            ELSE 'pending'
        END,
        next_retry_at = $12 + make_interval(secs => LEAST(
            $15::bigint,
            $14::bigint * (1::bigint << LEAST(GREATEST(connector_errors.attempt, 0), 10))
        )::double precision),
        mode = EXCLUDED.mode,
        operation = EXCLUDED.operation,
        source_ref = EXCLUDED.source_ref,
        error_kind = EXCLUDED.error_kind,
        error_message = EXCLUDED.error_message,
        payload = EXCLUDED.payload,
        updated_at = EXCLUDED.updated_at
    RETURNING id, attempt, status, next_retry_at
"#;

#[async_trait]
impl SyncStateStore for PgConnectorStore {
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
                   retry_count, last_error, last_attempt_at, last_success_at, meta, updated_at
              FROM connector_sync_state
             WHERE tenant_id = $1 AND connector = $2
            "#,
        )
        .bind(tenant.0)
        .bind(&connector)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get sync state", e))?;

        row.as_ref().map(sync_state_from_row).transpose()
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
                (tenant_id, connector, mode, status, retry_count, last_attempt_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (tenant_id, connector) DO UPDATE
              SET mode = EXCLUDED.mode,
                  status = EXCLUDED.status,
                  retry_count = EXCLUDED.retry_count,
                  last_attempt_at = EXCLUDED.last_attempt_at,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant.0)
        .bind(&connector)
        .bind(normalize_mode(Some(mode)))
        .bind(SyncStatus::Running.as_str())
        .bind(to_i32(running_retry_count(prior)))
        .bind(self.now())
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
        sqlx::query(
            r#"
            INSERT INTO connector_sync_state
                (tenant_id, connector, mode, status, cursor_ts, cursor_id, cursor_page_token,
                 retry_count, last_error, last_attempt_at, last_success_at, meta, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, 0, NULL, $8, $8, COALESCE($9, '{}'::jsonb), $8)
            ON CONFLICT (tenant_id, connector) DO UPDATE
              SET mode = EXCLUDED.mode,
                  status = EXCLUDED.status,
                  cursor_ts = EXCLUDED.cursor_ts,
                  cursor_id = EXCLUDED.cursor_id,
                  cursor_page_token = EXCLUDED.cursor_page_token,
                  retry_count = 0,
                  last_error = NULL,
                  last_attempt_at = EXCLUDED.last_attempt_at,
                  last_success_at = EXCLUDED.last_success_at,
                  meta = COALESCE($9, connector_sync_state.meta),
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant.0)
        .bind(&connector)
        .bind(normalize_mode(Some(mode)))
        .bind(SyncStatus::Ok.as_str())
        .bind(patch.cursor.timestamp)
        .bind(&patch.cursor.id)
        .bind(&patch.cursor.page_token)
        .bind(self.now())
        .bind(&patch.meta)
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
                (tenant_id, connector, mode, status, retry_count, last_error, last_attempt_at,
                 updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (tenant_id, connector) DO UPDATE
              SET mode = EXCLUDED.mode,
                  status = EXCLUDED.status,
                  retry_count = EXCLUDED.retry_count,
                  last_error = EXCLUDED.last_error,
                  last_attempt_at = EXCLUDED.last_attempt_at,
                  updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(tenant.0)
        .bind(&connector)
        .bind(normalize_mode(Some(mode)))
        .bind(SyncStatus::Failed.as_str())
        .bind(to_i32(failure_retry_count(prior)))
        .bind(truncate_last_error(error_message))
        .bind(self.now())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::backend("mark sync failure", e))?;
        Ok(())
    }
}

#[async_trait]
impl ErrorLedger for PgConnectorStore {
    #[tracing::instrument(level = "debug", skip(self, options))]
    async fn register_error(
        &self,
        tenant: TenantId,
        options: RegisterErrorOptions,
    ) -> Result<RegisteredError> {
        let n = NormalizedError::from_options(options)?;
        let now = self.now();
        let first_retry_at = self.cfg.backoff().next_retry_at(1, now);

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(REGISTER_ERROR)
            .bind(Uuid::new_v4())
            .bind(tenant.0)
            .bind(&n.connector)
            .bind(&n.mode)
            .bind(&n.operation)
            .bind(&n.source_ref)
            .bind(&n.error_kind)
            .bind(&n.dedupe_key)
            .bind(first_retry_at)
            .bind(&n.error_message)
            .bind(&n.payload)
            .bind(now)
            .bind(to_i32(self.cfg.max_attempts()))
            .bind(to_i64(self.cfg.retry_base_seconds()))
            .bind(to_i64(self.cfg.retry_cap_seconds()))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::from_write("register connector error", e))?;

        let mut registered = RegisteredError {
            id: row.try_get("id")?,
            attempt: to_u32(row.try_get::<i32, _>("attempt")?),
            status: parse_status(&row.try_get::<String, _>("status")?)?,
            next_retry_at: row.try_get("next_retry_at")?,
        };

        // Fresh inserts land as `pending` so the active-key index sees them.
        if registered.attempt >= self.cfg.max_attempts()
            && registered.status != ErrorStatus::DeadLetter
        {
            sqlx::query("UPDATE connector_errors SET status = $2 WHERE id = $1")
                .bind(registered.id)
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
        let res = sqlx::query(
            r#"
            UPDATE connector_errors
               SET status = 'resolved', resolved_at = $3, updated_at = $3
             WHERE tenant_id = $1 AND connector = $2 AND status IN ('pending', 'retrying')
            "#,
        )
        .bind(tenant.0)
        .bind(&connector)
        .bind(self.now())
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
             WHERE tenant_id = $1 AND status IN ('pending', 'retrying') AND next_retry_at <= $2
             ORDER BY next_retry_at ASC, id ASC
             LIMIT $3
            "#
        ))
        .bind(tenant.0)
        .bind(self.now())
        .bind(clamp_list_limit(limit) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list due connector errors", e))?;

        rows.iter().map(error_from_row).collect()
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
             WHERE tenant_id = $1 AND status = 'dead_letter'
             ORDER BY updated_at DESC, id ASC
             LIMIT $2
            "#
        ))
        .bind(tenant.0)
        .bind(clamp_list_limit(limit) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::backend("list dead letter errors", e))?;

        rows.iter().map(error_from_row).collect()
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
               SET status = 'pending', attempt = 0, next_retry_at = $3, updated_at = $3
             WHERE tenant_id = $1 AND id = $2 AND status = 'dead_letter'
            RETURNING {ERROR_COLUMNS}
            "#
        ))
        .bind(tenant.0)
        .bind(id)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::from_write("retry dead letter error", e))?;

        row.as_ref().map(error_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn resolve_by_id(&self, tenant: TenantId, id: Uuid) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            UPDATE connector_errors
               SET status = 'resolved', resolved_at = $3, updated_at = $3
             WHERE tenant_id = $1 AND id = $2
            RETURNING id
            "#,
        )
        .bind(tenant.0)
        .bind(id)
        .bind(self.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("resolve connector error", e))?;

        row.map(|r| r.try_get::<Uuid, _>("id").map_err(Error::from))
            .transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_error(&self, tenant: TenantId, id: Uuid) -> Result<Option<ConnectorErrorRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {ERROR_COLUMNS} FROM connector_errors WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant.0)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::backend("get connector error", e))?;

        row.as_ref().map(error_from_row).transpose()
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn summarize(&self, tenant: TenantId) -> Result<ErrorSummary> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
              FROM connector_errors
             WHERE tenant_id = $1
             GROUP BY status
            "#,
        )
        .bind(tenant.0)
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

fn sync_state_from_row(row: &PgRow) -> Result<ConnectorSyncState> {
    let status: String = row.try_get("status")?;
    Ok(ConnectorSyncState {
        tenant_id: TenantId(row.try_get("tenant_id")?),
        connector: row.try_get("connector")?,
        mode: row.try_get("mode")?,
        status: SyncStatus::parse_str(&status)
            .ok_or_else(|| Error::BackendMessage(format!("invalid sync status in db: {status}")))?,
        cursor: SyncCursor {
            timestamp: row.try_get("cursor_ts")?,
            id: row.try_get("cursor_id")?,
            page_token: row.try_get("cursor_page_token")?,
        },
        retry_count: to_u32(row.try_get::<i32, _>("retry_count")?),
        last_error: row.try_get("last_error")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        last_success_at: row.try_get("last_success_at")?,
        meta: row.try_get("meta")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn error_from_row(row: &PgRow) -> Result<ConnectorErrorRecord> {
    Ok(ConnectorErrorRecord {
        id: row.try_get("id")?,
        tenant_id: TenantId(row.try_get("tenant_id")?),
        connector: row.try_get("connector")?,
        mode: row.try_get("mode")?,
        operation: row.try_get("operation")?,
        source_ref: row.try_get("source_ref")?,
        error_kind: row.try_get("error_kind")?,
        dedupe_key: row.try_get("dedupe_key")?,
        attempt: to_u32(row.try_get::<i32, _>("attempt")?),
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        next_retry_at: row.try_get("next_retry_at")?,
        error_message: row.try_get("error_message")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn parse_status(s: &str) -> Result<ErrorStatus> {
    ErrorStatus::parse_str(s)
        .ok_or_else(|| Error::BackendMessage(format!("invalid error status in db: {s}")))
}

fn to_u32(v: i32) -> u32 {
    v.max(0) as u32
}

fn to_i32(v: u32) -> i32 {
    i32::try_from(v).unwrap_or(i32::MAX)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Tenant identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for TenantId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for TenantId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Outcome of the most recent sync attempt for a connector.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Ok,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Running => "running",
            SyncStatus::Ok => "ok",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(SyncStatus::Running),
            "ok" => Some(SyncStatus::Ok),
            "failed" => Some(SyncStatus::Failed),
            _ => None,
        }
    }
}

/// Opaque ingestion watermark. Only advanced on a confirmed successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Timestamp of the last ingested upstream record.
    pub timestamp: Option<DateTime<Utc>>,
    /// Upstream id of the last ingested record (tie-break for equal timestamps).
    pub id: Option<String>,
    /// Connector-defined pagination token.
    pub page_token: Option<String>,
}

impl SyncCursor {
    pub fn new(
        timestamp: Option<DateTime<Utc>>,
        id: Option<String>,
        page_token: Option<String>,
    ) -> Self {
        Self {
            timestamp,
            id,
            page_token,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.id.is_none() && self.page_token.is_none()
    }
}

/// One row per (tenant, connector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSyncState {
    pub tenant_id: TenantId,
    pub connector: String,
    pub mode: String,
    pub status: SyncStatus,
    pub cursor: SyncCursor,
    /// Consecutive failures of the sync run itself (not ledger attempts).
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub meta: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Values written by `mark_success`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSuccessPatch {
    /// Replaces the stored cursor wholesale.
    pub cursor: SyncCursor,
    /// Replaces the stored `meta` when set; otherwise the stored value is kept.
    pub meta: Option<serde_json::Value>,
}

impl SyncSuccessPatch {
    pub fn new(cursor: SyncCursor) -> Self {
        Self { cursor, meta: None }
    }

    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStatus {
    Pending,
    Retrying,
    DeadLetter,
    Resolved,
}

impl ErrorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorStatus::Pending => "pending",
            ErrorStatus::Retrying => "retrying",
            ErrorStatus::DeadLetter => "dead_letter",
            ErrorStatus::Resolved => "resolved",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ErrorStatus::Pending),
            "retrying" => Some(ErrorStatus::Retrying),
            "dead_letter" => Some(ErrorStatus::DeadLetter),
            "resolved" => Some(ErrorStatus::Resolved),
            _ => None,
        }
    }

    /// Active records are the ones the retry scheduler still works on.
    pub fn is_active(&self) -> bool {
        matches!(self, ErrorStatus::Pending | ErrorStatus::Retrying)
    }
}

/// One row per deduplicated connector failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorErrorRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub connector: String,
    pub mode: String,
    pub operation: String,
    pub source_ref: Option<String>,
    pub error_kind: String,
    pub dedupe_key: String,
    pub attempt: u32,
    pub status: ErrorStatus,
    pub next_retry_at: DateTime<Utc>,
    pub error_message: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input to `register_error`. Only `connector` is required; everything else is
/// defaulted or normalized by the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegisterErrorOptions {
    pub connector: String,
    pub mode: Option<String>,
    pub operation: Option<String>,
    pub source_ref: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: String,
    pub payload: Option<serde_json::Value>,
    /// Precomputed fingerprint. When blank, one is derived from the other fields.
    pub dedupe_key: Option<String>,
}

impl RegisterErrorOptions {
    pub fn new(connector: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            connector: connector.into(),
            error_message: error_message.into(),
            ..Self::default()
        }
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    pub fn error_kind(mut self, error_kind: impl Into<String>) -> Self {
        self.error_kind = Some(error_kind.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn dedupe_key(mut self, dedupe_key: impl Into<String>) -> Self {
        self.dedupe_key = Some(dedupe_key.into());
        self
    }
}

/// Result of `register_error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredError {
    pub id: Uuid,
    pub attempt: u32,
    pub status: ErrorStatus,
    pub next_retry_at: DateTime<Utc>,
}

/// Per-status record counts for one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub pending: u64,
    pub retrying: u64,
    pub dead_letter: u64,
    pub resolved: u64,
}

impl ErrorSummary {
    pub(crate) fn add(&mut self, status: ErrorStatus, count: u64) {
        match status {
            ErrorStatus::Pending => self.pending += count,
            ErrorStatus::Retrying => self.retrying += count,
            ErrorStatus::DeadLetter => self.dead_letter += count,
            ErrorStatus::Resolved => self.resolved += count,
        }
    }

    /// Records that still need either the scheduler or an operator.
    pub fn open(&self) -> u64 {
        self.pending + self.retrying + self.dead_letter
    }
}

//! Rules for the per-connector sync state row.
//!
//! The new row is always derived from the caller-supplied prior state, never from
//! a read at write time, so each mark is one upsert.

use crate::ledger::truncate_chars;
use crate::models::{ConnectorSyncState, SyncCursor};

pub const RETRY_COUNT_CEILING: u32 = 1_000;
pub const MAX_LAST_ERROR_CHARS: usize = 2_000;

/// Retry count carried into a `running` row.
pub fn running_retry_count(prior: Option<&ConnectorSyncState>) -> u32 {
    prior
        .map(|p| p.retry_count.min(RETRY_COUNT_CEILING))
        .unwrap_or(0)
}

/// Retry count written by a failed run.
pub fn failure_retry_count(prior: Option<&ConnectorSyncState>) -> u32 {
    running_retry_count(prior) + 1
}

pub fn truncate_last_error(message: &str) -> String {
    truncate_chars(message, MAX_LAST_ERROR_CHARS)
}

/// True when `next` carries an older timestamp than `prior`.
///
/// Only timestamp-to-timestamp moves count; a cursor that advances by `id` or
/// `page_token` alone is not a regression. Monotonicity is not enforced, this
/// only lets callers surface it.
pub fn cursor_regressed(prior: &SyncCursor, next: &SyncCursor) -> bool {
    match (prior.timestamp, next.timestamp) {
        (Some(prev), Some(next)) => next < prev,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncStatus, TenantId};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn state(retry_count: u32) -> ConnectorSyncState {
        ConnectorSyncState {
            tenant_id: TenantId(Uuid::new_v4()),
            connector: "chatwoot".to_string(),
            mode: "http".to_string(),
            status: SyncStatus::Failed,
            cursor: SyncCursor::default(),
            retry_count,
            last_error: Some("boom".to_string()),
            last_attempt_at: None,
            last_success_at: None,
            meta: serde_json::json!({}),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn running_preserves_and_clamps_prior_count() {
        assert_eq!(running_retry_count(None), 0);
        assert_eq!(running_retry_count(Some(&state(3))), 3);
        assert_eq!(running_retry_count(Some(&state(5_000))), RETRY_COUNT_CEILING);
    }

    #[test]
    fn failure_increments_prior_count() {
        assert_eq!(failure_retry_count(None), 1);
        assert_eq!(failure_retry_count(Some(&state(2))), 3);
    }

    #[test]
    fn last_error_is_truncated() {
        let msg = "e".repeat(MAX_LAST_ERROR_CHARS + 50);
        assert_eq!(truncate_last_error(&msg).chars().count(), MAX_LAST_ERROR_CHARS);
    }

    #[test]
    fn cursor_regression_is_detected_on_timestamps() {
        let now = Utc::now();
        let prior = SyncCursor::new(Some(now), Some("42".into()), None);
        let older = SyncCursor::new(Some(now - Duration::minutes(5)), None, None);
        let newer = SyncCursor::new(Some(now + Duration::minutes(5)), None, None);
        assert!(cursor_regressed(&prior, &older));
        assert!(!cursor_regressed(&prior, &newer));
        assert!(!cursor_regressed(&SyncCursor::default(), &older));
    }

    #[test]
    fn id_or_page_token_only_cursor_is_not_a_regression() {
        let prior = SyncCursor::new(Some(Utc::now()), Some("42".into()), None);
        let by_id = SyncCursor::new(None, Some("43".into()), None);
        let by_page = SyncCursor::new(None, None, Some("page-2".into()));
        assert!(!cursor_regressed(&prior, &by_id));
        assert!(!cursor_regressed(&prior, &by_page));
        assert!(!cursor_regressed(&prior, &SyncCursor::default()));
    }
}

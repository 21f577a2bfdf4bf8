//! Transition rules of the error-recovery ledger.
//!
//! Every backend (memory, SQLite, Postgres) applies the same rules:
//! - inputs are normalized and truncated, never rejected for length
//! - a fingerprint has at most one active (`pending`/`retrying`) record
//! - each recurrence bumps `attempt` and pushes `next_retry_at` out by the backoff
//! - reaching `max_attempts` dead-letters the record

use crate::dedupe::dedupe_key;
use crate::models::{ErrorStatus, RegisterErrorOptions};
use crate::{Error, Result};

pub const DEFAULT_MODE: &str = "http";
pub const DEFAULT_OPERATION: &str = "sync";
pub const DEFAULT_ERROR_KIND: &str = "connector_error";

pub const MAX_OPERATION_CHARS: usize = 200;
pub const MAX_SOURCE_REF_CHARS: usize = 500;
pub const MAX_ERROR_KIND_CHARS: usize = 200;
pub const MAX_ERROR_MESSAGE_CHARS: usize = 4_000;
pub const MAX_DEDUPE_KEY_CHARS: usize = 200;

pub const MIN_LIST_LIMIT: usize = 1;
pub const MAX_LIST_LIMIT: usize = 500;
pub const DEFAULT_DUE_LIMIT: usize = 20;
pub const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;

/// Status stored for a record that has now been seen `attempt` times.
pub fn status_for_attempt(attempt: u32, max_attempts: u32) -> ErrorStatus {
    if attempt >= max_attempts {
        ErrorStatus::DeadLetter
    } else if attempt > 1 {
        ErrorStatus::Retrying
    } else {
        ErrorStatus::Pending
    }
}

pub fn clamp_list_limit(limit: usize) -> usize {
    limit.clamp(MIN_LIST_LIMIT, MAX_LIST_LIMIT)
}

/// Keep at most `max` characters (not bytes).
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Lower-cased, trimmed connector name.
pub(crate) fn normalize_connector(connector: &str) -> Result<String> {
    let connector = connector.trim().to_lowercase();
    if connector.is_empty() {
        return Err(Error::InvalidInput("connector is empty".to_string()));
    }
    Ok(connector)
}

pub(crate) fn normalize_mode(mode: Option<&str>) -> String {
    mode.map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_lowercase)
        .unwrap_or_else(|| DEFAULT_MODE.to_string())
}

fn trimmed_or(value: Option<&str>, default: &str, max: usize) -> String {
    let value = value.map(str::trim).filter(|v| !v.is_empty()).unwrap_or(default);
    truncate_chars(value, max)
}

/// `RegisterErrorOptions` after defaults, trimming and fingerprinting.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedError {
    pub connector: String,
    pub mode: String,
    pub operation: String,
    pub source_ref: Option<String>,
    pub error_kind: String,
    pub error_message: String,
    pub payload: serde_json::Value,
    pub dedupe_key: String,
}

impl NormalizedError {
    #[tracing::instrument(level = "debug", skip(options), fields(connector = %options.connector))]
    pub fn from_options(options: RegisterErrorOptions) -> Result<Self> {
        let connector = normalize_connector(&options.connector)?;
        let mode = normalize_mode(options.mode.as_deref());
        let operation = trimmed_or(
            options.operation.as_deref(),
            DEFAULT_OPERATION,
            MAX_OPERATION_CHARS,
        );
        let source_ref = options
            .source_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| truncate_chars(s, MAX_SOURCE_REF_CHARS));
        let error_kind = trimmed_or(
            options.error_kind.as_deref(),
            DEFAULT_ERROR_KIND,
            MAX_ERROR_KIND_CHARS,
        );
        let error_message = truncate_chars(options.error_message.trim(), MAX_ERROR_MESSAGE_CHARS);

        let dedupe_key = match options
            .dedupe_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
        {
            Some(key) => truncate_chars(key, MAX_DEDUPE_KEY_CHARS),
            None => dedupe_key(
                &connector,
                &mode,
                &operation,
                source_ref.as_deref(),
                Some(&error_kind),
            ),
        };

        Ok(Self {
            connector,
            mode,
            operation,
            source_ref,
            error_kind,
            error_message,
            payload: options.payload.unwrap_or_else(|| serde_json::json!({})),
            dedupe_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedupe::DEDUPE_KEY_LEN;

    #[test]
    fn status_follows_attempt_count() {
        assert_eq!(status_for_attempt(1, 5), ErrorStatus::Pending);
        assert_eq!(status_for_attempt(2, 5), ErrorStatus::Retrying);
        assert_eq!(status_for_attempt(4, 5), ErrorStatus::Retrying);
        assert_eq!(status_for_attempt(5, 5), ErrorStatus::DeadLetter);
        assert_eq!(status_for_attempt(9, 5), ErrorStatus::DeadLetter);
        // A one-shot budget dead-letters the first occurrence.
        assert_eq!(status_for_attempt(1, 1), ErrorStatus::DeadLetter);
    }

    #[test]
    fn list_limit_is_clamped() {
        assert_eq!(clamp_list_limit(0), 1);
        assert_eq!(clamp_list_limit(20), 20);
        assert_eq!(clamp_list_limit(10_000), 500);
    }

    #[test]
    fn truncate_counts_characters() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn defaults_are_applied() {
        let n = NormalizedError::from_options(RegisterErrorOptions::new(" Chatwoot ", " boom "))
            .unwrap();
        assert_eq!(n.connector, "chatwoot");
        assert_eq!(n.mode, "http");
        assert_eq!(n.operation, "sync");
        assert_eq!(n.error_kind, "connector_error");
        assert_eq!(n.error_message, "boom");
        assert_eq!(n.source_ref, None);
        assert_eq!(n.payload, serde_json::json!({}));
        assert_eq!(n.dedupe_key.len(), DEDUPE_KEY_LEN);
    }

    #[test]
    fn long_fields_are_truncated_not_rejected() {
        let opts = RegisterErrorOptions::new("linear", "x".repeat(5_000))
            .operation("o".repeat(300))
            .source_ref("s".repeat(600))
            .error_kind("k".repeat(250));
        let n = NormalizedError::from_options(opts).unwrap();
        assert_eq!(n.operation.chars().count(), MAX_OPERATION_CHARS);
        assert_eq!(n.source_ref.unwrap().chars().count(), MAX_SOURCE_REF_CHARS);
        assert_eq!(n.error_kind.chars().count(), MAX_ERROR_KIND_CHARS);
        assert_eq!(n.error_message.chars().count(), MAX_ERROR_MESSAGE_CHARS);
    }

    #[test]
    fn blank_connector_is_rejected() {
        let err = NormalizedError::from_options(RegisterErrorOptions::new("  ", "boom"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn explicit_dedupe_key_wins_over_computed_one() {
        let n = NormalizedError::from_options(
            RegisterErrorOptions::new("attio", "boom").dedupe_key("  custom-key "),
        )
        .unwrap();
        assert_eq!(n.dedupe_key, "custom-key");

        let blank = NormalizedError::from_options(
            RegisterErrorOptions::new("attio", "boom").dedupe_key("   "),
        )
        .unwrap();
        assert_eq!(blank.dedupe_key.len(), DEDUPE_KEY_LEN);
    }

    #[test]
    fn message_does_not_affect_fingerprint() {
        let a = NormalizedError::from_options(RegisterErrorOptions::new("attio", "first")).unwrap();
        let b = NormalizedError::from_options(RegisterErrorOptions::new("attio", "second")).unwrap();
        assert_eq!(a.dedupe_key, b.dedupe_key);
    }
}

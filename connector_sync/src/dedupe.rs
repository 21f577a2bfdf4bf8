//! Deterministic fingerprints for connector failures.

use sha2::{Digest, Sha256};

/// Length of a dedupe key in hex characters (160 bits).
pub const DEDUPE_KEY_LEN: usize = 40;

/// Fingerprint one failure occurrence.
///
/// `connector` and `mode` are lower-cased; `operation`, `source_ref` and
/// `error_kind` are hashed as given. Absent parts hash as empty strings.
pub fn dedupe_key(
    connector: &str,
    mode: &str,
    operation: &str,
    source_ref: Option<&str>,
    error_kind: Option<&str>,
) -> String {
    let material = format!(
        "{}:{}:{}:{}:{}",
        connector.to_lowercase(),
        mode.to_lowercase(),
        operation,
        source_ref.unwrap_or_default(),
        error_kind.unwrap_or_default(),
    );
    let digest = Sha256::digest(material.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(DEDUPE_KEY_LEN);
    key
}

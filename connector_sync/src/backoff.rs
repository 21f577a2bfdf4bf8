//! Exponential retry delay for ledger entries.

use chrono::{DateTime, Duration, Utc};

pub const DEFAULT_BASE_SECONDS: u64 = 30;
/// Six hours.
pub const DEFAULT_CAP_SECONDS: u64 = 21_600;
/// Largest exponent applied to the base delay.
pub const MAX_POWER: u32 = 10;
/// Upper bound accepted by `chrono::Duration::seconds`.
const MAX_DELAY_SECONDS: i64 = i64::MAX / 1_000;

/// Delay before retrying an entry that has been seen `attempt` times.
///
/// `base * 2^clamp(attempt - 1, 0, 10)`, capped at `cap`.
pub fn next_backoff_seconds(attempt: u32, base: u64, cap: u64) -> u64 {
    let power = attempt.saturating_sub(1).min(MAX_POWER);
    base.saturating_mul(1u64 << power).min(cap)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_seconds: u64,
    pub cap_seconds: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_seconds: DEFAULT_BASE_SECONDS,
            cap_seconds: DEFAULT_CAP_SECONDS,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_seconds: u64, cap_seconds: u64) -> Self {
        Self {
            base_seconds,
            cap_seconds,
        }
    }

    pub fn delay_seconds(&self, attempt: u32) -> u64 {
        next_backoff_seconds(attempt, self.base_seconds, self.cap_seconds)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = i64::try_from(self.delay_seconds(attempt)).unwrap_or(i64::MAX);
        Duration::seconds(secs.min(MAX_DELAY_SECONDS))
    }

    /// Saturates at `DateTime::<Utc>::MAX_UTC` rather than overflowing.
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.delay_for(attempt))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

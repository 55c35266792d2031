//! Retry budget helpers for model generation.

use std::time::Duration;

/// Upper bound for a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (1-indexed): `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(MAX_BACKOFF)
}

//! Capped exponential backoff shared by the transport and the offline queue.

use std::time::Duration;

/// `base × 2^attempt`, clamped to `max`. Attempt 0 yields `base`.
pub fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

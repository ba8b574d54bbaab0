//! Retry delays with jitter.

use std::time::Duration;
use rand::Rng;

/// Jitter added on top of a delay, as a fraction of it (1/10).
const JITTER_DIVISOR: u64 = 10;

fn jitter(delay_ms: u64) -> u64 {
    let jitter_range = delay_ms / JITTER_DIVISOR;
    if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    }
}

/// Fixed retry interval plus up to 10% jitter.
pub fn retry_delay(interval: Duration) -> Duration {
    let base_ms = interval.as_millis() as u64;
    Duration::from_millis(base_ms + jitter(base_ms))
}

/// Exponential backoff delay with jitter, capped at `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    Duration::from_millis(capped_delay + jitter(capped_delay))
}

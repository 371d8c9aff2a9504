//! Retry delay and idle backoff arithmetic

use rand::Rng;
use std::time::Duration;

/// Upper bound for a single requeue delay
pub const MAX_REQUEUE_DELAY: Duration = Duration::from_millis(60_000);
/// Doubling stops after this many retries
pub const MAX_BACKOFF_EXPONENT: u32 = 6;
/// Upper bound (inclusive) of the random jitter added to requeue delays
pub const MAX_JITTER_MS: u64 = 100;

/// Idle backoff growth per recorded failure
pub const IDLE_BACKOFF_STEP_MS: u64 = 100;
pub const IDLE_BACKOFF_MAX_MS: u64 = 10_000;

/// Delay before attempt `attempt` (1-indexed) becomes visible again
///
/// `min(60s, base * 2^min(6, attempt - 1) + jitter)`
pub fn requeue_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let scaled_ms = base_ms.saturating_mul(1u64 << exponent);
    let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);

    Duration::from_millis(scaled_ms.saturating_add(jitter_ms)).min(MAX_REQUEUE_DELAY)
}

/// Random jitter in `0..=MAX_JITTER_MS`
pub fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
}

/// Idle backoff after a recorded failure
pub fn grow_idle_backoff(current_ms: u64) -> u64 {
    current_ms
        .saturating_add(IDLE_BACKOFF_STEP_MS)
        .min(IDLE_BACKOFF_MAX_MS)
}

/// Idle backoff after an empty poll (x0.9)
pub fn decay_on_idle(current_ms: u64) -> u64 {
    current_ms * 9 / 10
}

/// Idle backoff after a successful message (x0.7)
pub fn decay_on_success(current_ms: u64) -> u64 {
    current_ms * 7 / 10
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(2000);

    #[test]
    fn test_first_attempts_double() {
        assert_eq!(requeue_delay(BASE, 1, Duration::ZERO), Duration::from_millis(2000));
        assert_eq!(requeue_delay(BASE, 2, Duration::ZERO), Duration::from_millis(4000));
        assert_eq!(requeue_delay(BASE, 3, Duration::ZERO), Duration::from_millis(8000));
        assert_eq!(requeue_delay(BASE, 5, Duration::from_millis(40)), Duration::from_millis(32_040));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        assert_eq!(requeue_delay(BASE, 0, Duration::ZERO), BASE);
    }

    #[test]
    fn test_delay_capped() {
        assert_eq!(requeue_delay(BASE, 7, Duration::ZERO), MAX_REQUEUE_DELAY);
        assert_eq!(requeue_delay(BASE, 100, Duration::from_millis(100)), MAX_REQUEUE_DELAY);
        assert_eq!(
            requeue_delay(Duration::from_secs(u64::MAX), 3, Duration::ZERO),
            MAX_REQUEUE_DELAY
        );
    }

    #[test]
    fn test_delay_monotonic_and_bounded() {
        for base_ms in [0u64, 1, 250, 2000, 9_999, 60_000] {
            let base = Duration::from_millis(base_ms);
            for jitter_ms in [0u64, 50, MAX_JITTER_MS] {
                let jitter = Duration::from_millis(jitter_ms);
                let mut previous = Duration::ZERO;
                for attempt in 1..=20 {
                    let delay = requeue_delay(base, attempt, jitter);
                    assert!(delay >= previous, "attempt {attempt} base {base_ms}");
                    assert!(delay <= MAX_REQUEUE_DELAY);
                    previous = delay;
                }
            }
        }
    }

    #[test]
    fn test_jitter_range() {
        for _ in 0..1000 {
            assert!(jitter() <= Duration::from_millis(MAX_JITTER_MS));
        }
    }

    #[test]
    fn test_idle_backoff_growth_and_decay() {
        assert_eq!(grow_idle_backoff(0), 100);
        assert_eq!(grow_idle_backoff(9_950), IDLE_BACKOFF_MAX_MS);
        assert_eq!(decay_on_idle(1000), 900);
        assert_eq!(decay_on_idle(5), 4);
        assert_eq!(decay_on_success(1000), 700);
        assert_eq!(decay_on_success(1), 0);
    }
}

/// Retry/backoff policy: pure functions mapping attempt counts to delays.
///
/// Two variants are used across the queue kinds:
///   - `quadratic_backoff`: unbounded retries for the embedding kinds.
///   - `exponential_backoff`: bounded retries (document parsing, object extraction).

use std::time::Duration;

/// Quadratic, unbounded backoff: `delay = clamp(base * attempt^2, base, max)`.
///
/// `attempt` is the number of attempts made so far (1 = failed on the first
/// try). The floor at `base` is load-bearing: `attempt=0` would otherwise
/// compute a zero delay before any clamping.
pub fn quadratic_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let attempt = attempt.max(1) as u64;
    let computed = base.saturating_mul((attempt * attempt) as u32);
    computed.max(base).min(max)
}

/// Exponential, bounded backoff: `delay = min(base * multiplier^retry_count, max)`.
pub fn exponential_backoff(retry_count: u32, base: Duration, multiplier: u32, max: Duration) -> Duration {
    let factor = multiplier.max(1).saturating_pow(retry_count);
    let computed = base.saturating_mul(factor);
    computed.max(base).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quadratic_floors_at_base_for_attempt_zero_or_one() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        assert_eq!(quadratic_backoff(0, base, max), base);
        assert_eq!(quadratic_backoff(1, base, max), base);
    }

    #[test]
    fn quadratic_grows_with_attempt_squared() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        assert_eq!(quadratic_backoff(2, base, max), Duration::from_secs(240));
        assert_eq!(quadratic_backoff(3, base, max), Duration::from_secs(540));
    }

    #[test]
    fn quadratic_saturates_at_max() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        assert_eq!(quadratic_backoff(100, base, max), max);
    }

    #[test]
    fn exponential_matches_scenario_s2() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(exponential_backoff(0, base, 2, max), Duration::from_millis(100));
        assert_eq!(exponential_backoff(1, base, 2, max), Duration::from_millis(200));
        assert_eq!(exponential_backoff(2, base, 2, max), Duration::from_millis(400));
    }

    #[test]
    fn exponential_saturates_at_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(10);
        assert_eq!(exponential_backoff(20, base, 3, max), max);
    }
}

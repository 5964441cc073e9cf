//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

/// Calculate the delay before retry number `attempt` (1-based).
///
/// The jitter (0 to 10% of the exponential term) is added before the cap, so
/// for a fixed `base`/`max` the sequence of delays never decreases.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(delay_ms.saturating_add(jitter).min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);

        let b1 = calculate_backoff(1, base, Duration::from_millis(2000));
        assert!(b1.as_millis() >= 100 && b1.as_millis() < 110);

        let b2 = calculate_backoff(2, base, Duration::from_millis(2000));
        assert!(b2.as_millis() >= 200);

        let max = calculate_backoff(10, base, Duration::from_millis(1000));
        assert_eq!(max.as_millis(), 1000);
    }

    #[test]
    fn zeroth_attempt_has_no_delay() {
        assert_eq!(
            calculate_backoff(0, Duration::from_secs(1), Duration::from_secs(5)),
            Duration::ZERO
        );
    }

    #[test]
    fn delays_never_decrease() {
        let base = Duration::from_millis(50);
        let cap = Duration::from_millis(700);
        for _ in 0..200 {
            let delays: Vec<_> = (1..=12).map(|n| calculate_backoff(n, base, cap)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
            assert_eq!(*delays.last().unwrap(), cap);
        }
    }

    #[test]
    fn huge_attempt_counts_saturate_at_cap() {
        let delay = calculate_backoff(200, Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(delay, Duration::from_secs(30));
    }
}

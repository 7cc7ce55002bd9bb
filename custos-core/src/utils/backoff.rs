//! Retry delay arithmetic for outbound calls (messaging platform, explorer).

use rand::Rng;
use std::time::Duration;

/// Cap for the exponent: 2^6 = 64 seconds max between attempts.
pub const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Exponential backoff: 2^attempt seconds, capped.
pub fn retry_delay(attempt: u32) -> Duration {
    let seconds = 2u64.pow(attempt.min(MAX_BACKOFF_EXPONENT));
    Duration::from_secs(seconds)
}

/// Add up to 250ms of random jitter so concurrent retries spread out.
pub fn jittered(base: Duration) -> Duration {
    base + Duration::from_millis(rand::rng().random_range(0..250))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_secs(1));
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        assert_eq!(retry_delay(6), Duration::from_secs(64));
        assert_eq!(retry_delay(7), Duration::from_secs(64));
        assert_eq!(retry_delay(100), Duration::from_secs(64));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let base = Duration::from_secs(2);
        for _ in 0..32 {
            let d = jittered(base);
            assert!(d >= base);
            assert!(d < base + Duration::from_millis(250));
        }
    }
}

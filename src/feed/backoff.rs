use rand::Rng;
use std::time::Duration;

/// Exponential reconnect backoff with jitter
///
/// `delay = min(max, min * 2^attempts) + jitter` where jitter is uniform in
/// `[0, jitter]`. Callers reset `attempts` to 0 after a successful open.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    min_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
}

impl ReconnectBackoff {
    pub fn new(min_delay: Duration, max_delay: Duration, jitter: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
            jitter,
        }
    }

    /// Capped exponential part, without jitter
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.min_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        self.base_delay(attempts) + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ReconnectBackoff {
        ReconnectBackoff::new(
            Duration::from_millis(500),
            Duration::from_secs(30),
            Duration::from_millis(250),
        )
    }

    #[test]
    fn test_base_delay_doubles() {
        let b = backoff();
        assert_eq!(b.base_delay(0), Duration::from_millis(500));
        assert_eq!(b.base_delay(1), Duration::from_millis(1000));
        assert_eq!(b.base_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_base_delay_non_decreasing_until_cap() {
        let b = backoff();
        let mut previous = Duration::ZERO;
        for attempts in 0..64 {
            let d = b.base_delay(attempts);
            assert!(d >= previous, "attempt {} shrank: {:?} < {:?}", attempts, d, previous);
            assert!(d <= Duration::from_secs(30));
            previous = d;
        }
        assert_eq!(b.base_delay(63), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_bounds() {
        let b = backoff();
        for _ in 0..100 {
            let d = b.delay(2);
            assert!(d >= Duration::from_millis(2000));
            assert!(d <= Duration::from_millis(2250));
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let b = ReconnectBackoff::new(Duration::from_secs(1), Duration::from_secs(8), Duration::ZERO);
        assert_eq!(b.delay(10), Duration::from_secs(8));
    }
}

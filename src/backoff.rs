//! Retry policy with exponential delay and jitter, used for transient
//! network failures (sitemap and robots.txt fetches).

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    base: Duration,
    cap: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            attempts,
            base,
            cap,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (0-based): base * 2^attempt,
    /// capped, plus up to 10% jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = exp.min(self.cap);
        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let jitter_ms = capped.as_millis() as u64 / 10;
        if jitter_ms == 0 {
            return capped;
        }
        capped + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let policy =
            RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(10))
                .without_jitter();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_cap() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(500))
            .without_jitter();
        assert_eq!(policy.delay(10), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000), Duration::from_secs(10));
        for attempt in 0..3 {
            let base = Duration::from_millis(1000 * (1 << attempt));
            let delay = policy.delay(attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 10);
        }
    }
}

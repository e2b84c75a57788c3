use chrono::Duration;
use rand::Rng;

/// Exponential backoff for retried tasks: `base * 2^(attempts - 1)` capped,
/// plus up to 10% jitter so retry waves do not line up.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    /// Delay before the next attempt, given how many attempts have been
    /// made so far.
    pub fn delay(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(32);
        let raw = self.base_ms.saturating_mul(1u64 << exponent);
        let capped = raw.min(self.cap_ms);
        let jitter = if capped == 0 {
            0
        } else {
            rand::rng().random_range(0..=capped / 10)
        };
        Duration::milliseconds((capped + jitter) as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_attempt_until_the_cap() {
        let policy = BackoffPolicy::new(1_000, 8_000);
        let within = |attempts: u32, base: i64| {
            let d = policy.delay(attempts).num_milliseconds();
            assert!(d >= base && d <= base + base / 10, "attempt {attempts}: {d}");
        };
        within(1, 1_000);
        within(2, 2_000);
        within(3, 4_000);
        within(4, 8_000);
        within(10, 8_000);
    }
}

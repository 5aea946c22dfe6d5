use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect delay with multiplicative jitter.
///
/// `attempt` is zero-based: the first failure of a streak waits `delay(0)`,
/// roughly `base`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter_ratio: f64,
    max_consecutive_failures: Option<u32>,
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            max_ms: config.max_delay_ms.max(config.base_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
            max_consecutive_failures: config.max_consecutive_failures,
        }
    }

    /// `min(base * 2^attempt, max)` before jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let scaled = self.base_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(scaled.min(self.max_ms))
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        self.delay_with_factor(attempt, factor)
    }

    pub fn delay_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        self.nominal(attempt).mul_f64(factor.max(0.0))
    }

    /// True once `failures` consecutive failures reach the configured ceiling.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_consecutive_failures
            .map_or(false, |ceiling| failures >= ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, max: u64) -> BackoffPolicy {
        BackoffPolicy::from_config(&BackoffConfig {
            base_delay_ms: base,
            max_delay_ms: max,
            jitter_ratio: 0.2,
            max_consecutive_failures: None,
        })
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let policy = policy(100, 5_000);
        for attempt in 0..10u32 {
            let nominal = (100u64 << attempt).min(5_000) as f64;
            for _ in 0..200 {
                let wait = policy.delay(attempt).as_secs_f64() * 1_000.0;
                assert!(wait >= nominal * 0.8 - 1e-3, "attempt {} wait {}", attempt, wait);
                assert!(wait <= nominal * 1.2 + 1e-3, "attempt {} wait {}", attempt, wait);
            }
        }
    }

    #[test]
    fn nominal_is_monotonic_until_capped() {
        let policy = policy(250, 30_000);
        let waits: Vec<Duration> = (0..12).map(|a| policy.nominal(a)).collect();
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(waits[0], Duration::from_millis(250));
        assert_eq!(waits[3], Duration::from_millis(2_000));
        assert_eq!(waits[11], Duration::from_millis(30_000));
    }

    #[test]
    fn huge_attempts_saturate_at_max() {
        let policy = policy(1_000, 30_000);
        assert_eq!(policy.nominal(u32::MAX), Duration::from_millis(30_000));
        assert_eq!(policy.delay_with_factor(200, 1.0), Duration::from_millis(30_000));
        assert_eq!(policy.delay_with_factor(0, 0.5), Duration::from_millis(500));
    }

    #[test]
    fn ceiling_is_optional() {
        assert!(!policy(1, 2).is_exhausted(u32::MAX));

        let capped = BackoffPolicy::from_config(&BackoffConfig {
            max_consecutive_failures: Some(3),
            ..BackoffConfig::default()
        });
        assert!(!capped.is_exhausted(2));
        assert!(capped.is_exhausted(3));
    }
}

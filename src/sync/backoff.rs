//! Backoff policy for the periodic sync lane
//!
//! After a pass that reported failures the next periodic attempt is pushed
//! out exponentially; a clean pass resets it to the base interval.

use rand::Rng;
use std::time::Duration;

use crate::config::SchedulerSettings;

/// Exponential backoff over the periodic interval
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    base: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    pub fn new(base: Duration, multiplier: f64, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            max_delay: max_delay.max(base),
            jitter,
        }
    }

    /// Policy for the configured periodic lane
    pub fn from_settings(settings: &SchedulerSettings) -> Self {
        Self::new(
            Duration::from_secs(settings.periodic_interval_secs),
            settings.backoff.multiplier,
            Duration::from_secs(settings.backoff.max_delay_secs),
            settings.backoff.jitter,
        )
    }

    /// Delay with no failures behind it
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay before the next periodic attempt
    ///
    /// Uses exponential backoff: base * multiplier^failures, capped at
    /// max_delay, with optional jitter that never goes below the base.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return self.base;
        }

        let exponent = i32::try_from(consecutive_failures).unwrap_or(i32::MAX);
        let raw = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter {
            // 50-100% of the computed delay, floored at the base interval
            let factor = rand::thread_rng().gen_range(0.5..1.0);
            (capped * factor).max(self.base.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(900),
            2.0,
            Duration::from_secs(6 * 3600),
            jitter,
        )
    }

    // Test 1: No failures uses the base interval
    #[test]
    fn test_base_delay() {
        assert_eq!(policy(false).delay_for(0), Duration::from_secs(900));
    }

    // Test 2: Delay grows exponentially
    #[test]
    fn test_exponential_growth() {
        let policy = policy(false);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1800));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(3), Duration::from_secs(7200));
    }

    // Test 3: Delay is capped
    #[test]
    fn test_cap() {
        let policy = policy(false);
        assert_eq!(policy.delay_for(5), Duration::from_secs(6 * 3600));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(6 * 3600));
    }

    // Test 4: Jitter stays between base and the computed delay
    #[test]
    fn test_jitter_bounds() {
        let policy = policy(true);
        for _ in 0..100 {
            let delay = policy.delay_for(3);
            assert!(delay >= Duration::from_secs(900));
            assert!(delay <= Duration::from_secs(7200));
        }
    }

    // Test 5: Built from scheduler settings
    #[test]
    fn test_from_settings() {
        let settings = SchedulerSettings {
            periodic_interval_secs: 1200,
            backoff: BackoffConfig {
                multiplier: 3.0,
                max_delay_secs: 3600,
                jitter: false,
            },
            ..SchedulerSettings::default()
        };

        let policy = BackoffPolicy::from_settings(&settings);
        assert_eq!(policy.base(), Duration::from_secs(1200));
        assert_eq!(policy.delay_for(1), Duration::from_secs(3600));
        assert_eq!(policy.delay_for(2), Duration::from_secs(3600));
    }

    // Test 6: Multipliers below one are clamped
    #[test]
    fn test_multiplier_clamped() {
        let policy = BackoffPolicy::new(
            Duration::from_secs(10),
            0.5,
            Duration::from_secs(100),
            false,
        );
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
    }
}

//! Adaptive backoff for contended producers: spin → yield → park.
//!
//! Park durations grow exponentially and are jittered so that producers
//! which lost the same race do not all wake and retry at once.

use std::hint;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Per-call backoff state. Cheap to create; lives on the producer's stack.
pub struct Backoff {
    config: BackoffConfig,
    step: u32,
    park: Duration,
}

impl Backoff {
    #[inline(always)]
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            park: config.park_base,
            config,
            step: 0,
        }
    }

    /// Waits once, escalating with each call.
    #[inline]
    pub fn snooze(&mut self) {
        let spin_limit = self.config.spin_limit;
        let yield_limit = spin_limit.saturating_add(self.config.yield_limit);

        if self.step < spin_limit {
            // Spin 2^n times, capped so one snooze stays short
            for _ in 0..(1u32 << self.step.min(6)) {
                hint::spin_loop();
            }
        } else if self.step < yield_limit {
            thread::yield_now();
        } else {
            // Full jitter: uniform in [park/2, park]
            let upper = self.park.as_nanos().min(u64::MAX as u128) as u64;
            let nanos = rand::thread_rng().gen_range(upper / 2..=upper);
            thread::park_timeout(Duration::from_nanos(nanos));
            self.grow_park();
        }

        self.step = self.step.saturating_add(1);
    }

    #[inline]
    fn grow_park(&mut self) {
        self.park = self.park.saturating_mul(2).min(self.config.park_max);
    }

    /// True once spinning and yielding are exhausted.
    #[inline(always)]
    pub fn is_parking(&self) -> bool {
        self.step >= self.config.spin_limit.saturating_add(self.config.yield_limit)
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.step = 0;
        self.park = self.config.park_base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_escalates_to_parking() {
        let config = BackoffConfig::default().spin_limit(2).yield_limit(2);
        let mut backoff = Backoff::new(config);

        for _ in 0..4 {
            assert!(!backoff.is_parking());
            backoff.snooze();
        }
        assert!(backoff.is_parking());

        backoff.reset();
        assert!(!backoff.is_parking());
    }

    #[test]
    fn test_park_duration_is_capped() {
        let config = BackoffConfig::default()
            .spin_limit(0)
            .yield_limit(0)
            .park_range(Duration::from_micros(10), Duration::from_micros(40));
        let mut backoff = Backoff::new(config);

        for _ in 0..10 {
            backoff.snooze();
        }
        assert_eq!(backoff.park, Duration::from_micros(40));

        // A capped park never sleeps for long
        let start = Instant::now();
        backoff.snooze();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_park_growth_saturates_near_duration_max() {
        let config = BackoffConfig::default().park_range(Duration::from_micros(1), Duration::MAX);
        let mut backoff = Backoff::new(config);

        backoff.park = Duration::MAX / 2 + Duration::from_secs(1);
        backoff.grow_park();
        assert_eq!(backoff.park, Duration::MAX);

        backoff.grow_park();
        assert_eq!(backoff.park, Duration::MAX);
    }
}

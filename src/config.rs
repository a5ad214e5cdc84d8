//! Tuning knobs for the ring buffer and dispatcher.
//!
//! Every constant here is a tuning parameter, not a correctness requirement.
//! Defaults are what the crate ships with; `DispatcherConfig::from_env`
//! lets deployments override the common ones without recompiling.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default dispatcher queue capacity (slots).
pub const DEFAULT_QUEUE_CAPACITY: usize = 65_536;

/// Consumer loop sleep when the queue was empty.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_micros(100);

/// Upper bound on concurrently running execution units.
pub const DEFAULT_MAX_THREADS: usize = 512;

/// How long dropping a dispatcher waits for in-flight work.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Retry policy for producers that lose a race on the ring buffer tail.
///
/// A contended `offer` busy-spins `spin_limit` times, then yields the
/// processor `yield_limit` times, then parks for a randomized duration that
/// doubles on each round, starting at `park_base` and capped at `park_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub spin_limit: u32,
    pub yield_limit: u32,
    pub park_base: Duration,
    pub park_max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            spin_limit: 64,
            yield_limit: 16,
            park_base: Duration::from_micros(1),
            park_max: Duration::from_micros(512),
        }
    }
}

impl BackoffConfig {
    /// Busy-spin iterations before yielding.
    pub fn spin_limit(mut self, spins: u32) -> Self {
        self.spin_limit = spins;
        self
    }

    /// Yields before the first park.
    pub fn yield_limit(mut self, yields: u32) -> Self {
        self.yield_limit = yields;
        self
    }

    /// Initial and maximum park duration.
    pub fn park_range(mut self, base: Duration, max: Duration) -> Self {
        self.park_base = base;
        self.park_max = max;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.park_base.is_zero() {
            return Err(Error::Config("backoff park_base must be non-zero".into()));
        }
        if self.park_max < self.park_base {
            return Err(Error::Config(format!(
                "backoff park_max ({:?}) is below park_base ({:?})",
                self.park_max, self.park_base
            )));
        }
        Ok(())
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Admission queue capacity, must be a power of two.
    pub capacity: usize,
    /// Consumer loop sleep when nothing was drained.
    pub idle_wait: Duration,
    /// Maximum number of execution units running at once.
    pub max_threads: usize,
    /// Time granted to in-flight work when the dispatcher is dropped.
    pub shutdown_grace: Duration,
    pub backoff: BackoffConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            idle_wait: DEFAULT_IDLE_WAIT,
            max_threads: DEFAULT_MAX_THREADS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            backoff: BackoffConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Checks every field; capacities above the default are legal.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(Error::InvalidCapacity(self.capacity));
        }
        if self.max_threads == 0 {
            return Err(Error::Config("max_threads must be at least 1".into()));
        }
        if self.idle_wait.is_zero() {
            return Err(Error::Config("idle_wait must be non-zero".into()));
        }
        self.backoff.validate()
    }

    /// Defaults overridden by `ORDO_*` environment variables.
    ///
    /// Recognised: `ORDO_QUEUE_CAPACITY`, `ORDO_IDLE_WAIT_US`,
    /// `ORDO_MAX_THREADS`, `ORDO_SHUTDOWN_GRACE_MS`. Unset variables keep
    /// their defaults; unparsable ones are a [`Error::Config`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("ORDO_QUEUE_CAPACITY") {
            config.capacity = parse_var("ORDO_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("ORDO_IDLE_WAIT_US") {
            config.idle_wait = Duration::from_micros(parse_var("ORDO_IDLE_WAIT_US", &v)?);
        }
        if let Some(v) = lookup("ORDO_MAX_THREADS") {
            config.max_threads = parse_var("ORDO_MAX_THREADS", &v)?;
        }
        if let Some(v) = lookup("ORDO_SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(parse_var("ORDO_SHUTDOWN_GRACE_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = DispatcherConfig::default();
        assert_eq!(config.capacity, 65_536);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let config = DispatcherConfig::default().capacity(1000);
        assert!(matches!(config.validate(), Err(Error::InvalidCapacity(1000))));
    }

    #[test]
    fn test_rejects_inverted_park_range() {
        let backoff =
            BackoffConfig::default().park_range(Duration::from_millis(2), Duration::from_millis(1));
        assert!(matches!(backoff.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ORDO_QUEUE_CAPACITY", "1024"),
            ("ORDO_IDLE_WAIT_US", "250"),
            ("ORDO_MAX_THREADS", "8"),
        ]
        .into_iter()
        .collect();

        let config =
            DispatcherConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.capacity, 1024);
        assert_eq!(config.idle_wait, Duration::from_micros(250));
        assert_eq!(config.max_threads, 8);
        assert_eq!(config.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }

    #[test]
    fn test_lookup_bad_value() {
        let result = DispatcherConfig::from_lookup(|k| {
            (k == "ORDO_MAX_THREADS").then(|| "many".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

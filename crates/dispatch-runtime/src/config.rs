//! Runtime configuration
//!
//! Every knob has a compiled-in default and an environment override.
//! `RuntimeConfig::from_env()` is used when the runtime is created on first
//! use; call [`crate::init`] with an explicit config to bypass the
//! environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `DISPATCH_NUM_WORKERS` | available parallelism |
//! | `DISPATCH_MAX_THREADS` | `max(4 * workers, 64)`, at most 512 |
//! | `DISPATCH_IDLE_SPINS` | 64 |
//! | `DISPATCH_IDLE_TIMEOUT_MS` | 5000 |
//! | `DISPATCH_SPAWN_BACKOFF_MS` | 10 |
//! | `DISPATCH_FAIRNESS_INTERVAL` | 61 |
//! | `DISPATCH_TIMER_MIN_LEEWAY_US` | 0 |
//! | `DISPATCH_TIMER_MAX_SLEEP_MS` | 1000 |
//! | `DISPATCH_STACK_SIZE` | OS default |

use std::time::Duration;

use dispatch_core::{env_micros, env_millis, env_opt, env_or, DispatchError, DispatchResult};

/// Compiled-in defaults
pub mod defaults {
    /// Hard ceiling on threads, including compensating threads
    pub const MAX_THREADS_LIMIT: usize = 512;
    pub const IDLE_SPINS: u32 = 64;
    pub const IDLE_TIMEOUT_MS: u64 = 5000;
    pub const SPAWN_BACKOFF_MS: u64 = 10;
    /// Every Nth pop scans buckets from the lowest class up
    pub const FAIRNESS_INTERVAL: u32 = 61;
    pub const TIMER_MIN_LEEWAY_US: u64 = 0;
    pub const TIMER_MAX_SLEEP_MS: u64 = 1000;

    pub fn num_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn max_threads(num_workers: usize) -> usize {
        (num_workers * 4).max(64).min(MAX_THREADS_LIMIT).max(num_workers)
    }
}

/// Configuration for the process-wide runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of runnable (not blocked) workers the pool aims for
    pub num_workers: usize,

    /// Upper bound on live pool threads, including threads spawned to
    /// compensate for workers blocked in sync/wait
    pub max_threads: usize,

    /// Spin iterations before an idle worker parks
    pub idle_spins: u32,

    /// How long a surplus worker stays parked before it exits
    pub idle_timeout: Duration,

    /// Pause after a failed thread spawn before trying again
    pub spawn_backoff: Duration,

    /// Pop period of the low-to-high anti-starvation scan
    pub fairness_interval: u32,

    /// Slack floor applied to non-strict timers
    pub timer_min_leeway: Duration,

    /// Longest the timer thread sleeps with nothing armed
    pub timer_max_sleep: Duration,

    /// Stack size of pool threads (None = OS default)
    pub stack_size: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeConfig {
    /// Defaults with no environment override
    pub fn new() -> Self {
        let num_workers = defaults::num_workers();
        Self {
            num_workers,
            max_threads: defaults::max_threads(num_workers),
            idle_spins: defaults::IDLE_SPINS,
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
            spawn_backoff: Duration::from_millis(defaults::SPAWN_BACKOFF_MS),
            fairness_interval: defaults::FAIRNESS_INTERVAL,
            timer_min_leeway: Duration::from_micros(defaults::TIMER_MIN_LEEWAY_US),
            timer_max_sleep: Duration::from_millis(defaults::TIMER_MAX_SLEEP_MS),
            stack_size: None,
        }
    }

    /// Defaults overridden by `DISPATCH_*` environment variables
    pub fn from_env() -> Self {
        let num_workers = env_or("DISPATCH_NUM_WORKERS", defaults::num_workers()).max(1);
        Self {
            num_workers,
            max_threads: env_or("DISPATCH_MAX_THREADS", defaults::max_threads(num_workers)),
            idle_spins: env_or("DISPATCH_IDLE_SPINS", defaults::IDLE_SPINS),
            idle_timeout: env_millis("DISPATCH_IDLE_TIMEOUT_MS", defaults::IDLE_TIMEOUT_MS),
            spawn_backoff: env_millis("DISPATCH_SPAWN_BACKOFF_MS", defaults::SPAWN_BACKOFF_MS),
            fairness_interval: env_or("DISPATCH_FAIRNESS_INTERVAL", defaults::FAIRNESS_INTERVAL),
            timer_min_leeway: env_micros(
                "DISPATCH_TIMER_MIN_LEEWAY_US",
                defaults::TIMER_MIN_LEEWAY_US,
            ),
            timer_max_sleep: env_millis("DISPATCH_TIMER_MAX_SLEEP_MS", defaults::TIMER_MAX_SLEEP_MS),
            stack_size: env_opt("DISPATCH_STACK_SIZE"),
        }
    }

    // Builder methods

    /// Also raises `max_threads` if it would fall below the new worker count
    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self.max_threads = self.max_threads.max(n);
        self
    }

    pub fn max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    pub fn idle_spins(mut self, spins: u32) -> Self {
        self.idle_spins = spins;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn spawn_backoff(mut self, d: Duration) -> Self {
        self.spawn_backoff = d;
        self
    }

    pub fn fairness_interval(mut self, n: u32) -> Self {
        self.fairness_interval = n;
        self
    }

    pub fn timer_min_leeway(mut self, d: Duration) -> Self {
        self.timer_min_leeway = d;
        self
    }

    pub fn timer_max_sleep(mut self, d: Duration) -> Self {
        self.timer_max_sleep = d;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> DispatchResult<()> {
        if self.num_workers == 0 {
            return Err(DispatchError::InvalidConfig("num_workers must be > 0"));
        }
        if self.max_threads < self.num_workers {
            return Err(DispatchError::InvalidConfig("max_threads must be >= num_workers"));
        }
        if self.max_threads > defaults::MAX_THREADS_LIMIT {
            return Err(DispatchError::InvalidConfig("max_threads must be <= 512"));
        }
        if self.fairness_interval == 0 {
            return Err(DispatchError::InvalidConfig("fairness_interval must be > 0"));
        }
        if self.timer_max_sleep.is_zero() {
            return Err(DispatchError::InvalidConfig("timer_max_sleep must be > 0"));
        }
        if let Some(size) = self.stack_size {
            if size < 64 * 1024 {
                return Err(DispatchError::InvalidConfig("stack_size must be >= 64KB"));
            }
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("Dispatch runtime configuration:");
        eprintln!("  num_workers:        {}", self.num_workers);
        eprintln!("  max_threads:        {}", self.max_threads);
        eprintln!("  idle_spins:         {}", self.idle_spins);
        eprintln!("  idle_timeout:       {:?}", self.idle_timeout);
        eprintln!("  spawn_backoff:      {:?}", self.spawn_backoff);
        eprintln!("  fairness_interval:  {}", self.fairness_interval);
        eprintln!("  timer_min_leeway:   {:?}", self.timer_min_leeway);
        eprintln!("  timer_max_sleep:    {:?}", self.timer_max_sleep);
        eprintln!("  stack_size:         {:?}", self.stack_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env() {
        let config = RuntimeConfig::from_env();
        assert!(config.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .num_workers(8)
            .idle_spins(0)
            .timer_min_leeway(Duration::from_micros(200));

        assert_eq!(config.num_workers, 8);
        assert!(config.max_threads >= 8);
        assert_eq!(config.idle_spins, 0);
        assert_eq!(config.timer_min_leeway, Duration::from_micros(200));
    }

    #[test]
    fn test_validation() {
        let config = RuntimeConfig::new().num_workers(0);
        assert_eq!(
            config.validate(),
            Err(DispatchError::InvalidConfig("num_workers must be > 0"))
        );

        let config = RuntimeConfig::new().num_workers(4).max_threads(2);
        assert!(config.validate().is_err());

        let config = RuntimeConfig::new().fairness_interval(0);
        assert!(config.validate().is_err());

        let config = RuntimeConfig::new().stack_size(4096);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_max_threads() {
        assert_eq!(defaults::max_threads(2), 64);
        assert_eq!(defaults::max_threads(32), 128);
        assert_eq!(defaults::max_threads(200), 512);
    }
}

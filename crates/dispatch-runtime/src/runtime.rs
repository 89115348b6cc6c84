//! Process-wide runtime
//!
//! Owns the worker pool, the timer service, the five global root queues,
//! the main queue and (lazily) the reactor. Built on first use from
//! [`RuntimeConfig::from_env`] unless [`init`] ran first.

use std::sync::{Arc, OnceLock};
#[cfg(unix)]
use std::sync::Mutex;

use dispatch_core::{DispatchError, DispatchResult, QosClass};

use crate::config::RuntimeConfig;
#[cfg(unix)]
use crate::lock;
use crate::queue::Queue;
use crate::timer::TimerService;
use crate::worker::{DedicatedThread, PoolStats, WorkerPool};

#[cfg(unix)]
use crate::source::Reactor;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Snapshot of runtime counters
#[derive(Debug, Clone, Default)]
pub struct RuntimeStats {
    pub pool: PoolStats,
    pub armed_timers: usize,
    pub timers_fired: u64,
}

pub struct Runtime {
    config: RuntimeConfig,
    pool: Arc<WorkerPool>,
    timers: Arc<TimerService>,
    /// Indexed by `QosClass::bucket`
    globals: Vec<Queue>,
    main: Queue,
    #[cfg(unix)]
    reactor: Mutex<Option<Arc<Reactor>>>,
}

impl Runtime {
    fn new(config: RuntimeConfig) -> Self {
        let pool = WorkerPool::new(&config);
        let timers = TimerService::new(&config);
        pool.set_retry_timer(Arc::clone(&timers));

        let globals = (0..QosClass::BUCKETS)
            .map(|bucket| Queue::new_global(QosClass::from_bucket(bucket), Arc::clone(&pool)))
            .collect();
        let main = Queue::new_main(DedicatedThread::new("dispatch-main"));

        tracing::info!(
            num_workers = config.num_workers,
            max_threads = config.max_threads,
            "dispatch runtime initialized"
        );

        Self {
            config,
            pool,
            timers,
            globals,
            main,
            #[cfg(unix)]
            reactor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub(crate) fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    /// Global root queue for `class`; `Unspecified` maps to `Default`
    pub fn global(&self, class: QosClass) -> Queue {
        self.globals[class.bucket()].clone()
    }

    pub fn main_queue(&self) -> Queue {
        self.main.clone()
    }

    /// Reactor thread, started on first use
    ///
    /// A failed start is not cached; the next descriptor or signal source
    /// tries again.
    #[cfg(unix)]
    pub(crate) fn reactor(&self) -> DispatchResult<Arc<Reactor>> {
        let mut slot = lock(&self.reactor);
        if let Some(reactor) = slot.as_ref() {
            return Ok(Arc::clone(reactor));
        }
        let reactor = Reactor::new()?;
        *slot = Some(Arc::clone(&reactor));
        Ok(reactor)
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pool: self.pool.stats(),
            armed_timers: self.timers.armed(),
            timers_fired: self.timers.fired(),
        }
    }
}

/// Build the runtime from an explicit configuration
///
/// Fails if the configuration is invalid or the runtime already exists
/// (including implicit construction by an earlier call into the crate).
pub fn init(config: RuntimeConfig) -> DispatchResult<()> {
    config.validate()?;
    let mut created = false;
    RUNTIME.get_or_init(|| {
        created = true;
        Runtime::new(config)
    });
    if created {
        Ok(())
    } else {
        Err(DispatchError::AlreadyInitialized)
    }
}

/// The runtime, built from the environment on first call
pub fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        let config = RuntimeConfig::from_env();
        match config.validate() {
            Ok(()) => Runtime::new(config),
            Err(e) => {
                tracing::warn!(error = %e, "invalid DISPATCH_* configuration, using defaults");
                Runtime::new(RuntimeConfig::new())
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_after_use_fails() {
        let _ = runtime();
        assert_eq!(init(RuntimeConfig::new()), Err(DispatchError::AlreadyInitialized));
    }

    #[test]
    fn test_invalid_config_rejected_first() {
        let config = RuntimeConfig::new().num_workers(0);
        assert!(matches!(init(config), Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn test_globals_by_class() {
        let rt = runtime();
        for class in QosClass::SCHEDULABLE {
            let q = rt.global(class);
            assert!(q.ptr_eq(&rt.global(class)));
            assert!(q.is_concurrent());
        }
        assert!(rt.global(QosClass::Unspecified).ptr_eq(&rt.global(QosClass::Default)));
        assert_eq!(rt.main_queue().label(), "dispatch.main");
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = runtime().stats();
        assert!(stats.pool.threads <= runtime().config().max_threads);
    }
}

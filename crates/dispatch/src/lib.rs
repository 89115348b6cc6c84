//! # dispatch - queue-based task dispatch
//!
//! Submit closures to queues and let a shared, elastic thread pool run
//! them.
//!
//! ## Features
//!
//! - **Serial and concurrent queues** with barriers, suspension and
//!   inactive start
//! - **Target hierarchy**: any queue can funnel into another; everything
//!   ends at a global QoS queue or the main queue
//! - **QoS buckets** scheduled by priority with a fairness pass so lower
//!   classes never starve
//! - **Groups, work items and semaphores** for joining and signalling
//! - **Event sources**: timers with leeway, descriptor readiness, signals
//!   and application data merged with add, or and replace
//!
//! ## Quick Start
//!
//! ```ignore
//! use dispatch::prelude::*;
//!
//! let queue = Queue::serial("com.example.counter");
//! let group = Group::new();
//! for i in 0..100 {
//!     queue.submit_in_group(&group, move || println!("{}", i));
//! }
//! group.notify(&dispatch::main_queue(), || println!("done"));
//! group.wait();
//!
//! let timer = Source::timer(TimerFlags::NONE, None);
//! timer.set_event_handler(|| println!("tick"));
//! timer.schedule(DispatchTime::now(), TimeInterval::milliseconds(100), TimeInterval::milliseconds(5));
//! timer.activate();
//! ```
//!
//! ## Configuration
//!
//! The runtime is built on first use. `DISPATCH_*` environment variables
//! override the defaults (see [`RuntimeConfig::from_env`]); call [`init`]
//! before anything else to pass a configuration explicitly.

// Re-export core types
pub use dispatch_core::{
    usage_error, Deadline, DispatchError, DispatchResult, DispatchTime, Qos, QosClass,
    QosOverride, TimeInterval, WaitResult, WallTime, WorkItemFlags,
};

// Re-export env utilities
pub use dispatch_core::{env_flag, env_millis, env_micros, env_opt, env_or};

// Re-export runtime types
pub use dispatch_runtime::{
    current_qos, init, runtime, try_current_worker_id, AutoreleaseFrequency, Group, PoolStats,
    Predicate, Queue, QueueBuilder, QueueKind, Runtime, RuntimeConfig, RuntimeStats, Semaphore,
    Source, SourceKind, SourceState, SpecificKey, SubmitOptions, TimerFlags, WorkItem,
};

/// Serial queue drained by the dedicated `dispatch-main` thread
pub fn main_queue() -> Queue {
    Queue::main()
}

/// Global concurrent queue for a QoS class
pub fn global(class: QosClass) -> Queue {
    Queue::global(class)
}

/// Invoke `work(i)` for `i` in `0..iterations` in parallel and wait
pub fn concurrent_perform<F>(iterations: usize, work: F)
where
    F: Fn(usize) + Sync,
{
    Queue::concurrent_perform(iterations, work);
}

/// Commonly used types
pub mod prelude {
    pub use crate::{
        DispatchTime, Group, Qos, QosClass, Queue, Semaphore, Source, SubmitOptions,
        TimeInterval, TimerFlags, WaitResult, WorkItem, WorkItemFlags,
    };
}

#[cfg(test)]
mod tests {
    use super::prelude::*;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    #[test]
    fn test_group_notify_on_main_queue() {
        let queue = global(QosClass::UserInitiated);
        let group = Group::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = Arc::clone(&count);
            queue.submit_in_group(&group, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        let (tx, rx) = mpsc::channel();
        let c = Arc::clone(&count);
        group.notify(&main_queue(), move || tx.send(c.load(Ordering::SeqCst)).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), 50);
    }

    #[test]
    fn test_concurrent_perform_visits_each_index() {
        let seen: Vec<AtomicUsize> = (0..100).map(|_| AtomicUsize::new(0)).collect();
        concurrent_perform(100, |i| {
            seen[i].fetch_add(1, Ordering::SeqCst);
        });
        assert!(seen.iter().all(|s| s.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_work_item_round_trip_through_queues() {
        let (tx, rx) = mpsc::channel();
        let item = WorkItem::with_options(WorkItemFlags::BARRIER | WorkItemFlags::ENFORCE_QOS, Qos::UTILITY, move || {
            tx.send(current_qos()).unwrap();
        });
        Queue::concurrent("facade.item").submit_item(&item);
        assert_eq!(item.wait_timeout(Duration::from_secs(10)), WaitResult::Success);
        assert_eq!(rx.recv().unwrap().class(), QosClass::Utility);
    }
}

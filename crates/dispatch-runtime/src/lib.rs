//! # dispatch-runtime
//!
//! Queue-based task dispatch engine: serial and concurrent queues arranged
//! in a target hierarchy, an elastic worker pool with QoS buckets, groups,
//! semaphores, and event sources (timers, descriptors, signals, user data).
//!
//! ## Architecture
//!
//! ```text
//!   Queue::submit ──► custom queue ──► ... ──► root queue
//!                     (serial/barrier/          │
//!                      suspend rules)           ├─ global(qos) ──► WorkerPool ──► QosReadyQueue
//!                                               └─ main()      ──► "dispatch-main" thread
//!
//!   Source ──► TimerService ("dispatch-timer")   ─┐
//!          └─► Reactor ("dispatch-reactor")       ─┴─► event job on the source's queue
//! ```
//!
//! Everything is built on first use from [`RuntimeConfig::from_env`]; call
//! [`init`] beforehand to supply an explicit configuration.
//!
//! ## Example
//!
//! ```ignore
//! use dispatch_runtime::{Group, Queue};
//!
//! let queue = Queue::serial("com.example.worker");
//! let group = Group::new();
//! for i in 0..10 {
//!     queue.submit_in_group(&group, move || println!("item {}", i));
//! }
//! group.wait();
//! ```

pub mod config;
pub mod group;
pub mod queue;
pub mod runtime;
pub mod semaphore;
pub mod source;
pub mod tls;
pub mod work_item;

mod job;
mod parking;
mod ready_queue;
mod timer;
mod worker;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use dispatch_core::DispatchTime;

pub use config::RuntimeConfig;
pub use group::Group;
pub use queue::{
    AutoreleaseFrequency, Predicate, Queue, QueueBuilder, QueueKind, SpecificKey, SubmitOptions,
};
pub use runtime::{init, runtime, Runtime, RuntimeStats};
pub use semaphore::Semaphore;
pub use source::{Source, SourceKind, SourceState, TimerFlags};
pub use tls::{current_qos, try_current_worker_id};
pub use work_item::WorkItem;
pub use worker::PoolStats;

/// Lock a mutex, ignoring poisoning
///
/// Work item panics are caught and bookkeeping continues during unwinding,
/// so runtime state behind a poisoned lock is still consistent.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wait on `cond` while `blocked` holds, up to `deadline`
///
/// Returns the guard and `true` if the deadline passed with the condition
/// still blocked.
pub(crate) fn wait_deadline<'a, T, F>(
    cond: &Condvar,
    mut guard: MutexGuard<'a, T>,
    deadline: DispatchTime,
    mut blocked: F,
) -> (MutexGuard<'a, T>, bool)
where
    F: FnMut(&mut T) -> bool,
{
    while blocked(&mut guard) {
        match deadline.duration_until() {
            None => {
                guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
            }
            Some(left) if left.is_zero() => return (guard, true),
            Some(left) => {
                guard = cond
                    .wait_timeout(guard, left)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
        }
    }
    (guard, false)
}

//! Timer engine
//!
//! A single lazily started thread sleeps until the earliest point at which
//! some armed timer would exceed its leeway, then fires every timer whose
//! deadline has passed. Timers whose windows overlap therefore fire in one
//! wakeup.
//!
//! # Architecture
//!
//! ```text
//!   submit_after ─┐                       ┌─► Queue (job)
//!   Source ───────┼─► TimerService::arm ──┤
//!   WorkerPool ───┘        │              ├─► SourceCore::timer_fired
//!                          ▼              └─► closure on the timer thread
//!               ┌──────────────────────┐
//!               │   dyn TimerBackend   │
//!               └──────────────────────┘
//!                          │
//!                   HeapTimerBackend
//! ```
//!
//! Period arithmetic for repeating timers lives in [`TimerSpec`].

mod entry;
mod heap;
mod schedule;
mod service;

pub(crate) use entry::{TimerEntry, TimerHandle, TimerPayload};
pub(crate) use heap::HeapTimerBackend;
pub(crate) use schedule::TimerSpec;
pub(crate) use service::TimerService;

/// Storage for armed timers
///
/// Implementations must be thread-safe: the timer thread polls while other
/// threads arm and disarm.
pub(crate) trait TimerBackend: Send + Sync {
    /// Store an entry, returns its handle
    fn insert(&self, entry: TimerEntry) -> TimerHandle;

    /// Remove an armed entry; `None` if it already fired or was cancelled
    fn cancel(&self, handle: TimerHandle) -> Option<TimerEntry>;

    /// Remove and return every entry with `deadline <= now`, earliest first
    fn poll_expired(&self, now: u64) -> Vec<TimerEntry>;

    /// Latest moment the timer thread may sleep until, `None` when empty
    fn next_wakeup(&self) -> Option<u64>;

    /// Number of armed timers
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend name for logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}

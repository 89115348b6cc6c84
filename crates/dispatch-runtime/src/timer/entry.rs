//! Timer entry and handle types

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use crate::job::Job;
use crate::queue::Queue;
use crate::source::SourceCore;

/// Unique handle of one armed timer
///
/// Re-arming always produces a fresh handle, so a stale expiry can be told
/// apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct TimerHandle(u64);

impl TimerHandle {
    #[inline]
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What happens when a timer expires
pub(crate) enum TimerPayload {
    /// Hand a job to a queue (`submit_after`)
    Enqueue { queue: Queue, job: Job },
    /// Notify a timer source
    Source(Weak<SourceCore>),
    /// Run a closure on the timer thread; must be short
    Call(Box<dyn FnOnce() + Send>),
}

impl fmt::Debug for TimerPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerPayload::Enqueue { queue, .. } => write!(f, "Enqueue({})", queue.label()),
            TimerPayload::Source(_) => f.write_str("Source"),
            TimerPayload::Call(_) => f.write_str("Call"),
        }
    }
}

/// Armed timer stored in a backend
#[derive(Debug)]
pub(crate) struct TimerEntry {
    pub handle: TimerHandle,
    /// Earliest fire time, monotonic ns
    pub deadline: u64,
    /// Allowed delay past `deadline`
    pub leeway: u64,
    pub payload: TimerPayload,
}

impl TimerEntry {
    pub fn new(deadline: u64, leeway: u64, payload: TimerPayload) -> Self {
        Self {
            handle: TimerHandle::new(),
            deadline,
            leeway,
            payload,
        }
    }

    /// Latest acceptable fire time
    #[inline]
    pub fn latest(&self) -> u64 {
        self.deadline.saturating_add(self.leeway)
    }
}

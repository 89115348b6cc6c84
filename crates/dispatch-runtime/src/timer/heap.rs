//! BinaryHeap timer backend
//!
//! Two min-heaps over the same live set: one keyed by deadline (what may
//! fire now) and one keyed by deadline + leeway (when the timer thread must
//! be awake at the latest). Cancellation and firing only remove the entry
//! from the live map; heap slots for dead handles are skipped lazily and
//! the heaps are rebuilt once dead slots dominate.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use crate::lock;
use crate::timer::{TimerBackend, TimerEntry, TimerHandle};

/// Rebuild once dead slots exceed `2 * live + REBUILD_SLACK`
const REBUILD_SLACK: usize = 64;

#[derive(Default)]
struct Inner {
    live: HashMap<TimerHandle, TimerEntry>,
    by_deadline: BinaryHeap<Reverse<(u64, TimerHandle)>>,
    by_latest: BinaryHeap<Reverse<(u64, TimerHandle)>>,
    #[cfg(test)]
    total_inserted: u64,
    #[cfg(test)]
    total_fired: u64,
    #[cfg(test)]
    total_cancelled: u64,
}

impl Inner {
    fn maybe_rebuild(&mut self) {
        let limit = self.live.len() * 2 + REBUILD_SLACK;
        if self.by_deadline.len() <= limit && self.by_latest.len() <= limit {
            return;
        }
        self.by_deadline = self
            .live
            .values()
            .map(|e| Reverse((e.deadline, e.handle)))
            .collect();
        self.by_latest = self
            .live
            .values()
            .map(|e| Reverse((e.latest(), e.handle)))
            .collect();
    }
}

/// Heap-based timer backend
pub(crate) struct HeapTimerBackend {
    inner: Mutex<Inner>,
}

impl HeapTimerBackend {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    #[cfg(test)]
    pub fn stats(&self) -> HeapTimerStats {
        let inner = lock(&self.inner);
        HeapTimerStats {
            active: inner.live.len(),
            heap_slots: inner.by_deadline.len(),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }
}

impl TimerBackend for HeapTimerBackend {
    fn insert(&self, entry: TimerEntry) -> TimerHandle {
        let handle = entry.handle;
        let mut inner = lock(&self.inner);
        inner.by_deadline.push(Reverse((entry.deadline, handle)));
        inner.by_latest.push(Reverse((entry.latest(), handle)));
        inner.live.insert(handle, entry);
        #[cfg(test)]
        {
            inner.total_inserted += 1;
        }
        handle
    }

    fn cancel(&self, handle: TimerHandle) -> Option<TimerEntry> {
        let mut inner = lock(&self.inner);
        let removed = inner.live.remove(&handle);
        if removed.is_some() {
            #[cfg(test)]
            {
                inner.total_cancelled += 1;
            }
            inner.maybe_rebuild();
        }
        removed
    }

    fn poll_expired(&self, now: u64) -> Vec<TimerEntry> {
        let mut inner = lock(&self.inner);
        let mut expired = Vec::new();
        while let Some(&Reverse((deadline, handle))) = inner.by_deadline.peek() {
            if deadline > now {
                break;
            }
            inner.by_deadline.pop();
            if let Some(entry) = inner.live.remove(&handle) {
                expired.push(entry);
            }
        }
        #[cfg(test)]
        {
            inner.total_fired += expired.len() as u64;
        }
        if !expired.is_empty() {
            inner.maybe_rebuild();
        }
        expired
    }

    fn next_wakeup(&self) -> Option<u64> {
        let mut inner = lock(&self.inner);
        while let Some(&Reverse((latest, handle))) = inner.by_latest.peek() {
            if inner.live.contains_key(&handle) {
                return Some(latest);
            }
            inner.by_latest.pop();
        }
        None
    }

    fn len(&self) -> usize {
        lock(&self.inner).live.len()
    }

    fn name(&self) -> &'static str {
        "binary_heap"
    }
}

/// Statistics for HeapTimerBackend
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct HeapTimerStats {
    /// Armed timers
    pub active: usize,
    /// Deadline heap slots, dead ones included
    pub heap_slots: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}

//! Parallel loops
//!
//! `apply` hands out indices from a shared counter. Up to `num_workers - 1`
//! helper jobs are submitted to the queue and the calling thread drains
//! indices as well, so the loop completes even when every pool thread is
//! busy with unrelated work.
//!
//! The calling thread is admitted like a plain item: on every custom queue
//! of the target chain it is not already running on, it waits for a slot
//! behind suspension and barriers before claiming indices.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dispatch_core::{QosClass, WorkItemFlags};

use crate::job::{Job, Latch};
use crate::lock;
use crate::queue::{Queue, QueueKind};
use crate::runtime::runtime;
use crate::tls;
use crate::worker::enter_blocking;

type Body = dyn Fn(usize) + Sync;

struct ApplyState {
    iterations: usize,
    next: AtomicUsize,
    done: AtomicUsize,
    /// Borrowed from the `apply` frame, which outlives every claimed index
    work: *const Body,
    panic: Mutex<Option<Box<dyn Any + Send>>>,
    latch: Latch,
}

// SAFETY: `work` points to a `Sync` closure and is only dereferenced for an
// index claimed below `iterations`, which `apply` waits for.
unsafe impl Send for ApplyState {}
unsafe impl Sync for ApplyState {}

impl ApplyState {
    fn drain(&self) {
        loop {
            let index = self.next.fetch_add(1, Ordering::AcqRel);
            if index >= self.iterations {
                return;
            }
            // SAFETY: see the `Send` impl
            let work = unsafe { &*self.work };
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| work(index))) {
                lock(&self.panic).get_or_insert(payload);
            }
            if self.done.fetch_add(1, Ordering::AcqRel) + 1 == self.iterations {
                self.latch.set();
            }
        }
    }
}

/// Slots the calling thread holds on custom queues, given back on drop
struct InlineSlots(Vec<Queue>);

impl Drop for InlineSlots {
    fn drop(&mut self) {
        for queue in &self.0 {
            queue.complete(false);
        }
    }
}

impl Queue {
    /// Invoke `work(i)` for every `i` in `0..iterations` and wait
    ///
    /// On a concurrent queue indices run in parallel, with the calling
    /// thread taking part; on a serial queue they run in order inside one
    /// `sync`, as they do when any queue the work would pass through is
    /// serial. The first panic raised by `work` resumes on the caller once
    /// every index has run.
    pub fn apply<F>(&self, iterations: usize, work: F)
    where
        F: Fn(usize) + Sync,
    {
        if iterations == 0 {
            return;
        }
        let chain = self.chain();
        // Queues the caller already executes on cover it, and so do their targets
        let held = tls::with_frames(|frames| {
            chain
                .iter()
                .position(|queue| frames.iter().any(|frame| frame.queue.ptr_eq(queue)))
        })
        .unwrap_or(chain.len());
        let entering = &chain[..held];
        if self.kind() == QueueKind::Serial
            || entering.iter().any(|queue| queue.kind() == QueueKind::Serial)
        {
            self.sync(|| (0..iterations).for_each(&work));
            return;
        }

        let body: &(dyn Fn(usize) + Sync + '_) = &work;
        // SAFETY: lifetime erased; `apply` returns only after `done`
        // reaches `iterations`, and no index past that derefs `work`.
        let body: &'static Body = unsafe { mem::transmute(body) };
        let state = Arc::new(ApplyState {
            iterations,
            next: AtomicUsize::new(0),
            done: AtomicUsize::new(0),
            work: body as *const Body,
            panic: Mutex::new(None),
            latch: Latch::new(),
        });

        let helpers = iterations
            .min(runtime().pool().num_workers())
            .saturating_sub(1);
        let qos = self.resolve_qos(tls::current_qos(), WorkItemFlags::NONE);
        for _ in 0..helpers {
            let state = Arc::clone(&state);
            self.push_job(Job::new(Box::new(move || state.drain()), qos, false));
        }

        {
            let mut slots = InlineSlots(Vec::with_capacity(entering.len()));
            for queue in entering {
                queue.acquire_inline();
                if !queue.is_root() {
                    slots.0.push(queue.clone());
                }
            }
            let _frames: Vec<_> = entering
                .iter()
                .rev()
                .map(|queue| tls::enter_queue(queue, false))
                .collect();
            state.drain();
        }
        if state.done.load(Ordering::Acquire) < iterations {
            let _blocking = enter_blocking();
            state.latch.wait();
        }

        let payload = lock(&state.panic).take();
        if let Some(payload) = payload {
            panic::resume_unwind(payload);
        }
    }

    /// [`apply`](Self::apply) on the default global queue
    pub fn concurrent_perform<F>(iterations: usize, work: F)
    where
        F: Fn(usize) + Sync,
    {
        Queue::global(QosClass::Default).apply(iterations, work);
    }
}

//! Thread-local execution context
//!
//! Each thread keeps a stack of the queues whose work it is currently
//! executing. Submissions hop through the target hierarchy one queue at a
//! time and every hop pushes a frame, so while an item runs the stack reads
//! `[root, ..., target, queue]`. The stack drives deadlock detection in
//! `sync`, `precondition` checks and current-queue specific lookups.

use std::cell::{Cell, RefCell};

use dispatch_core::Qos;

use crate::queue::Queue;

thread_local! {
    /// Pool worker index for this OS thread, `usize::MAX` elsewhere
    static WORKER_ID: Cell<usize> = const { Cell::new(usize::MAX) };

    /// QoS of the work running on this thread
    static CURRENT_QOS: Cell<Qos> = const { Cell::new(Qos::UNSPECIFIED) };

    /// Queues currently executing on this thread, innermost last
    static FRAMES: RefCell<Vec<Frame>> = const { RefCell::new(Vec::new()) };
}

/// One level of the execution stack
pub(crate) struct Frame {
    pub queue: Queue,
    /// The item running at this level was submitted as a barrier
    pub barrier: bool,
}

/// Pops the frame pushed by [`enter_queue`] when dropped
pub(crate) struct FrameGuard {
    _private: (),
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        FRAMES.with(|frames| {
            frames.borrow_mut().pop();
        });
    }
}

/// Record that this thread is now executing work from `queue`
pub(crate) fn enter_queue(queue: &Queue, barrier: bool) -> FrameGuard {
    FRAMES.with(|frames| {
        frames.borrow_mut().push(Frame {
            queue: queue.clone(),
            barrier,
        })
    });
    FrameGuard { _private: () }
}

/// Inspect the execution stack, innermost frame last
pub(crate) fn with_frames<R>(f: impl FnOnce(&[Frame]) -> R) -> R {
    FRAMES.with(|frames| f(&frames.borrow()))
}

/// Innermost queue executing on this thread
pub fn current_queue() -> Option<Queue> {
    FRAMES.with(|frames| frames.borrow().last().map(|f| f.queue.clone()))
}

/// Restores the previous QoS when dropped
pub(crate) struct QosGuard {
    previous: Qos,
}

impl Drop for QosGuard {
    fn drop(&mut self) {
        CURRENT_QOS.with(|cell| cell.set(self.previous));
    }
}

pub(crate) fn enter_qos(qos: Qos) -> QosGuard {
    let previous = CURRENT_QOS.with(|cell| cell.replace(qos));
    QosGuard { previous }
}

/// QoS of the work running on this thread
#[inline]
pub fn current_qos() -> Qos {
    CURRENT_QOS.with(|cell| cell.get())
}

#[inline]
pub(crate) fn set_worker_id(id: usize) {
    WORKER_ID.with(|cell| cell.set(id));
}

/// Pool worker index, `None` if this is not a pool thread
#[inline]
pub fn try_current_worker_id() -> Option<usize> {
    let id = WORKER_ID.with(|cell| cell.get());
    if id == usize::MAX {
        None
    } else {
        Some(id)
    }
}

#[inline]
pub(crate) fn is_pool_worker() -> bool {
    try_current_worker_id().is_some()
}

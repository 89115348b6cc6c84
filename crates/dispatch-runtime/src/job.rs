//! Runnable jobs
//!
//! A [`Job`] is the unit the scheduler moves around: a boxed closure plus the
//! QoS it was resolved to at submission and whether it was submitted as a
//! barrier. Each hop through the queue hierarchy wraps the closure once more
//! so that bookkeeping (execution frames, serial/barrier completion) runs
//! around the user code.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};

use dispatch_core::{DispatchTime, Qos};

use crate::{lock, tls, wait_deadline};

pub(crate) type Thunk = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Job {
    thunk: Thunk,
    pub qos: Qos,
    pub barrier: bool,
}

impl Job {
    pub fn new(thunk: Thunk, qos: Qos, barrier: bool) -> Self {
        Self { thunk, qos, barrier }
    }

    /// Wrap the closure; `wrapper` receives the inner closure and must call it
    pub fn wrap<W>(self, wrapper: W) -> Job
    where
        W: FnOnce(Thunk) + Send + 'static,
    {
        let inner = self.thunk;
        Job {
            thunk: Box::new(move || wrapper(inner)),
            qos: self.qos,
            barrier: self.barrier,
        }
    }

    #[inline]
    pub fn run(self) {
        (self.thunk)()
    }
}

/// Run a job on the current thread with its QoS applied
///
/// Panics escaping the job are logged and swallowed so that the thread
/// survives; queue and group bookkeeping is done by drop guards inside the
/// job and therefore still runs during unwinding.
pub(crate) fn execute(job: Job) {
    let _qos = tls::enter_qos(job.qos);
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
        tracing::error!(
            worker = ?tls::try_current_worker_id(),
            "work item panicked: {}",
            panic_message(&payload)
        );
    }
}

pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// One-shot completion flag
pub(crate) struct Latch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        *lock(&self.done) = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.done)
    }

    pub fn wait(&self) {
        self.wait_until(DispatchTime::DISTANT_FUTURE);
    }

    /// Returns `false` on timeout
    pub fn wait_until(&self, deadline: DispatchTime) -> bool {
        let guard = lock(&self.done);
        let (guard, _) = wait_deadline(&self.cond, guard, deadline, |done| !*done);
        *guard
    }
}

//! Dispatch groups
//!
//! A [`Group`] counts outstanding work. `enter` increments, `leave`
//! decrements, and the transition to zero releases waiters and submits
//! every registered notification exactly once. The counter itself is a
//! lock-free atomic; the mutex only guards the notification list and the
//! condition variable.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dispatch_core::{usage_error, DispatchTime, WaitResult};

use crate::queue::Queue;
use crate::work_item::{Notification, WorkItem};
use crate::worker::enter_blocking;
use crate::{lock, wait_deadline};

struct Inner {
    pending: AtomicUsize,
    notifications: Mutex<Vec<Notification>>,
    cond: Condvar,
}

/// Join counter for a set of submissions
#[derive(Clone)]
pub struct Group {
    inner: Arc<Inner>,
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Group {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: AtomicUsize::new(0),
                notifications: Mutex::new(Vec::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Outstanding enters (hint, may be stale)
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn enter(&self) {
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Balance one [`enter`](Self::enter)
    ///
    /// Leaving a group with nothing outstanding is a usage error.
    pub fn leave(&self) {
        match self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.on_zero(),
            Ok(_) => {}
            Err(_) => usage_error("Group::leave called more times than Group::enter"),
        }
    }

    /// Enter now, leave when the returned guard drops
    pub(crate) fn enter_scoped(&self) -> GroupLeave {
        self.enter();
        GroupLeave(self.clone())
    }

    fn on_zero(&self) {
        let ready = {
            let mut notifications = lock(&self.inner.notifications);
            // A concurrent enter may have raised the count again
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                mem::take(&mut *notifications)
            } else {
                Vec::new()
            }
        };
        self.inner.cond.notify_all();
        for notification in ready {
            notification.dispatch();
        }
    }

    /// Block until the count reaches zero
    pub fn wait(&self) {
        self.wait_until(DispatchTime::DISTANT_FUTURE);
    }

    /// Block until the count reaches zero or `deadline` passes
    ///
    /// A timed-out group stays usable; a later wait succeeds once the
    /// outstanding work completes.
    pub fn wait_until(&self, deadline: DispatchTime) -> WaitResult {
        if self.pending() == 0 {
            return WaitResult::Success;
        }
        let _blocking = enter_blocking();
        let guard = lock(&self.inner.notifications);
        let pending = &self.inner.pending;
        let (_guard, timed_out) = wait_deadline(&self.inner.cond, guard, deadline, |_| {
            pending.load(Ordering::Acquire) != 0
        });
        if timed_out {
            WaitResult::TimedOut
        } else {
            WaitResult::Success
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_until(DispatchTime::after(timeout))
    }

    /// Submit `f` to `queue` when the count next reaches zero
    ///
    /// If the count is already zero `f` is submitted right away, still
    /// asynchronously.
    pub fn notify<F>(&self, queue: &Queue, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_notification(Notification::Closure(queue.clone(), Box::new(f)));
    }

    pub fn notify_item(&self, queue: &Queue, item: &WorkItem) {
        self.add_notification(Notification::Item(queue.clone(), item.clone()));
    }

    fn add_notification(&self, notification: Notification) {
        let mut notifications = lock(&self.inner.notifications);
        if self.inner.pending.load(Ordering::Acquire) == 0 {
            drop(notifications);
            notification.dispatch();
        } else {
            notifications.push(notification);
        }
    }
}

/// Leaves its group when dropped
pub(crate) struct GroupLeave(Group);

impl Drop for GroupLeave {
    fn drop(&mut self) {
        self.0.leave();
    }
}

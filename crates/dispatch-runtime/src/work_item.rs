//! Work items
//!
//! A [`WorkItem`] wraps an action with flags and a QoS so it can be
//! submitted, waited on, cancelled or chained. The first time an item
//! finishes (or is skipped because it was cancelled) it counts as
//! completed: waiters are released and completion notifications are
//! submitted to their queues.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dispatch_core::{DispatchTime, Qos, WaitResult, WorkItemFlags};

use crate::queue::Queue;
use crate::worker::enter_blocking;
use crate::{lock, tls, wait_deadline};

/// Continuation submitted when a work item or group completes
pub(crate) enum Notification {
    Closure(Queue, Box<dyn FnOnce() + Send>),
    Item(Queue, WorkItem),
}

impl Notification {
    pub fn dispatch(self) {
        match self {
            Notification::Closure(queue, f) => queue.submit(f),
            Notification::Item(queue, item) => queue.submit_item(&item),
        }
    }
}

struct ItemState {
    completed: bool,
    notifications: Vec<Notification>,
}

struct Inner {
    action: Box<dyn Fn() + Send + Sync>,
    flags: WorkItemFlags,
    qos: Qos,
    cancelled: AtomicBool,
    state: Mutex<ItemState>,
    cond: Condvar,
}

/// Shared handle to an invocable unit of work
#[derive(Clone)]
pub struct WorkItem {
    inner: Arc<Inner>,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("flags", &self.inner.flags)
            .field("qos", &self.inner.qos)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl WorkItem {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::with_options(WorkItemFlags::NONE, Qos::UNSPECIFIED, action)
    }

    /// Item with explicit flags and QoS
    ///
    /// `ASSIGN_CURRENT_CONTEXT` replaces an unspecified `qos` with the
    /// calling thread's QoS; `NO_QOS` discards `qos`.
    pub fn with_options<F>(flags: WorkItemFlags, qos: Qos, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let qos = if flags.contains(WorkItemFlags::NO_QOS) {
            Qos::UNSPECIFIED
        } else if flags.contains(WorkItemFlags::ASSIGN_CURRENT_CONTEXT) {
            qos.or(tls::current_qos())
        } else {
            qos
        };
        Self {
            inner: Arc::new(Inner {
                action: Box::new(action),
                flags,
                qos,
                cancelled: AtomicBool::new(false),
                state: Mutex::new(ItemState {
                    completed: false,
                    notifications: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn flags(&self) -> WorkItemFlags {
        self.inner.flags
    }

    pub fn qos(&self) -> Qos {
        self.inner.qos
    }

    /// Run the item on the calling thread
    pub fn perform(&self) {
        let _qos = self.inner.qos.is_specified().then(|| tls::enter_qos(self.inner.qos));
        self.run_on_queue();
    }

    /// Body of every job built from this item
    pub(crate) fn run_on_queue(&self) {
        let _complete = CompleteOnDrop(self);
        if !self.is_cancelled() {
            (self.inner.action)();
        }
    }

    fn complete(&self) {
        let notifications = {
            let mut state = lock(&self.inner.state);
            if state.completed {
                return;
            }
            state.completed = true;
            std::mem::take(&mut state.notifications)
        };
        self.inner.cond.notify_all();
        for notification in notifications {
            notification.dispatch();
        }
    }

    /// Block until the item has completed once
    pub fn wait(&self) {
        self.wait_until(DispatchTime::DISTANT_FUTURE);
    }

    pub fn wait_until(&self, deadline: DispatchTime) -> WaitResult {
        let _blocking = enter_blocking();
        let guard = lock(&self.inner.state);
        let (_guard, timed_out) =
            wait_deadline(&self.inner.cond, guard, deadline, |state| !state.completed);
        if timed_out {
            WaitResult::TimedOut
        } else {
            WaitResult::Success
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_until(DispatchTime::after(timeout))
    }

    /// Submit `f` to `queue` once this item completes; immediately if it
    /// already has
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
        let mut state = lock(&self.inner.state);
        if state.completed {
            drop(state);
            notification.dispatch();
        } else {
            state.notifications.push(notification);
        }
    }

    /// Skip the action if it has not started yet
    ///
    /// A skipped item still completes: waiters return and notifications
    /// fire. Cancelling a running item does not interrupt it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        lock(&self.inner.state).completed
    }
}

/// Marks the item completed even if the action unwinds
struct CompleteOnDrop<'a>(&'a WorkItem);

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.0.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_perform_completes() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let item = WorkItem::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!item.is_completed());
        item.perform();
        assert!(item.is_completed());
        assert_eq!(item.wait_timeout(Duration::from_millis(1)), WaitResult::Success);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_barrier_item_runs_alone() {
        let queue = Queue::concurrent("work_item.barrier");
        let plain_running = Arc::new(AtomicUsize::new(0));
        let in_barrier = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let plain = || {
            let running = Arc::clone(&plain_running);
            let in_barrier = Arc::clone(&in_barrier);
            let violations = Arc::clone(&violations);
            WorkItem::new(move || {
                running.fetch_add(1, Ordering::SeqCst);
                if in_barrier.load(Ordering::SeqCst) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(10));
                running.fetch_sub(1, Ordering::SeqCst);
            })
        };
        let barrier = {
            let running = Arc::clone(&plain_running);
            let in_barrier = Arc::clone(&in_barrier);
            let violations = Arc::clone(&violations);
            WorkItem::with_options(WorkItemFlags::BARRIER, Qos::UNSPECIFIED, move || {
                in_barrier.store(true, Ordering::SeqCst);
                if running.load(Ordering::SeqCst) != 0 {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(20));
                in_barrier.store(false, Ordering::SeqCst);
            })
        };

        let before = [plain(), plain(), plain()];
        let after = [plain(), plain(), plain()];
        for item in &before {
            queue.submit_item(item);
        }
        queue.submit_item(&barrier);
        for item in &after {
            queue.submit_item(item);
        }
        for item in before.iter().chain([&barrier]).chain(&after) {
            assert_eq!(item.wait_timeout(Duration::from_secs(5)), WaitResult::Success);
        }
        assert_eq!(violations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_times_out_until_run() {
        let item = WorkItem::new(|| {});
        assert_eq!(item.wait_timeout(Duration::from_millis(20)), WaitResult::TimedOut);
        let queue = Queue::serial("work_item.wait");
        queue.submit_item(&item);
        item.wait();
        assert!(item.is_completed());
    }

    #[test]
    fn test_cancelled_item_is_skipped_but_completes() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let item = WorkItem::new(move || r.store(true, Ordering::SeqCst));
        item.cancel();
        assert!(item.is_cancelled());

        let (tx, rx) = mpsc::channel();
        let queue = Queue::serial("work_item.cancel");
        item.notify(&queue, move || tx.send(()).unwrap());
        queue.submit_item(&item);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(item.wait_timeout(Duration::from_secs(1)), WaitResult::Success);
    }

    #[test]
    fn test_notify_after_completion_still_fires() {
        let item = WorkItem::new(|| {});
        item.perform();
        let (tx, rx) = mpsc::channel();
        item.notify(&Queue::concurrent("work_item.late"), move || tx.send(7).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn test_notify_item_chains() {
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let first = WorkItem::new(move || tx.send("first").unwrap());
        let second = WorkItem::new(move || tx2.send("second").unwrap());
        let queue = Queue::serial("work_item.chain");
        first.notify_item(&queue, &second);
        queue.submit_item(&first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "first");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        second.wait();
    }

    #[test]
    fn test_assign_current_context_captures_qos() {
        let _qos = tls::enter_qos(Qos::UTILITY);
        let item = WorkItem::with_options(WorkItemFlags::ASSIGN_CURRENT_CONTEXT, Qos::UNSPECIFIED, || {});
        assert_eq!(item.qos(), Qos::UTILITY);
        let item = WorkItem::with_options(WorkItemFlags::NO_QOS, Qos::USER_INITIATED, || {});
        assert_eq!(item.qos(), Qos::UNSPECIFIED);
    }

    #[test]
    fn test_enforced_qos_applies_on_queue() {
        let queue = Queue::builder("work_item.qos").qos(Qos::BACKGROUND).build();
        let (tx, rx) = mpsc::channel();
        let item = WorkItem::with_options(WorkItemFlags::ENFORCE_QOS, Qos::USER_INITIATED, move || {
            tx.send(tls::current_qos()).unwrap()
        });
        queue.submit_item(&item);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Qos::USER_INITIATED);
    }

    #[test]
    fn test_panicking_item_completes() {
        let item = WorkItem::new(|| panic!("item boom"));
        let waiter = {
            let item = item.clone();
            thread::spawn(move || item.wait_timeout(Duration::from_secs(5)))
        };
        Queue::concurrent("work_item.panic").submit_item(&item);
        assert_eq!(waiter.join().unwrap(), WaitResult::Success);
    }
}

//! Counting semaphore
//!
//! `wait` decrements and blocks while the value is negative; `signal`
//! increments and wakes one blocked waiter. A timed-out waiter gives its
//! decrement back. Waiting on a pool worker counts as blocking for pool
//! growth, same as `sync`.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dispatch_core::{usage_error, DispatchTime, WaitResult};

use crate::worker::enter_blocking;
use crate::{lock, wait_deadline};

struct State {
    value: isize,
    /// Signals handed to blocked waiters but not yet consumed
    wakeups: usize,
}

struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<Inner>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &lock(&self.inner.state).value)
            .finish()
    }
}

impl Semaphore {
    /// A negative initial value is a usage error
    pub fn new(value: isize) -> Self {
        if value < 0 {
            usage_error("semaphore created with a negative value");
        }
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State { value, wakeups: 0 }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Returns `true` if a blocked waiter was woken
    pub fn signal(&self) -> bool {
        let mut state = lock(&self.inner.state);
        state.value += 1;
        if state.value > 0 {
            return false;
        }
        state.wakeups += 1;
        drop(state);
        self.inner.cond.notify_one();
        true
    }

    pub fn wait(&self) {
        self.wait_until(DispatchTime::DISTANT_FUTURE);
    }

    pub fn wait_until(&self, deadline: DispatchTime) -> WaitResult {
        let mut state = lock(&self.inner.state);
        state.value -= 1;
        if state.value >= 0 {
            return WaitResult::Success;
        }
        drop(state);

        let _blocking = enter_blocking();
        let state = lock(&self.inner.state);
        let (mut state, timed_out) =
            wait_deadline(&self.inner.cond, state, deadline, |s| s.wakeups == 0);
        if timed_out {
            state.value += 1;
            WaitResult::TimedOut
        } else {
            state.wakeups -= 1;
            WaitResult::Success
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_until(DispatchTime::after(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use crate::queue::Queue;

    #[test]
    fn test_counts_down() {
        let sem = Semaphore::new(2);
        assert_eq!(sem.wait_timeout(Duration::ZERO), WaitResult::Success);
        assert_eq!(sem.wait_timeout(Duration::ZERO), WaitResult::Success);
        assert_eq!(sem.wait_timeout(Duration::from_millis(10)), WaitResult::TimedOut);
        // The timed-out wait gave its decrement back
        assert!(!sem.signal());
        assert_eq!(sem.wait_timeout(Duration::ZERO), WaitResult::Success);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let sem = Semaphore::new(0);
        let s = sem.clone();
        let waiter = thread::spawn(move || s.wait_timeout(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(20));
        assert!(sem.signal());
        assert_eq!(waiter.join().unwrap(), WaitResult::Success);
    }

    #[test]
    fn test_limits_concurrency() {
        let sem = Semaphore::new(2);
        let queue = Queue::concurrent("semaphore.limit");
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let group = crate::group::Group::new();
        for _ in 0..8 {
            let (sem, running, peak) = (sem.clone(), Arc::clone(&running), Arc::clone(&peak));
            queue.submit_in_group(&group, move || {
                sem.wait();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                sem.signal();
            });
        }
        assert_eq!(group.wait_timeout(Duration::from_secs(10)), WaitResult::Success);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_negative_value_is_usage_error() {
        assert!(std::panic::catch_unwind(|| Semaphore::new(-1)).is_err());
    }
}

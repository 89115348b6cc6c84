//! Timer thread
//!
//! The thread is started by the first `arm`. Each iteration:
//! 1. Reads the parking epoch
//! 2. Polls the backend and fires every expired entry
//! 3. Sleeps until the backend's next wakeup (bounded by `timer_max_sleep`)
//!
//! Arming bumps the epoch after inserting, so an entry armed while the
//! thread is between steps 1 and 3 cuts the sleep short.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dispatch_core::time::monotonic_now_ns;

use crate::config::RuntimeConfig;
use crate::job::{self, Job};
use crate::lock;
use crate::parking::{new_parking, ThreadParking};
use crate::queue::Queue;
use crate::timer::{HeapTimerBackend, TimerBackend, TimerEntry, TimerHandle, TimerPayload};

pub(crate) struct TimerService {
    backend: Box<dyn TimerBackend>,
    parking: Box<dyn ThreadParking>,
    started: Mutex<bool>,
    max_sleep: Duration,
    min_leeway: u64,
    fired: AtomicU64,
}

impl TimerService {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            backend: Box::new(HeapTimerBackend::new()),
            parking: new_parking(),
            started: Mutex::new(false),
            max_sleep: config.timer_max_sleep,
            min_leeway: config.timer_min_leeway.as_nanos().min(u64::MAX as u128) as u64,
            fired: AtomicU64::new(0),
        })
    }

    /// Slack floor for non-strict timers, ns
    #[inline]
    pub fn min_leeway(&self) -> u64 {
        self.min_leeway
    }

    /// Arm a timer firing no earlier than `deadline` and, load permitting,
    /// no later than `deadline + leeway`
    pub fn arm(self: &Arc<Self>, deadline: u64, leeway: u64, payload: TimerPayload) -> TimerHandle {
        let handle = self.backend.insert(TimerEntry::new(deadline, leeway, payload));
        self.ensure_started();
        self.parking.wake_one();
        handle
    }

    /// Returns `false` if the timer already fired or was never armed
    pub fn disarm(&self, handle: TimerHandle) -> bool {
        self.backend.cancel(handle).is_some()
    }

    /// Run `f` on the timer thread at `at`
    pub fn call_at(self: &Arc<Self>, at: u64, f: Box<dyn FnOnce() + Send>) -> TimerHandle {
        self.arm(at, 0, TimerPayload::Call(f))
    }

    /// Hand `job` to `queue` at `deadline`
    pub(crate) fn enqueue_at(
        self: &Arc<Self>,
        deadline: u64,
        leeway: u64,
        queue: Queue,
        job: Job,
    ) -> TimerHandle {
        self.arm(deadline, leeway, TimerPayload::Enqueue { queue, job })
    }

    /// Number of armed timers
    pub fn armed(&self) -> usize {
        self.backend.len()
    }

    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut started = lock(&self.started);
        if *started {
            return;
        }
        let this = Arc::clone(self);
        match thread::Builder::new()
            .name("dispatch-timer".into())
            .spawn(move || this.run())
        {
            Ok(_) => {
                *started = true;
                tracing::debug!(backend = self.backend.name(), "timer thread started");
            }
            Err(e) => {
                // Armed entries stay put; the next arm tries again
                tracing::warn!(error = %e, "failed to start timer thread");
            }
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            let epoch = self.parking.epoch();
            let now = monotonic_now_ns();

            let expired = self.backend.poll_expired(now);
            if !expired.is_empty() {
                self.fired.fetch_add(expired.len() as u64, Ordering::Relaxed);
                for entry in expired {
                    self.fire(entry, now);
                }
                continue;
            }

            let timeout = match self.backend.next_wakeup() {
                Some(at) => Duration::from_nanos(at.saturating_sub(now)).min(self.max_sleep),
                None => self.max_sleep,
            };
            if !timeout.is_zero() {
                self.parking.park(epoch, Some(timeout));
            }
        }
    }

    fn fire(&self, entry: TimerEntry, now: u64) {
        let handle = entry.handle;
        match entry.payload {
            TimerPayload::Enqueue { queue, job } => queue.push_job(job),
            TimerPayload::Source(source) => {
                if let Some(core) = source.upgrade() {
                    core.timer_fired(handle, now);
                }
            }
            TimerPayload::Call(f) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
                    tracing::error!(
                        timer = handle.raw(),
                        "timer callback panicked: {}",
                        job::panic_message(&payload)
                    );
                }
            }
        }
    }
}

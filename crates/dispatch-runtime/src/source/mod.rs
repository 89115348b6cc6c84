//! Event sources
//!
//! A [`Source`] turns external events (timer expiry, descriptor readiness,
//! signals, application-merged data) into handler invocations on a target
//! queue.
//!
//! # Lifecycle
//!
//! ```text
//!   Created ──activate/resume──► Resumed ◄──suspend/resume──► Suspended
//!      │                            │                            │
//!      └───────────── cancel ───────┴────────────────────────────┘
//!                                   ▼
//!                              Cancelling ──cancel handler done──► Cancelled
//! ```
//!
//! Handler work is a chain of single jobs on the target queue, never more
//! than one at a time: first the registration step, then event
//! deliveries, finally the cancel handler. Each job picks the next step
//! when it finishes. Nothing runs while the source is suspended or not yet
//! activated; events keep accumulating into the pending data.
//!
//! An activated source keeps itself alive until its cancel handler has
//! run.

#[cfg(unix)]
mod reactor;

#[cfg(unix)]
pub(crate) use reactor::{OsRegistration, Reactor};

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use dispatch_core::time::monotonic_now_ns;
use dispatch_core::{
    usage_error, Deadline, DispatchError, DispatchResult, DispatchTime, Qos, QosClass,
    TimeInterval, WaitResult, WorkItemFlags,
};

use crate::job::Job;
use crate::queue::Queue;
use crate::runtime::runtime;
use crate::timer::{TimerHandle, TimerPayload, TimerSpec};
use crate::worker::enter_blocking;
use crate::{lock, wait_deadline};

/// What a source observes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Timer,
    /// Descriptor has bytes to read; data is the byte count
    Read,
    /// Descriptor has buffer space; data is 1
    Write,
    /// Signal delivered; data is the count since the last delivery
    Signal,
    /// Merged values are summed
    DataAdd,
    /// Merged values are or-ed together
    DataOr,
    /// Each merged value replaces the previous one
    DataReplace,
}

/// Observable lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Created,
    Resumed,
    Suspended,
    Cancelling,
    Cancelled,
}

/// Creation flags for timer sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimerFlags(u32);

impl TimerFlags {
    pub const NONE: TimerFlags = TimerFlags(0);
    /// Honor the requested leeway exactly; no runtime slack floor
    pub const STRICT: TimerFlags = TimerFlags(1);

    #[inline]
    pub const fn contains(&self, other: TimerFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

type EventHandler = Arc<dyn Fn() + Send + Sync>;
type CancelHandler = Box<dyn FnOnce() + Send>;
type RegistrationHandler = Box<dyn FnOnce(DispatchResult<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Register,
    Deliver,
    Cancel,
}

struct CoreState {
    activated: bool,
    suspend_count: usize,
    registered: bool,
    cancel_requested: bool,
    finished: bool,
    /// A step job is queued or running
    busy: bool,

    pending: u64,
    /// Descriptor readiness seen; delivers even when `pending` is zero
    has_event: bool,
    last_data: u64,
    error: Option<DispatchError>,

    event_handler: Option<EventHandler>,
    cancel_handler: Option<CancelHandler>,
    registration_handler: Option<RegistrationHandler>,

    timer: TimerSpec,
    timer_handle: Option<TimerHandle>,
    #[cfg(unix)]
    os: Option<OsRegistration>,

    /// Keeps the core alive from activation until the cancel handler ran
    pin: Option<Arc<SourceCore>>,
}

pub(crate) struct SourceCore {
    kind: SourceKind,
    handle: i32,
    mask: u64,
    strict: bool,
    queue: Queue,
    state: Mutex<CoreState>,
    cond: Condvar,
}

/// Shared handle to an event source
#[derive(Clone)]
pub struct Source {
    core: Arc<SourceCore>,
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("kind", &self.core.kind)
            .field("handle", &self.core.handle)
            .field("state", &self.state())
            .finish()
    }
}

impl Source {
    fn new(kind: SourceKind, handle: i32, mask: u64, strict: bool, queue: Option<&Queue>) -> Self {
        let queue = queue
            .cloned()
            .unwrap_or_else(|| Queue::global(QosClass::Default));
        Self {
            core: Arc::new(SourceCore {
                kind,
                handle,
                mask,
                strict,
                queue,
                state: Mutex::new(CoreState {
                    activated: false,
                    suspend_count: 0,
                    registered: false,
                    cancel_requested: false,
                    finished: false,
                    busy: false,
                    pending: 0,
                    has_event: false,
                    last_data: 0,
                    error: None,
                    event_handler: None,
                    cancel_handler: None,
                    registration_handler: None,
                    timer: TimerSpec::DISARMED,
                    timer_handle: None,
                    #[cfg(unix)]
                    os: None,
                    pin: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    // ---------------------------------------------------------------------
    // Factories; `queue = None` targets the default global queue
    // ---------------------------------------------------------------------

    /// Timer source; arm it with [`schedule`](Self::schedule)
    pub fn timer(flags: TimerFlags, queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::Timer, 0, 0, flags.contains(TimerFlags::STRICT), queue)
    }

    pub fn read(fd: i32, queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::Read, fd, 0, false, queue)
    }

    pub fn write(fd: i32, queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::Write, fd, 0, false, queue)
    }

    pub fn signal(signo: i32, queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::Signal, signo, 0, false, queue)
    }

    pub fn data_add(queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::DataAdd, 0, 0, false, queue)
    }

    pub fn data_or(queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::DataOr, 0, 0, false, queue)
    }

    /// Or-merging source that ignores bits outside `mask`
    pub fn data_or_masked(mask: u64, queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::DataOr, 0, mask, false, queue)
    }

    pub fn data_replace(queue: Option<&Queue>) -> Self {
        Self::new(SourceKind::DataReplace, 0, 0, false, queue)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn kind(&self) -> SourceKind {
        self.core.kind
    }

    /// Descriptor or signal number, 0 for other kinds
    pub fn handle(&self) -> i32 {
        self.core.handle
    }

    pub fn mask(&self) -> u64 {
        self.core.mask
    }

    pub fn queue(&self) -> &Queue {
        &self.core.queue
    }

    /// Data of the delivery in progress, or of the most recent one
    pub fn data(&self) -> u64 {
        lock(&self.core.state).last_data
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.core.state).cancel_requested
    }

    /// Registration failure, if any; such a source is cancelled
    pub fn error(&self) -> Option<DispatchError> {
        lock(&self.core.state).error.clone()
    }

    pub fn state(&self) -> SourceState {
        let st = lock(&self.core.state);
        if st.finished {
            SourceState::Cancelled
        } else if st.cancel_requested {
            SourceState::Cancelling
        } else if !st.activated {
            SourceState::Created
        } else if st.suspend_count > 0 {
            SourceState::Suspended
        } else {
            SourceState::Resumed
        }
    }

    // ---------------------------------------------------------------------
    // Handlers
    // ---------------------------------------------------------------------

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut st = lock(&self.core.state);
        if !st.finished {
            st.event_handler = Some(Arc::new(handler));
        }
    }

    /// Runs exactly once, after the last event delivery and after the OS
    /// registration is released
    pub fn set_cancel_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut st = lock(&self.core.state);
        if !st.finished {
            st.cancel_handler = Some(Box::new(handler));
        }
    }

    /// Runs once before any event delivery with the outcome of registering
    /// the source with the OS
    pub fn set_registration_handler<F>(&self, handler: F)
    where
        F: FnOnce(DispatchResult<()>) + Send + 'static,
    {
        let mut st = lock(&self.core.state);
        if !st.registered {
            st.registration_handler = Some(Box::new(handler));
        }
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Start delivering events; no effect once activated
    pub fn activate(&self) {
        let job = {
            let mut st = lock(&self.core.state);
            if st.activated {
                return;
            }
            st.activated = true;
            st.pin = Some(Arc::clone(&self.core));
            self.core.arm_timer_locked(&mut st);
            self.core.next_job(&mut st)
        };
        self.core.submit(job);
    }

    pub fn suspend(&self) {
        lock(&self.core.state).suspend_count += 1;
    }

    /// Balance a [`suspend`](Self::suspend); activates a source that was
    /// never activated
    ///
    /// Resuming an active, unsuspended source is a usage error.
    pub fn resume(&self) {
        let job = {
            let mut st = lock(&self.core.state);
            if st.suspend_count > 0 {
                st.suspend_count -= 1;
                if st.suspend_count > 0 || !st.activated {
                    return;
                }
                self.core.arm_timer_locked(&mut st);
                self.core.next_job(&mut st)
            } else if !st.activated {
                drop(st);
                self.activate();
                return;
            } else {
                drop(st);
                usage_error("resume of a source that is not suspended");
            }
        };
        self.core.submit(job);
    }

    /// Stop event delivery and schedule the cancel handler
    ///
    /// Only the first call has an effect. The OS registration is released
    /// before this returns; the cancel handler runs on the target queue
    /// once no handler is in flight (and once the source is activated and
    /// not suspended).
    pub fn cancel(&self) {
        let job = {
            let mut st = lock(&self.core.state);
            if st.cancel_requested {
                return;
            }
            st.cancel_requested = true;
            self.core.release_os_locked(&mut st);
            self.core.next_job(&mut st)
        };
        self.core.submit(job);
    }

    /// Block until the cancel handler has finished
    pub fn wait_cancelled(&self) {
        self.wait_cancelled_until(DispatchTime::DISTANT_FUTURE);
    }

    pub fn wait_cancelled_timeout(&self, timeout: Duration) -> WaitResult {
        self.wait_cancelled_until(DispatchTime::after(timeout))
    }

    fn wait_cancelled_until(&self, deadline: DispatchTime) -> WaitResult {
        let _blocking = enter_blocking();
        let st = lock(&self.core.state);
        let (_st, timed_out) = wait_deadline(&self.core.cond, st, deadline, |st| !st.finished);
        if timed_out {
            WaitResult::TimedOut
        } else {
            WaitResult::Success
        }
    }

    // ---------------------------------------------------------------------
    // Data and timers
    // ---------------------------------------------------------------------

    /// Merge a value into a user-data source
    ///
    /// Zero never triggers a delivery. Merging into other kinds is a usage
    /// error.
    pub fn merge_data(&self, value: u64) {
        let job = {
            let mut st = lock(&self.core.state);
            if st.cancel_requested {
                return;
            }
            match self.core.kind {
                SourceKind::DataAdd => st.pending = st.pending.saturating_add(value),
                SourceKind::DataOr => {
                    let value = if self.core.mask == 0 {
                        value
                    } else {
                        value & self.core.mask
                    };
                    st.pending |= value;
                }
                SourceKind::DataReplace => st.pending = value,
                _ => {
                    drop(st);
                    usage_error("merge_data on a source that is not a user-data source");
                }
            }
            self.core.next_job(&mut st)
        };
        self.core.submit(job);
    }

    /// Arm a timer source: first fire at `deadline`, then every `interval`
    /// (`TimeInterval::never()` for one-shot), each within `leeway`
    ///
    /// Clears fires accumulated so far. No effect after cancel. Calling
    /// this on a non-timer source is a usage error.
    pub fn schedule(&self, deadline: impl Into<Deadline>, interval: TimeInterval, leeway: TimeInterval) {
        if self.core.kind != SourceKind::Timer {
            usage_error("schedule on a source that is not a timer");
        }
        let deadline = deadline.into().resolve();
        let mut st = lock(&self.core.state);
        if st.cancel_requested {
            return;
        }
        if let Some(handle) = st.timer_handle.take() {
            runtime().timers().disarm(handle);
        }
        st.pending = 0;
        st.timer = TimerSpec::new(deadline, interval, leeway);
        self.core.arm_timer_locked(&mut st);
    }

    /// [`schedule`](Self::schedule) with the interval in fractional seconds
    pub fn schedule_secs(&self, deadline: impl Into<Deadline>, interval_secs: f64, leeway: TimeInterval) {
        self.schedule(deadline, TimeInterval::from_secs_f64(interval_secs), leeway);
    }
}

impl SourceCore {
    fn submit(&self, job: Option<Job>) {
        if let Some(job) = job {
            self.queue.push_job(job);
        }
    }

    fn next_step(&self, st: &CoreState) -> Option<Step> {
        if st.busy || st.finished || !st.activated || st.suspend_count > 0 {
            return None;
        }
        if st.cancel_requested {
            Some(Step::Cancel)
        } else if !st.registered {
            Some(Step::Register)
        } else if st.pending != 0 || st.has_event {
            Some(Step::Deliver)
        } else {
            None
        }
    }

    /// Claim the next step, returning the job that runs it
    fn next_job(self: &Arc<Self>, st: &mut CoreState) -> Option<Job> {
        let step = self.next_step(st)?;
        st.busy = true;
        let core = Arc::clone(self);
        let qos = self.queue.resolve_qos(Qos::UNSPECIFIED, WorkItemFlags::NONE);
        Some(Job::new(Box::new(move || core.run_step(step)), qos, false))
    }

    fn run_step(self: Arc<Self>, step: Step) {
        match step {
            Step::Register => {
                let _next = StepDone {
                    core: Arc::clone(&self),
                    rearm: false,
                };
                self.register();
            }
            Step::Deliver => {
                let _next = StepDone {
                    core: Arc::clone(&self),
                    rearm: matches!(self.kind, SourceKind::Read | SourceKind::Write),
                };
                self.deliver();
            }
            Step::Cancel => {
                let _finish = CancelDone(Arc::clone(&self));
                let handler = lock(&self.state).cancel_handler.take();
                if let Some(handler) = handler {
                    handler();
                }
            }
        }
    }

    fn register(self: &Arc<Self>) {
        let result = self.register_os();
        let handler = {
            let mut st = lock(&self.state);
            st.registered = true;
            if let Err(e) = &result {
                tracing::warn!(kind = ?self.kind, handle = self.handle, error = %e, "source registration failed");
                st.error = Some(e.clone());
                st.cancel_requested = true;
                self.release_os_locked(&mut st);
            }
            st.registration_handler.take()
        };
        if let Some(handler) = handler {
            handler(result);
        }
    }

    #[cfg(unix)]
    fn register_os(self: &Arc<Self>) -> DispatchResult<()> {
        let reactor = match self.kind {
            SourceKind::Read | SourceKind::Write | SourceKind::Signal => runtime().reactor()?,
            _ => return Ok(()),
        };
        let weak = Arc::downgrade(self);
        let registration = match self.kind {
            SourceKind::Signal => reactor.register_signal(self.handle, weak)?,
            kind => reactor.register_fd(self.handle, kind == SourceKind::Write, weak)?,
        };
        let mut st = lock(&self.state);
        if st.cancel_requested {
            drop(st);
            reactor.deregister(registration);
        } else {
            st.os = Some(registration);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn register_os(self: &Arc<Self>) -> DispatchResult<()> {
        match self.kind {
            SourceKind::Read | SourceKind::Write | SourceKind::Signal => Err(DispatchError::Os {
                op: "register",
                errno: 38, // ENOSYS
            }),
            _ => Ok(()),
        }
    }

    fn deliver(&self) {
        let handler = {
            let mut st = lock(&self.state);
            if st.cancel_requested {
                return;
            }
            st.last_data = st.pending;
            st.pending = 0;
            st.has_event = false;
            st.event_handler.clone()
        };
        if let Some(handler) = handler {
            handler();
        }
    }

    /// Drop the timer and OS registration
    fn release_os_locked(&self, st: &mut CoreState) {
        if let Some(handle) = st.timer_handle.take() {
            runtime().timers().disarm(handle);
        }
        #[cfg(unix)]
        if let Some(registration) = st.os.take() {
            if let Ok(reactor) = runtime().reactor() {
                reactor.deregister(registration);
            }
        }
    }

    /// Arm the timer for the current spec if the source may fire now
    fn arm_timer_locked(self: &Arc<Self>, st: &mut CoreState) {
        if self.kind != SourceKind::Timer
            || st.cancel_requested
            || !st.activated
            || st.suspend_count > 0
            || st.timer_handle.is_some()
            || !st.timer.is_armed()
        {
            return;
        }
        let now = monotonic_now_ns();
        if st.timer.fired_once && st.timer.target <= now {
            // Periods missed while suspended collapse into one delivery
            st.pending = st.pending.saturating_add(st.timer.advance(now));
            if !st.timer.is_armed() {
                return;
            }
        }
        let timers = runtime().timers();
        let mut window = st.timer.window();
        if !self.strict {
            window = window.max(timers.min_leeway());
        }
        st.timer_handle = Some(timers.arm(
            st.timer.target,
            window,
            TimerPayload::Source(Arc::downgrade(self)),
        ));
    }

    /// Called by the timer thread
    pub(crate) fn timer_fired(self: &Arc<Self>, handle: TimerHandle, now: u64) {
        let job = {
            let mut st = lock(&self.state);
            if st.timer_handle != Some(handle) {
                return;
            }
            st.timer_handle = None;
            if st.cancel_requested {
                return;
            }
            st.pending = st.pending.saturating_add(st.timer.advance(now));
            self.arm_timer_locked(&mut st);
            self.next_job(&mut st)
        };
        self.submit(job);
    }

    /// Called by the reactor when the descriptor is ready
    #[cfg(unix)]
    pub(crate) fn readiness(self: &Arc<Self>, count: u64) {
        let job = {
            let mut st = lock(&self.state);
            if st.cancel_requested {
                return;
            }
            st.pending = count;
            st.has_event = true;
            self.next_job(&mut st)
        };
        self.submit(job);
    }

    /// Called by the reactor with the number of signals since last call
    #[cfg(unix)]
    pub(crate) fn signal_fired(self: &Arc<Self>, count: u64) {
        let job = {
            let mut st = lock(&self.state);
            if st.cancel_requested {
                return;
            }
            st.pending = st.pending.saturating_add(count);
            self.next_job(&mut st)
        };
        self.submit(job);
    }

    #[cfg(unix)]
    fn rearm_os(&self) {
        let st = lock(&self.state);
        if st.cancel_requested {
            return;
        }
        if let Some(registration) = &st.os {
            if let Ok(reactor) = runtime().reactor() {
                reactor.rearm(registration);
            }
        }
    }

    #[cfg(not(unix))]
    fn rearm_os(&self) {}
}

/// Ends a register/deliver step and starts the next one, even if the
/// handler unwinds
struct StepDone {
    core: Arc<SourceCore>,
    rearm: bool,
}

impl Drop for StepDone {
    fn drop(&mut self) {
        if self.rearm {
            self.core.rearm_os();
        }
        let job = {
            let mut st = lock(&self.core.state);
            st.busy = false;
            self.core.next_job(&mut st)
        };
        self.core.submit(job);
    }
}

/// Final transition once the cancel handler returned or unwound
struct CancelDone(Arc<SourceCore>);

impl Drop for CancelDone {
    fn drop(&mut self) {
        let (pin, handlers) = {
            let mut st = lock(&self.0.state);
            st.finished = true;
            st.busy = false;
            let handlers = (st.event_handler.take(), st.registration_handler.take());
            (st.pin.take(), handlers)
        };
        self.0.cond.notify_all();
        // Handlers may own the last outside handle; drop them unlocked
        drop(handlers);
        drop(pin);
    }
}

#[cfg(test)]
mod tests;

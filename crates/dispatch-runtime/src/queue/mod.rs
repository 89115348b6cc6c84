//! Dispatch queues
//!
//! A [`Queue`] is a shared handle. Two kinds of queue exist:
//!
//! - **Root queues** (`Queue::global(qos)`, `Queue::main()`) own an
//!   execution resource: the worker pool or the dedicated main thread.
//! - **Custom queues** (`Queue::serial`, `Queue::concurrent`,
//!   `Queue::builder`) hold a FIFO of pending jobs and forward runnable
//!   ones to their target. Without an explicit target a custom queue
//!   targets the global queue of its QoS class.
//!
//! A custom queue forwards its head job when the queue is active, not
//! suspended, and:
//! - serial: nothing of this queue is in flight
//! - concurrent, plain item: no barrier is running
//! - concurrent, barrier: nothing of this queue is in flight
//!
//! Forwarded jobs are wrapped so that their completion re-runs this check.
//! Every hop also pushes an execution frame (see [`crate::tls`]) which
//! drives `sync` deadlock detection, preconditions and
//! [`Queue::current_specific`].

mod apply;
mod specific;

pub use specific::SpecificKey;

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use dispatch_core::{usage_error, Deadline, Qos, QosClass, WorkItemFlags};

use crate::group::Group;
use crate::job::{Job, Latch};
use crate::lock;
use crate::runtime::runtime;
use crate::tls;
use crate::work_item::WorkItem;
use crate::worker::{enter_blocking, DedicatedThread, WorkerPool};

use specific::{Slot, SpecificMap};

/// Ordering discipline of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// One item at a time, in submission order
    Serial,
    /// Items may run in parallel; barriers run alone
    Concurrent,
}

/// Autorelease-pool hint, recorded but not acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoreleaseFrequency {
    #[default]
    Inherit,
    WorkItem,
    Never,
}

/// Assertion about the calling thread's relation to a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// Running on the queue or on a queue targeting it
    OnQueue,
    /// Running on the queue with exclusive access
    OnQueueAsBarrier,
    /// Not running on the queue
    NotOnQueue,
}

/// Per-submission options for [`Queue::submit_with`]
#[derive(Clone, Copy, Default)]
pub struct SubmitOptions<'a> {
    pub group: Option<&'a Group>,
    pub qos: Option<Qos>,
    pub flags: WorkItemFlags,
}

impl<'a> SubmitOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: &'a Group) -> Self {
        self.group = Some(group);
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn flags(mut self, flags: WorkItemFlags) -> Self {
        self.flags = flags;
        self
    }
}

enum Role {
    Global(Arc<WorkerPool>),
    Main(Arc<DedicatedThread>),
    Custom,
}

/// Entry in a custom queue's FIFO
enum Pending {
    Job(Job),
    /// A thread that runs work inline once this queue grants it a slot
    Caller(Arc<Latch>),
}

impl Pending {
    fn barrier(&self) -> bool {
        match self {
            Pending::Job(job) => job.barrier,
            Pending::Caller(_) => false,
        }
    }
}

struct PumpState {
    items: VecDeque<Pending>,
    in_flight: usize,
    /// An exclusive item (serial item or barrier) is running
    exclusive_running: bool,
    suspend_count: usize,
    active: bool,
}

pub(crate) struct QueueInner {
    label: String,
    kind: QueueKind,
    qos: Qos,
    autorelease: AutoreleaseFrequency,
    role: Role,
    target: RwLock<Option<Queue>>,
    state: Mutex<PumpState>,
    specifics: Mutex<SpecificMap>,
    context: Mutex<Option<Slot>>,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let suspended = state.suspend_count > 0;

        let specifics = self
            .specifics
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain();
        for slot in specifics {
            slot.finish();
        }
        if let Some(context) = self.context.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            context.finish();
        }

        if suspended && !thread::panicking() {
            usage_error(&format!("queue '{}' destroyed while suspended", self.label));
        }
    }
}

/// Shared handle to a dispatch queue
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl PartialEq for Queue {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Queue {}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("label", &self.inner.label)
            .field("kind", &self.inner.kind)
            .field("qos", &self.inner.qos)
            .finish()
    }
}

/// Builder for custom queues
#[derive(Debug, Clone)]
pub struct QueueBuilder {
    label: String,
    kind: QueueKind,
    qos: Qos,
    inactive: bool,
    autorelease: AutoreleaseFrequency,
    target: Option<Queue>,
}

impl QueueBuilder {
    pub fn concurrent(mut self) -> Self {
        self.kind = QueueKind::Concurrent;
        self
    }

    pub fn serial(mut self) -> Self {
        self.kind = QueueKind::Serial;
        self
    }

    pub fn qos(mut self, qos: Qos) -> Self {
        self.qos = qos;
        self
    }

    /// The queue runs nothing until [`Queue::activate`]
    pub fn initially_inactive(mut self) -> Self {
        self.inactive = true;
        self
    }

    pub fn autorelease_frequency(mut self, frequency: AutoreleaseFrequency) -> Self {
        self.autorelease = frequency;
        self
    }

    pub fn target(mut self, target: &Queue) -> Self {
        self.target = Some(target.clone());
        self
    }

    pub fn build(self) -> Queue {
        let queue = Queue::with_role(
            self.label,
            self.kind,
            self.qos,
            self.autorelease,
            Role::Custom,
            !self.inactive,
        );
        if let Some(target) = self.target {
            queue.set_target(&target);
        }
        queue
    }
}

impl Queue {
    fn with_role(
        label: String,
        kind: QueueKind,
        qos: Qos,
        autorelease: AutoreleaseFrequency,
        role: Role,
        active: bool,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label,
                kind,
                qos,
                autorelease,
                role,
                target: RwLock::new(None),
                state: Mutex::new(PumpState {
                    items: VecDeque::new(),
                    in_flight: 0,
                    exclusive_running: false,
                    suspend_count: 0,
                    active,
                }),
                specifics: Mutex::new(SpecificMap::default()),
                context: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn new_global(class: QosClass, pool: Arc<WorkerPool>) -> Self {
        Self::with_role(
            format!("dispatch.global.{}", class.name()),
            QueueKind::Concurrent,
            Qos::new(class),
            AutoreleaseFrequency::Never,
            Role::Global(pool),
            true,
        )
    }

    pub(crate) fn new_main(thread: Arc<DedicatedThread>) -> Self {
        Self::with_role(
            "dispatch.main".into(),
            QueueKind::Serial,
            Qos::USER_INTERACTIVE,
            AutoreleaseFrequency::Never,
            Role::Main(thread),
            true,
        )
    }

    /// Start building a serial queue
    pub fn builder(label: impl Into<String>) -> QueueBuilder {
        QueueBuilder {
            label: label.into(),
            kind: QueueKind::Serial,
            qos: Qos::UNSPECIFIED,
            inactive: false,
            autorelease: AutoreleaseFrequency::Inherit,
            target: None,
        }
    }

    pub fn serial(label: impl Into<String>) -> Self {
        Self::builder(label).build()
    }

    pub fn concurrent(label: impl Into<String>) -> Self {
        Self::builder(label).concurrent().build()
    }

    /// Shared concurrent root queue for a QoS class
    ///
    /// `Unspecified` maps to the default class.
    pub fn global(class: QosClass) -> Self {
        runtime().global(class)
    }

    /// Serial root queue drained by the `dispatch-main` thread
    pub fn main() -> Self {
        runtime().main_queue()
    }

    /// Innermost queue executing on the calling thread
    pub fn current() -> Option<Self> {
        tls::current_queue()
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Queue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    pub fn is_concurrent(&self) -> bool {
        self.inner.kind == QueueKind::Concurrent
    }

    /// QoS requested at creation
    pub fn qos(&self) -> Qos {
        self.inner.qos
    }

    pub fn autorelease_frequency(&self) -> AutoreleaseFrequency {
        self.inner.autorelease
    }

    #[inline]
    fn is_root(&self) -> bool {
        !matches!(self.inner.role, Role::Custom)
    }

    fn explicit_target(&self) -> Option<Queue> {
        self.inner
            .target
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queue this one forwards its work to, `None` for root queues
    pub fn target(&self) -> Option<Queue> {
        if self.is_root() {
            return None;
        }
        Some(
            self.explicit_target()
                .unwrap_or_else(|| Queue::global(self.inner.qos.class())),
        )
    }

    /// This queue followed by every queue it delegates to, root last
    pub(crate) fn chain(&self) -> Vec<Queue> {
        let mut chain = vec![self.clone()];
        let mut cursor = self.target();
        while let Some(queue) = cursor {
            cursor = queue.target();
            chain.push(queue);
        }
        chain
    }

    /// First QoS specified along the target chain, `DEFAULT` if none
    pub(crate) fn effective_qos(&self) -> Qos {
        if self.inner.qos.is_specified() {
            return self.inner.qos;
        }
        let mut cursor = self.explicit_target();
        while let Some(queue) = cursor {
            if queue.inner.qos.is_specified() {
                return queue.inner.qos;
            }
            cursor = queue.explicit_target();
        }
        Qos::DEFAULT
    }

    /// Redirect this queue's work to `target`
    ///
    /// Must happen before work is submitted. Creating a cycle is a usage
    /// error; retargeting a root queue is ignored.
    pub fn set_target(&self, target: &Queue) {
        if self.is_root() {
            tracing::warn!(queue = %self.inner.label, "ignoring set_target on a root queue");
            return;
        }
        if target.chain().iter().any(|q| q.ptr_eq(self)) {
            usage_error(&format!(
                "setting target of '{}' to '{}' creates a cycle",
                self.inner.label, target.inner.label
            ));
        }
        *self
            .inner
            .target
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(target.clone());
    }

    // ---------------------------------------------------------------------
    // Activation and suspension
    // ---------------------------------------------------------------------

    /// Start an initially inactive queue; no effect on active queues
    pub fn activate(&self) {
        let runnable = {
            let mut state = lock(&self.inner.state);
            if state.active {
                return;
            }
            state.active = true;
            self.take_runnable(&mut state)
        };
        self.forward(runnable);
    }

    pub fn suspend(&self) {
        if self.is_root() {
            tracing::warn!(queue = %self.inner.label, "ignoring suspend of a root queue");
            return;
        }
        lock(&self.inner.state).suspend_count += 1;
    }

    pub fn resume(&self) {
        if self.is_root() {
            tracing::warn!(queue = %self.inner.label, "ignoring resume of a root queue");
            return;
        }
        let runnable = {
            let mut state = lock(&self.inner.state);
            if state.suspend_count == 0 {
                None
            } else {
                state.suspend_count -= 1;
                Some(self.take_runnable(&mut state))
            }
        };
        match runnable {
            Some(jobs) => self.forward(jobs),
            None => usage_error(&format!(
                "resume of queue '{}' which is not suspended",
                self.inner.label
            )),
        }
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.inner.state).suspend_count > 0
    }

    // ---------------------------------------------------------------------
    // Pump
    // ---------------------------------------------------------------------

    /// Accept a job whose QoS is already resolved
    pub(crate) fn push_job(&self, job: Job) {
        match &self.inner.role {
            Role::Global(pool) => pool.submit(self.root_frame(job, false)),
            Role::Main(thread) => thread.submit(self.root_frame(job, true)),
            Role::Custom => {
                let runnable = {
                    let mut state = lock(&self.inner.state);
                    state.items.push_back(Pending::Job(job));
                    self.take_runnable(&mut state)
                };
                self.forward(runnable);
            }
        }
    }

    fn root_frame(&self, job: Job, exclusive: bool) -> Job {
        let queue = self.clone();
        job.wrap(move |inner| {
            let _frame = tls::enter_queue(&queue, exclusive);
            inner();
        })
    }

    fn take_runnable(&self, state: &mut PumpState) -> Vec<Pending> {
        let mut runnable = Vec::new();
        if !state.active || state.suspend_count > 0 {
            return runnable;
        }
        while !state.exclusive_running {
            let Some(head) = state.items.front() else {
                break;
            };
            let exclusive = self.inner.kind == QueueKind::Serial || head.barrier();
            if exclusive {
                if state.in_flight > 0 {
                    break;
                }
                state.exclusive_running = true;
            }
            if let Some(job) = state.items.pop_front() {
                state.in_flight += 1;
                runnable.push(job);
            }
        }
        runnable
    }

    fn forward(&self, runnable: Vec<Pending>) {
        if runnable.is_empty() {
            return;
        }
        let Some(target) = self.target() else {
            return;
        };
        for pending in runnable {
            let job = match pending {
                Pending::Job(job) => job,
                Pending::Caller(granted) => {
                    granted.set();
                    continue;
                }
            };
            let exclusive = self.inner.kind == QueueKind::Serial || job.barrier;
            let queue = self.clone();
            let mut job = job.wrap(move |inner| {
                let _done = Completion {
                    queue: queue.clone(),
                    exclusive,
                };
                let _frame = tls::enter_queue(&queue, exclusive);
                inner();
            });
            // Barriers only constrain the queue they were submitted to
            job.barrier = false;
            target.push_job(job);
        }
    }

    /// Occupy a plain (non-barrier) slot of a concurrent queue on the
    /// calling thread
    ///
    /// Waits until the queue is active and resumed, and until every barrier
    /// running or queued ahead has finished. The slot counts as in flight
    /// and must be given back with `complete(false)`. Root queues have no
    /// pump and grant immediately.
    fn acquire_inline(&self) {
        debug_assert_eq!(self.inner.kind, QueueKind::Concurrent);
        if self.is_root() {
            return;
        }
        let granted = Arc::new(Latch::new());
        let runnable = {
            let mut state = lock(&self.inner.state);
            let free = state.active
                && state.suspend_count == 0
                && !state.exclusive_running
                && state.items.is_empty();
            if free {
                state.in_flight += 1;
                return;
            }
            state.items.push_back(Pending::Caller(Arc::clone(&granted)));
            self.take_runnable(&mut state)
        };
        self.forward(runnable);
        if !granted.is_set() {
            let _blocking = enter_blocking();
            granted.wait();
        }
    }

    fn complete(&self, exclusive: bool) {
        let runnable = {
            let mut state = lock(&self.inner.state);
            state.in_flight -= 1;
            if exclusive {
                state.exclusive_running = false;
            }
            self.take_runnable(&mut state)
        };
        self.forward(runnable);
    }

    // ---------------------------------------------------------------------
    // Asynchronous submission
    // ---------------------------------------------------------------------

    pub(crate) fn resolve_qos(&self, item: Qos, flags: WorkItemFlags) -> Qos {
        flags.qos_override().resolve(item, self.effective_qos())
    }

    fn make_job<F>(&self, f: F, options: &SubmitOptions<'_>) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        let flags = options.flags;
        let item_qos = options.qos.unwrap_or_else(|| {
            if flags.contains(WorkItemFlags::DETACHED) || flags.contains(WorkItemFlags::NO_QOS) {
                Qos::UNSPECIFIED
            } else {
                tls::current_qos()
            }
        });
        let qos = self.resolve_qos(item_qos, flags);
        let thunk: Box<dyn FnOnce() + Send> = match options.group {
            Some(group) => {
                let leave = group.enter_scoped();
                Box::new(move || {
                    let _leave = leave;
                    f();
                })
            }
            None => Box::new(f),
        };
        Job::new(thunk, qos, flags.is_barrier())
    }

    /// Run `f` asynchronously
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_job(self.make_job(f, &SubmitOptions::default()));
    }

    /// Run `f` asynchronously with exclusive access to a concurrent queue
    pub fn submit_barrier<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with(SubmitOptions::new().flags(WorkItemFlags::BARRIER), f);
    }

    /// Run `f` asynchronously as part of `group`
    ///
    /// The group is entered before this returns and left once `f` returns.
    pub fn submit_in_group<F>(&self, group: &Group, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_with(SubmitOptions::new().group(group), f);
    }

    pub fn submit_with<F>(&self, options: SubmitOptions<'_>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push_job(self.make_job(f, &options));
    }

    /// Run a work item asynchronously; its flags and QoS apply
    pub fn submit_item(&self, item: &WorkItem) {
        self.push_job(self.item_job(item, None));
    }

    /// Run a work item asynchronously as part of `group`
    pub fn submit_item_in_group(&self, group: &Group, item: &WorkItem) {
        self.push_job(self.item_job(item, Some(group)));
    }

    fn item_job(&self, item: &WorkItem, group: Option<&Group>) -> Job {
        let qos = self.resolve_qos(item.qos(), item.flags());
        let barrier = item.flags().is_barrier();
        let leave = group.map(Group::enter_scoped);
        let item = item.clone();
        Job::new(
            Box::new(move || {
                let _leave = leave;
                item.run_on_queue();
            }),
            qos,
            barrier,
        )
    }

    /// Run `f` on this queue no earlier than `deadline`
    ///
    /// Wall-clock deadlines are translated to the monotonic clock now.
    pub fn submit_after<F>(&self, deadline: impl Into<Deadline>, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = deadline.into().resolve();
        if deadline.is_distant_future() {
            return;
        }
        let job = self.make_job(f, &SubmitOptions::default());
        runtime()
            .timers()
            .enqueue_at(deadline.as_nanos(), 0, self.clone(), job);
    }

    // ---------------------------------------------------------------------
    // Synchronous submission
    // ---------------------------------------------------------------------

    /// Run `f` on this queue and wait for its result
    ///
    /// Panics raised by `f` resume on the caller. Calling this from work
    /// that would have to finish before `f` can start is a usage error.
    pub fn sync<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.sync_impl(false, Qos::UNSPECIFIED, WorkItemFlags::NONE, f)
    }

    /// [`sync`](Self::sync) with exclusive access to a concurrent queue
    pub fn sync_barrier<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.sync_impl(true, Qos::UNSPECIFIED, WorkItemFlags::NONE, f)
    }

    /// Run a work item on this queue and wait for it
    pub fn sync_item(&self, item: &WorkItem) {
        self.sync_impl(item.flags().is_barrier(), item.qos(), item.flags(), || {
            item.run_on_queue()
        });
    }

    fn sync_impl<F, R>(&self, barrier: bool, item_qos: Qos, flags: WorkItemFlags, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        self.check_sync_deadlock(barrier);

        let mut slot: Option<thread::Result<R>> = None;
        let latch = Arc::new(Latch::new());
        {
            let out = &mut slot;
            let body: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                *out = Some(panic::catch_unwind(AssertUnwindSafe(f)));
            });
            // SAFETY: this frame does not return before the latch is set,
            // and `SyncTask` drops the body before setting it, so nothing
            // borrowed by the body is used after this frame.
            let body: Box<dyn FnOnce() + Send + 'static> = unsafe { mem::transmute(body) };
            let task = SyncTask {
                body: Some(body),
                latch: Arc::clone(&latch),
            };
            let item_qos = if item_qos.is_specified() {
                item_qos
            } else {
                tls::current_qos()
            };
            let qos = self.resolve_qos(item_qos, flags);
            self.push_job(Job::new(Box::new(move || task.run()), qos, barrier));

            let _blocking = enter_blocking();
            latch.wait();
        }

        match slot {
            Some(Ok(value)) => value,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => usage_error(&format!(
                "sync work on queue '{}' was discarded before it ran",
                self.inner.label
            )),
        }
    }

    fn check_sync_deadlock(&self, barrier: bool) {
        let chain = self.chain();
        let deadlock = tls::with_frames(|frames| {
            frames.iter().any(|frame| {
                chain.iter().any(|queue| {
                    frame.queue.ptr_eq(queue)
                        && (frame.barrier || (barrier && !self.is_root() && queue.ptr_eq(self)))
                })
            })
        });
        if deadlock {
            usage_error(&format!(
                "sync on queue '{}' from work it would wait behind (deadlock)",
                self.inner.label
            ));
        }
    }

    // ---------------------------------------------------------------------
    // Preconditions, specifics and context
    // ---------------------------------------------------------------------

    /// Assert the calling thread's relation to this queue
    pub fn precondition(&self, predicate: Predicate) {
        let (on_queue, exclusive) = tls::with_frames(|frames| {
            frames
                .iter()
                .filter(|frame| frame.queue.ptr_eq(self))
                .fold((false, false), |(_, ex), frame| (true, ex || frame.barrier))
        });
        let holds = match predicate {
            Predicate::OnQueue => on_queue,
            Predicate::OnQueueAsBarrier => exclusive,
            Predicate::NotOnQueue => !on_queue,
        };
        if !holds {
            usage_error(&format!(
                "precondition {:?} failed for queue '{}'",
                predicate, self.inner.label
            ));
        }
    }

    pub fn set_specific<T>(&self, key: &SpecificKey<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.store_specific(key, Slot::new(value, None::<fn(Arc<T>)>));
    }

    /// Store a value whose `cleanup` runs once it is replaced, cleared or
    /// the queue is destroyed
    pub fn set_specific_with_cleanup<T, F>(&self, key: &SpecificKey<T>, value: T, cleanup: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        self.store_specific(key, Slot::new(value, Some(cleanup)));
    }

    fn store_specific<T>(&self, key: &SpecificKey<T>, slot: Slot) {
        let displaced = lock(&self.inner.specifics).insert(key.id(), slot);
        if let Some(old) = displaced {
            old.finish();
        }
    }

    pub fn clear_specific<T>(&self, key: &SpecificKey<T>) {
        let removed = lock(&self.inner.specifics).remove(key.id());
        if let Some(old) = removed {
            old.finish();
        }
    }

    /// Value stored on this queue itself
    pub fn get_specific<T>(&self, key: &SpecificKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        lock(&self.inner.specifics).get::<T>(key.id())
    }

    /// Value for `key` on the queue executing the caller, or on the
    /// nearest queue it targets
    pub fn current_specific<T>(key: &SpecificKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let current = tls::current_queue()?;
        current
            .chain()
            .iter()
            .find_map(|queue| queue.get_specific(key))
    }

    /// Attach a context value; `finalizer` runs with it when the queue is
    /// destroyed, after all of its work has run
    ///
    /// A context replaced before destruction is dropped without running
    /// its finalizer.
    pub fn set_context<T, F>(&self, value: T, finalizer: F)
    where
        T: Send + Sync + 'static,
        F: FnOnce(Arc<T>) + Send + 'static,
    {
        *lock(&self.inner.context) = Some(Slot::new(value, Some(finalizer)));
    }

    pub fn context<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        lock(&self.inner.context).as_ref().and_then(|slot| slot.get::<T>())
    }
}

/// Re-runs the pump of the queue that forwarded a job once it finishes
struct Completion {
    queue: Queue,
    exclusive: bool,
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.queue.complete(self.exclusive);
    }
}

/// Body of a `sync` call; releases the caller when run or discarded
struct SyncTask {
    body: Option<Box<dyn FnOnce() + Send>>,
    latch: Arc<Latch>,
}

impl SyncTask {
    fn run(mut self) {
        if let Some(body) = self.body.take() {
            body();
        }
    }
}

impl Drop for SyncTask {
    fn drop(&mut self) {
        self.body.take();
        self.latch.set();
    }
}

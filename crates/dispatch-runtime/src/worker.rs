//! Worker thread management
//!
//! Workers are OS threads that pull jobs from the shared [`ReadyQueue`].
//! Threads are created on demand and the pool tracks three counters:
//!
//! - `threads`: live pool threads
//! - `idle`: threads that found no work and are about to park or parked
//! - `blocked`: threads inside a blocking region (`sync`, `Group::wait`,
//!   `Semaphore::wait`, the tail of `apply`)
//!
//! Growth rule: when work is pushed and nobody is idle, a thread is spawned
//! if `threads - blocked < num_workers` and `threads < max_threads`. A worker
//! entering a blocking region re-runs that check, so a caller stuck in a wait
//! never starves other ready work. Threads that stay parked for
//! `idle_timeout` while the pool has more runnable threads than
//! `num_workers` retire.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use crossbeam_queue::SegQueue;
use dispatch_core::time::monotonic_now_ns;

use crate::config::RuntimeConfig;
use crate::job::{self, Job};
use crate::parking::{new_parking, ThreadParking};
use crate::ready_queue::{QosReadyQueue, ReadyQueue};
use crate::timer::TimerService;
use crate::{lock, tls};

/// Snapshot of pool counters
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub threads: usize,
    pub idle: usize,
    pub blocked: usize,
    pub queued: usize,
    pub executed: u64,
    pub spawned: u64,
    pub retired: u64,
    pub spawn_failures: u64,
}

/// Pool of worker threads
pub(crate) struct WorkerPool {
    ready: Box<dyn ReadyQueue>,
    parking: Box<dyn ThreadParking>,

    num_workers: usize,
    max_threads: usize,
    idle_spins: u32,
    idle_timeout: std::time::Duration,
    spawn_backoff_ns: u64,
    stack_size: Option<usize>,

    threads: AtomicUsize,
    idle: AtomicUsize,
    blocked: AtomicUsize,
    next_id: AtomicUsize,

    /// No spawn attempts before this monotonic time (ns)
    spawn_blocked_until: AtomicU64,

    /// Timer used to retry after a failed spawn
    retry_timer: OnceLock<Arc<TimerService>>,

    executed: AtomicU64,
    spawned: AtomicU64,
    retired: AtomicU64,
    spawn_failures: AtomicU64,
}

impl WorkerPool {
    pub fn new(config: &RuntimeConfig) -> Arc<Self> {
        let ready = Box::new(QosReadyQueue::new(config.fairness_interval));
        tracing::debug!(
            ready_queue = ready.name(),
            num_workers = config.num_workers,
            max_threads = config.max_threads,
            "worker pool created"
        );
        Arc::new(Self {
            ready,
            parking: new_parking(),
            num_workers: config.num_workers,
            max_threads: config.max_threads,
            idle_spins: config.idle_spins,
            idle_timeout: config.idle_timeout,
            spawn_backoff_ns: config.spawn_backoff.as_nanos().min(u64::MAX as u128) as u64,
            stack_size: config.stack_size,
            threads: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            blocked: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            spawn_blocked_until: AtomicU64::new(0),
            retry_timer: OnceLock::new(),
            executed: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            spawn_failures: AtomicU64::new(0),
        })
    }

    pub fn set_retry_timer(&self, timers: Arc<TimerService>) {
        let _ = self.retry_timer.set(timers);
    }

    /// Target number of runnable workers
    #[inline]
    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Make a job runnable and make sure some thread will pick it up
    pub fn submit(self: &Arc<Self>, job: Job) {
        self.ready.push(job);
        self.notify_work();
    }

    fn notify_work(self: &Arc<Self>) {
        if self.idle.load(Ordering::SeqCst) > 0 {
            self.parking.wake_one();
        } else {
            self.maybe_spawn();
        }
    }

    /// Spawn one thread if the growth rule allows it
    fn maybe_spawn(self: &Arc<Self>) {
        loop {
            let threads = self.threads.load(Ordering::SeqCst);
            let blocked = self.blocked.load(Ordering::SeqCst);
            if threads.saturating_sub(blocked) >= self.num_workers || threads >= self.max_threads {
                return;
            }
            if monotonic_now_ns() < self.spawn_blocked_until.load(Ordering::Acquire) {
                return;
            }
            if self
                .threads
                .compare_exchange(threads, threads + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new().name(format!("dispatch-worker-{}", id));
        if let Some(size) = self.stack_size {
            builder = builder.stack_size(size);
        }
        let pool = Arc::clone(self);
        match builder.spawn(move || pool.worker_main(id)) {
            Ok(_) => {
                self.spawned.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(worker = id, "worker spawned");
            }
            Err(e) => {
                self.threads.fetch_sub(1, Ordering::SeqCst);
                self.spawn_failures.fetch_add(1, Ordering::Relaxed);
                let retry_at = monotonic_now_ns().saturating_add(self.spawn_backoff_ns);
                self.spawn_blocked_until.store(retry_at, Ordering::Release);
                tracing::warn!(error = %e, "failed to spawn worker thread, backing off");
                self.schedule_retry(retry_at);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, at_ns: u64) {
        if let Some(timers) = self.retry_timer.get() {
            let pool = Arc::clone(self);
            timers.call_at(
                at_ns,
                Box::new(move || {
                    if !pool.ready.is_empty() {
                        pool.maybe_spawn();
                    }
                }),
            );
        }
    }

    fn worker_main(self: Arc<Self>, id: usize) {
        tls::set_worker_id(id);
        tracing::debug!(worker = id, "worker started");

        loop {
            if let Some(job) = self.find_work() {
                job::execute(job);
                self.executed.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            self.idle.fetch_add(1, Ordering::SeqCst);
            let epoch = self.parking.epoch();
            if !self.ready.is_empty() {
                self.idle.fetch_sub(1, Ordering::SeqCst);
                continue;
            }
            let woken = self.parking.park(epoch, Some(self.idle_timeout));
            self.idle.fetch_sub(1, Ordering::SeqCst);

            if !woken && self.ready.is_empty() && self.try_retire() {
                break;
            }
        }

        tls::set_worker_id(usize::MAX);
        tracing::debug!(worker = id, "worker retired");
    }

    fn find_work(&self) -> Option<Job> {
        if let Some(job) = self.ready.pop() {
            return Some(job);
        }
        for _ in 0..self.idle_spins {
            std::hint::spin_loop();
            if let Some(job) = self.ready.pop() {
                return Some(job);
            }
        }
        None
    }

    /// Leave the pool if it has more runnable threads than it needs
    fn try_retire(&self) -> bool {
        loop {
            let threads = self.threads.load(Ordering::SeqCst);
            let blocked = self.blocked.load(Ordering::SeqCst);
            if threads.saturating_sub(blocked) <= self.num_workers {
                return false;
            }
            if self
                .threads
                .compare_exchange(threads, threads - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.retired.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            threads: self.threads.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            queued: self.ready.len(),
            executed: self.executed.load(Ordering::Relaxed),
            spawned: self.spawned.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
        }
    }
}

/// Marks the current pool thread as blocked until dropped
///
/// Has no effect on threads that do not belong to the pool.
pub(crate) struct BlockingGuard {
    pool: Option<Arc<WorkerPool>>,
}

impl Drop for BlockingGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.blocked.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Enter a blocking region on the current thread
pub(crate) fn enter_blocking() -> BlockingGuard {
    if !tls::is_pool_worker() {
        return BlockingGuard { pool: None };
    }
    let pool = Arc::clone(crate::runtime::runtime().pool());
    pool.blocked.fetch_add(1, Ordering::SeqCst);
    if !pool.ready.is_empty() {
        pool.maybe_spawn();
    }
    BlockingGuard { pool: Some(pool) }
}

/// Single dedicated thread draining jobs in FIFO order
///
/// Backs the main queue. The thread is started on first submission and a
/// failed start is retried on the next one.
pub(crate) struct DedicatedThread {
    name: &'static str,
    jobs: SegQueue<Job>,
    parking: Box<dyn ThreadParking>,
    started: Mutex<bool>,
}

impl DedicatedThread {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            jobs: SegQueue::new(),
            parking: new_parking(),
            started: Mutex::new(false),
        })
    }

    pub fn submit(self: &Arc<Self>, job: Job) {
        self.jobs.push(job);
        self.ensure_started();
        self.parking.wake_one();
    }

    fn ensure_started(self: &Arc<Self>) {
        let mut started = lock(&self.started);
        if *started {
            return;
        }
        let this = Arc::clone(self);
        match thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || this.run())
        {
            Ok(_) => {
                *started = true;
                tracing::debug!(thread = self.name, "dedicated thread started");
            }
            Err(e) => {
                tracing::warn!(thread = self.name, error = %e, "failed to start dedicated thread");
            }
        }
    }

    fn run(self: Arc<Self>) {
        loop {
            if let Some(job) = self.jobs.pop() {
                job::execute(job);
                continue;
            }
            let epoch = self.parking.epoch();
            if !self.jobs.is_empty() {
                continue;
            }
            self.parking.park(epoch, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::Qos;
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn test_pool(workers: usize) -> Arc<WorkerPool> {
        WorkerPool::new(
            &RuntimeConfig::new()
                .num_workers(workers)
                .max_threads(workers + 4)
                .idle_timeout(Duration::from_millis(50)),
        )
    }

    #[test]
    fn test_submit_runs_jobs() {
        let pool = test_pool(2);
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            pool.submit(Job::new(Box::new(move || tx.send(i).unwrap()), Qos::DEFAULT, false));
        }
        let mut got: Vec<i32> = (0..100).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
        assert!(pool.stats().threads <= 2);
    }

    #[test]
    fn test_threads_bounded_without_blocking() {
        let pool = test_pool(2);
        let release = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let release = Arc::clone(&release);
            let running = Arc::clone(&running);
            pool.submit(Job::new(
                Box::new(move || {
                    running.fetch_add(1, Ordering::SeqCst);
                    while !release.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(1));
                    }
                }),
                Qos::DEFAULT,
                false,
            ));
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(running.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().threads, 2);
        release.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_blocked_worker_is_compensated_then_retires() {
        let pool = test_pool(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        pool.submit(Job::new(
            Box::new(move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }),
            Qos::DEFAULT,
            false,
        ));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The only worker is stuck; mark it blocked the way sync/wait do
        pool.blocked.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        pool.submit(Job::new(Box::new(move || tx.send(()).unwrap()), Qos::DEFAULT, false));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(pool.stats().threads, 2);

        pool.blocked.fetch_sub(1, Ordering::SeqCst);
        release_tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.stats().threads > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.stats().threads, 1);
        assert!(pool.stats().retired >= 1);
    }

    #[test]
    fn test_dedicated_thread_fifo() {
        let t = DedicatedThread::new("dispatch-test-dedicated");
        let (tx, rx) = mpsc::channel();
        for i in 0..50 {
            let tx = tx.clone();
            t.submit(Job::new(
                Box::new(move || tx.send((i, thread::current().name().map(String::from))).unwrap()),
                Qos::DEFAULT,
                false,
            ));
        }
        for i in 0..50 {
            let (n, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(n, i);
            assert_eq!(name.as_deref(), Some("dispatch-test-dedicated"));
        }
    }
}

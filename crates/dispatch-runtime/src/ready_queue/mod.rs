//! Ready queue abstraction for the worker pool
//!
//! Holds jobs that have passed every queue-level constraint (serial
//! exclusivity, barriers, suspension) and only wait for a thread.
//!
//! # Implementations
//! - `QosReadyQueue` - one lock-free FIFO per QoS bucket with a periodic
//!   low-to-high fairness scan

mod qos_buckets;

pub(crate) use qos_buckets::QosReadyQueue;

use crate::job::Job;

/// Trait for ready queue implementations
///
/// All implementations must be thread-safe (Send + Sync).
pub(crate) trait ReadyQueue: Send + Sync {
    /// Make a job runnable; its bucket is chosen from `job.qos`
    fn push(&self, job: Job);

    /// Next job for a worker, or `None` if nothing is runnable
    fn pop(&self) -> Option<Job>;

    /// Runnable job count; may briefly count a job still being pushed
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-bucket counts, highest QoS first
    fn bucket_lens(&self) -> Vec<usize>;

    /// Implementation name for logs
    fn name(&self) -> &'static str;
}

//! Per-QoS ready buckets
//!
//! Design:
//! - One `SegQueue` per schedulable QoS class, FIFO within a class
//! - Pops normally scan from the highest class down
//! - Every `fairness_interval`th pop scans from the lowest class up, so a
//!   class that always has work above it still gets a bounded share

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use dispatch_core::QosClass;

use super::ReadyQueue;
use crate::job::Job;

pub(crate) struct QosReadyQueue {
    buckets: [SegQueue<Job>; QosClass::BUCKETS],
    lens: [AtomicUsize; QosClass::BUCKETS],
    total: AtomicUsize,
    pops: AtomicU32,
    fairness_interval: u32,
}

impl QosReadyQueue {
    pub fn new(fairness_interval: u32) -> Self {
        Self {
            buckets: std::array::from_fn(|_| SegQueue::new()),
            lens: std::array::from_fn(|_| AtomicUsize::new(0)),
            total: AtomicUsize::new(0),
            pops: AtomicU32::new(0),
            fairness_interval: fairness_interval.max(1),
        }
    }

    fn try_bucket(&self, bucket: usize) -> Option<Job> {
        if self.lens[bucket].load(Ordering::Acquire) == 0 {
            return None;
        }
        let job = self.buckets[bucket].pop()?;
        self.lens[bucket].fetch_sub(1, Ordering::AcqRel);
        self.total.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }
}

impl ReadyQueue for QosReadyQueue {
    fn push(&self, job: Job) {
        let bucket = job.qos.class().bucket();
        // Counted before the job becomes visible so counters never underflow
        self.lens[bucket].fetch_add(1, Ordering::AcqRel);
        self.total.fetch_add(1, Ordering::SeqCst);
        self.buckets[bucket].push(job);
    }

    fn pop(&self) -> Option<Job> {
        if self.total.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let tick = self.pops.fetch_add(1, Ordering::Relaxed);
        if tick % self.fairness_interval == self.fairness_interval - 1 {
            (0..QosClass::BUCKETS).rev().find_map(|b| self.try_bucket(b))
        } else {
            (0..QosClass::BUCKETS).find_map(|b| self.try_bucket(b))
        }
    }

    fn len(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    fn bucket_lens(&self) -> Vec<usize> {
        self.lens.iter().map(|l| l.load(Ordering::Relaxed)).collect()
    }

    fn name(&self) -> &'static str {
        "qos-buckets"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_core::Qos;
    use std::sync::{Arc, Mutex};

    fn tagged(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str, qos: Qos) -> Job {
        let log = Arc::clone(log);
        Job::new(Box::new(move || log.lock().unwrap().push(tag)), qos, false)
    }

    #[test]
    fn test_priority_order() {
        let q = QosReadyQueue::new(1000);
        let log = Arc::new(Mutex::new(Vec::new()));
        q.push(tagged(&log, "bg", Qos::BACKGROUND));
        q.push(tagged(&log, "default", Qos::DEFAULT));
        q.push(tagged(&log, "ui", Qos::USER_INTERACTIVE));
        q.push(tagged(&log, "unspecified", Qos::UNSPECIFIED));
        assert_eq!(q.len(), 4);

        while let Some(job) = q.pop() {
            job.run();
        }
        assert!(q.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["ui", "default", "unspecified", "bg"]);
    }

    #[test]
    fn test_fifo_within_class() {
        let q = QosReadyQueue::new(61);
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b", "c"] {
            q.push(tagged(&log, tag, Qos::UTILITY));
        }
        while let Some(job) = q.pop() {
            job.run();
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_low_class_not_starved() {
        let q = QosReadyQueue::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        q.push(tagged(&log, "bg", Qos::BACKGROUND));
        for _ in 0..10 {
            q.push(tagged(&log, "hi", Qos::USER_INITIATED));
        }
        for _ in 0..4 {
            q.pop().unwrap().run();
        }
        assert!(log.lock().unwrap().contains(&"bg"));
        assert_eq!(q.bucket_lens(), vec![0, 7, 0, 0, 0]);
    }
}

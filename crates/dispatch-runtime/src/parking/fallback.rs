//! Condvar-based parking
//!
//! Used on platforms without futex support. The epoch lives under the
//! mutex so check-then-wait is atomic with respect to wakers.

use super::ThreadParking;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub struct CondvarParking {
    epoch: Mutex<u32>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl CondvarParking {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    fn advance(&self) {
        let mut guard = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = guard.wrapping_add(1);
    }
}

impl Default for CondvarParking {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadParking for CondvarParking {
    fn epoch(&self) -> u32 {
        *self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);

        while *guard == epoch {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    guard = self
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    guard = self.condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        let woken = *guard != epoch;
        drop(guard);
        self.parked.fetch_sub(1, Ordering::SeqCst);
        woken
    }

    fn wake_one(&self) {
        self.advance();
        self.condvar.notify_one();
    }

    fn wake_all(&self) {
        self.advance();
        self.condvar.notify_all();
    }

    fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

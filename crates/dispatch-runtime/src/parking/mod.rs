//! Thread parking
//!
//! Idle pool workers, the timer thread and the main-queue thread sleep on a
//! [`ThreadParking`] instance. Parking is epoch based: a sleeper first reads
//! the current epoch, re-checks its wake condition, then parks against that
//! epoch. Every wake bumps the epoch, so a wake issued between the check and
//! the park is never lost.

use std::time::Duration;

/// Platform-specific sleep/wake primitive
pub trait ThreadParking: Send + Sync {
    /// Current wake epoch, to be passed to [`park`](Self::park)
    fn epoch(&self) -> u32;

    /// Sleep while the epoch still equals `epoch`, up to `timeout`
    ///
    /// Returns `true` if the epoch moved (a wake was issued), `false` on
    /// timeout. Callers re-check their condition either way.
    fn park(&self, epoch: u32, timeout: Option<Duration>) -> bool;

    /// Advance the epoch and wake at most one sleeper
    fn wake_one(&self);

    /// Advance the epoch and wake every sleeper
    fn wake_all(&self);

    /// Number of threads currently inside `park` (hint, may be stale)
    fn parked_count(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod futex_linux;
        pub use futex_linux::FutexParking as PlatformParking;
    } else {
        mod fallback;
        pub use fallback::CondvarParking as PlatformParking;
    }
}

/// Create a new platform-appropriate parking instance
pub fn new_parking() -> Box<dyn ThreadParking> {
    Box::new(PlatformParking::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_park_timeout() {
        let parking = new_parking();
        let start = Instant::now();
        let woken = parking.park(parking.epoch(), Some(Duration::from_millis(50)));
        let elapsed = start.elapsed();

        assert!(!woken);
        assert!(elapsed >= Duration::from_millis(40));
    }

    #[test]
    fn test_stale_epoch_returns_immediately() {
        let parking = new_parking();
        let epoch = parking.epoch();
        parking.wake_one();

        let start = Instant::now();
        assert!(parking.park(epoch, Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_wake_one() {
        let parking = Arc::new(PlatformParking::new());
        let parking2 = Arc::clone(&parking);

        let handle = thread::spawn(move || {
            let epoch = parking2.epoch();
            parking2.park(epoch, Some(Duration::from_secs(10)))
        });

        while parking.parked_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        parking.wake_one();

        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_wake_all() {
        let parking = Arc::new(PlatformParking::new());
        let epoch = parking.epoch();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&parking);
                thread::spawn(move || p.park(epoch, Some(Duration::from_secs(10))))
            })
            .collect();

        while parking.parked_count() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        parking.wake_all();

        for h in handles {
            assert!(h.join().unwrap());
        }
    }
}

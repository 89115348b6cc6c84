//! Time values
//!
//! All engine timing is expressed in integer nanoseconds:
//!
//! - [`DispatchTime`] counts nanoseconds on a process-wide monotonic clock
//!   whose origin is fixed the first time any time value is read.
//! - [`WallTime`] counts nanoseconds since the Unix epoch. Wall deadlines are
//!   translated onto the monotonic clock when a timer is armed.
//! - [`TimeInterval`] is a signed nanosecond count.
//!
//! Arithmetic never wraps. Results that exceed the representable range
//! clamp to the maximum (which reads as "distant future" or "never") or to
//! zero / the minimum for negative results.

use std::ops::{Add, Sub};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::constants::{NSEC_PER_MSEC, NSEC_PER_SEC, NSEC_PER_USEC};

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

#[inline]
fn clock_origin() -> Instant {
    *CLOCK_ORIGIN.get_or_init(Instant::now)
}

/// Nanoseconds elapsed on the process monotonic clock
#[inline]
pub fn monotonic_now_ns() -> u64 {
    // u64::MAX is reserved for the distant future
    clock_origin().elapsed().as_nanos().min((u64::MAX - 1) as u128) as u64
}

#[inline]
fn duration_to_ns(d: Duration) -> u64 {
    d.as_nanos().min(u64::MAX as u128) as u64
}

// ---------------------------------------------------------------------------
// TimeInterval
// ---------------------------------------------------------------------------

/// Signed interval in nanoseconds
///
/// Constructors multiply by the unit size with saturation, so
/// `TimeInterval::seconds(i64::MAX) == TimeInterval::never()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeInterval(i64);

impl TimeInterval {
    pub const ZERO: TimeInterval = TimeInterval(0);
    pub const NEVER: TimeInterval = TimeInterval(i64::MAX);

    pub const fn seconds(n: i64) -> Self {
        TimeInterval(n.saturating_mul(NSEC_PER_SEC as i64))
    }

    pub const fn milliseconds(n: i64) -> Self {
        TimeInterval(n.saturating_mul(NSEC_PER_MSEC as i64))
    }

    pub const fn microseconds(n: i64) -> Self {
        TimeInterval(n.saturating_mul(NSEC_PER_USEC as i64))
    }

    pub const fn nanoseconds(n: i64) -> Self {
        TimeInterval(n)
    }

    /// Interval that never elapses
    pub const fn never() -> Self {
        Self::NEVER
    }

    /// Unsigned nanosecond count; values above `i64::MAX` clamp to `never`
    pub const fn from_nanos_u64(ns: u64) -> Self {
        if ns > i64::MAX as u64 {
            Self::NEVER
        } else {
            TimeInterval(ns as i64)
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self::from_nanos_u64(duration_to_ns(d))
    }

    /// Fractional seconds; non-finite or out-of-range values become `never`
    /// (or the minimum for negative infinity)
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() {
            return Self::NEVER;
        }
        let ns = secs * NSEC_PER_SEC as f64;
        if ns >= i64::MAX as f64 {
            Self::NEVER
        } else if ns <= i64::MIN as f64 {
            TimeInterval(i64::MIN)
        } else {
            TimeInterval(ns as i64)
        }
    }

    #[inline]
    pub const fn is_never(&self) -> bool {
        self.0 == i64::MAX
    }

    #[inline]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }

    /// Non-negative duration; negative intervals read as zero
    pub fn to_duration(&self) -> Duration {
        Duration::from_nanos(self.0.max(0) as u64)
    }
}

impl From<Duration> for TimeInterval {
    fn from(d: Duration) -> Self {
        TimeInterval::from_duration(d)
    }
}

// ---------------------------------------------------------------------------
// DispatchTime
// ---------------------------------------------------------------------------

/// Point on the process monotonic clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchTime(u64);

impl DispatchTime {
    pub const DISTANT_FUTURE: DispatchTime = DispatchTime(u64::MAX);

    #[inline]
    pub fn now() -> Self {
        DispatchTime(monotonic_now_ns())
    }

    pub const fn distant_future() -> Self {
        Self::DISTANT_FUTURE
    }

    pub const fn from_nanos(ns: u64) -> Self {
        DispatchTime(ns)
    }

    /// `now() + d`
    pub fn after(d: Duration) -> Self {
        Self::now() + d
    }

    #[inline]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_distant_future(&self) -> bool {
        self.0 == u64::MAX
    }

    pub fn saturating_add(self, interval: TimeInterval) -> Self {
        if self.is_distant_future() || interval.is_never() {
            return Self::DISTANT_FUTURE;
        }
        let ns = interval.as_nanos();
        if ns >= 0 {
            DispatchTime(self.0.saturating_add(ns as u64))
        } else {
            DispatchTime(self.0.saturating_sub(ns.unsigned_abs()))
        }
    }

    pub fn saturating_sub(self, interval: TimeInterval) -> Self {
        if self.is_distant_future() {
            return self;
        }
        let ns = interval.as_nanos();
        if ns >= 0 {
            DispatchTime(self.0.saturating_sub(ns as u64))
        } else {
            DispatchTime(self.0.saturating_add(ns.unsigned_abs()))
        }
    }

    /// Time left until this point, zero if already passed, `None` for the
    /// distant future
    pub fn duration_until(&self) -> Option<Duration> {
        if self.is_distant_future() {
            return None;
        }
        Some(Duration::from_nanos(self.0.saturating_sub(monotonic_now_ns())))
    }

    /// Elapsed time since `earlier`, zero if `earlier` is later
    pub fn duration_since(&self, earlier: DispatchTime) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Add<TimeInterval> for DispatchTime {
    type Output = DispatchTime;
    fn add(self, rhs: TimeInterval) -> DispatchTime {
        self.saturating_add(rhs)
    }
}

impl Sub<TimeInterval> for DispatchTime {
    type Output = DispatchTime;
    fn sub(self, rhs: TimeInterval) -> DispatchTime {
        self.saturating_sub(rhs)
    }
}

impl Add<Duration> for DispatchTime {
    type Output = DispatchTime;
    fn add(self, rhs: Duration) -> DispatchTime {
        if self.is_distant_future() {
            return self;
        }
        DispatchTime(self.0.saturating_add(duration_to_ns(rhs)))
    }
}

// ---------------------------------------------------------------------------
// WallTime
// ---------------------------------------------------------------------------

/// Point on the wall clock, nanoseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallTime(u64);

impl WallTime {
    pub const DISTANT_FUTURE: WallTime = WallTime(u64::MAX);

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub const fn distant_future() -> Self {
        Self::DISTANT_FUTURE
    }

    /// Times before the epoch clamp to the epoch
    pub fn from_system_time(t: SystemTime) -> Self {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => WallTime(duration_to_ns(d).min(u64::MAX - 1)),
            Err(_) => WallTime(0),
        }
    }

    pub const fn from_nanos(ns: u64) -> Self {
        WallTime(ns)
    }

    #[inline]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_distant_future(&self) -> bool {
        self.0 == u64::MAX
    }

    pub fn saturating_add(self, interval: TimeInterval) -> Self {
        if self.is_distant_future() || interval.is_never() {
            return Self::DISTANT_FUTURE;
        }
        let ns = interval.as_nanos();
        if ns >= 0 {
            WallTime(self.0.saturating_add(ns as u64))
        } else {
            WallTime(self.0.saturating_sub(ns.unsigned_abs()))
        }
    }

    /// Translate onto the monotonic clock using the current offset between
    /// the two clocks
    pub fn to_dispatch_time(&self) -> DispatchTime {
        if self.is_distant_future() {
            return DispatchTime::DISTANT_FUTURE;
        }
        let wall_now = WallTime::now().0;
        let mono_now = monotonic_now_ns();
        if self.0 >= wall_now {
            DispatchTime(mono_now.saturating_add(self.0 - wall_now))
        } else {
            DispatchTime(mono_now.saturating_sub(wall_now - self.0))
        }
    }
}

impl Add<TimeInterval> for WallTime {
    type Output = WallTime;
    fn add(self, rhs: TimeInterval) -> WallTime {
        self.saturating_add(rhs)
    }
}

// ---------------------------------------------------------------------------
// Deadline / WaitResult
// ---------------------------------------------------------------------------

/// Deadline on either clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Monotonic deadline; does not advance while the machine sleeps
    Monotonic(DispatchTime),
    /// Wall-clock deadline
    Wall(WallTime),
}

impl Deadline {
    /// Deadline as a monotonic time, resolved against the current clocks
    pub fn resolve(&self) -> DispatchTime {
        match self {
            Deadline::Monotonic(t) => *t,
            Deadline::Wall(w) => w.to_dispatch_time(),
        }
    }
}

impl From<DispatchTime> for Deadline {
    fn from(t: DispatchTime) -> Self {
        Deadline::Monotonic(t)
    }
}

impl From<WallTime> for Deadline {
    fn from(w: WallTime) -> Self {
        Deadline::Wall(w)
    }
}

/// Outcome of a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Success,
    TimedOut,
}

impl WaitResult {
    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, WaitResult::Success)
    }

    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, WaitResult::TimedOut)
    }
}

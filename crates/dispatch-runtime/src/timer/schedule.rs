//! Deadline math for timer sources
//!
//! All values are nanoseconds on the monotonic clock. Fire `n` of a
//! repeating timer targets `start + n * interval`, computed in 128-bit
//! arithmetic and clamped, so the phase never drifts and large periods are
//! never truncated. A target of `u64::MAX` means "not armed".

use dispatch_core::{DispatchTime, TimeInterval};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerSpec {
    /// Next fire target
    pub target: u64,
    /// Repeat period, `None` for one-shot
    pub interval: Option<u64>,
    /// Requested slack
    pub leeway: u64,
    /// Set once the first fire has been accounted
    pub fired_once: bool,
}

impl TimerSpec {
    /// Spec that never fires
    pub const DISARMED: TimerSpec = TimerSpec {
        target: u64::MAX,
        interval: None,
        leeway: 0,
        fired_once: false,
    };

    pub fn new(start: DispatchTime, interval: TimeInterval, leeway: TimeInterval) -> Self {
        let interval = if interval.is_never() || interval.as_nanos() < 0 {
            None
        } else {
            // Zero would fire in a tight loop
            Some((interval.as_nanos() as u64).max(1))
        };
        let leeway = if leeway.is_never() {
            u64::MAX
        } else {
            leeway.as_nanos().max(0) as u64
        };
        Self {
            target: start.as_nanos(),
            interval,
            leeway,
            fired_once: false,
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.target != u64::MAX
    }

    /// Slack for the next fire: the full leeway before the first fire,
    /// at most half a period afterwards
    pub fn window(&self) -> u64 {
        match self.interval {
            Some(iv) if self.fired_once => self.leeway.min(iv / 2),
            _ => self.leeway,
        }
    }

    /// Account an expiry observed at `now`
    ///
    /// Returns how many periods elapsed (at least 1) and moves `target` to
    /// the first period boundary after `now`. Missed periods collapse into
    /// the returned count instead of producing a burst.
    pub fn advance(&mut self, now: u64) -> u64 {
        self.fired_once = true;
        let Some(iv) = self.interval else {
            self.target = u64::MAX;
            return 1;
        };
        let fires = 1 + now.saturating_sub(self.target) / iv;
        let next = self.target as u128 + fires as u128 * iv as u128;
        self.target = next.min(u64::MAX as u128) as u64;
        fires
    }
}

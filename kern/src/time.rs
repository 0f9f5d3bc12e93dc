// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel time base.
//!
//! The kernel measures time in ticks of the periodic hardware timer. The
//! counter is 32 bits wide but wraps slightly early, at [`Tick::ROLLOVER`],
//! so the values `ROLLOVER..=u32::MAX` never appear in the counter or in a
//! deadline. The soft-timer service keys its two-heap ping-pong off this wrap
//! point, and all deadline arithmetic in this module is performed modulo
//! `ROLLOVER`.
//!
//! A task's timing condition is a [`Deadline`], a tagged value that keeps
//! "no deadline", "armed", and "expired" as distinct states instead of
//! encoding them as reserved counter values.

use abi::TICK_HZ;

/// In-kernel tick counter value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Tick(pub u32);

impl Tick {
    /// Wrap point of the tick counter. The counter takes values in
    /// `0..ROLLOVER`.
    pub const ROLLOVER: u32 = u32::MAX - 3;

    pub const ZERO: Self = Tick(0);

    /// Advances one tick. Returns the new value, and `true` if the counter
    /// wrapped.
    #[must_use]
    pub(crate) fn advance(self) -> (Self, bool) {
        let next = self.0 + 1;
        if next >= Self::ROLLOVER {
            (Tick(0), true)
        } else {
            (Tick(next), false)
        }
    }

    /// Computes the absolute deadline `delta` ticks after `self`, modulo the
    /// wrap point. The boolean is `true` if the deadline lands past the wrap,
    /// i.e. in the counter's next epoch.
    ///
    /// `delta` must be below `ROLLOVER`; callers validate this at the API
    /// boundary.
    pub fn deadline_after(self, delta: u32) -> (Self, bool) {
        debug_assert!(delta < Self::ROLLOVER);
        let sum = u64::from(self.0) + u64::from(delta);
        if sum >= u64::from(Self::ROLLOVER) {
            (Tick((sum - u64::from(Self::ROLLOVER)) as u32), true)
        } else {
            (Tick(sum as u32), false)
        }
    }

    /// Ticks from `self` until `later` first occurs, treating a numerically
    /// smaller `later` as belonging to the next counter epoch.
    pub fn until(self, later: Self) -> u32 {
        if later.0 >= self.0 {
            later.0 - self.0
        } else {
            later.0 + (Self::ROLLOVER - self.0)
        }
    }
}

/// A task's wait deadline.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum Deadline {
    /// No timing condition; the task is not on the delay list.
    #[default]
    None,
    /// Wake when the tick counter equals this value exactly.
    At(Tick),
    /// The deadline fired and woke the task. A pend operation that resumes
    /// and finds this (with its wait bit still set) knows its wait timed out
    /// rather than being satisfied.
    TimedOut,
}

/// How long a pend operation is willing to wait.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Don't wait: report that nothing was available instead of suspending.
    Poll,
    /// Wait with no time bound.
    Forever,
    /// Wait at most this many ticks. Must be nonzero and below
    /// `Tick::ROLLOVER`, or the operation fails with `BadDelay`.
    For(u32),
}

/// Converts a duration in milliseconds to ticks at the configured tick rate,
/// rounding up so a nonzero duration never becomes a zero wait.
pub fn ticks_for_ms(ms: u32) -> u32 {
    let ticks = (u64::from(ms) * u64::from(TICK_HZ)).div_ceil(1_000);
    // A delay too long to represent saturates just below the wrap point.
    u32::try_from(ticks).unwrap_or(Tick::ROLLOVER - 1).min(Tick::ROLLOVER - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_linear_until_rollover() {
        let (t, rolled) = Tick(5).advance();
        assert_eq!(t, Tick(6));
        assert!(!rolled);
    }

    #[test]
    fn advance_wraps_at_rollover() {
        let (t, rolled) = Tick(Tick::ROLLOVER - 1).advance();
        assert_eq!(t, Tick(0));
        assert!(rolled);
    }

    #[test]
    fn deadline_in_same_epoch() {
        let (d, wrapped) = Tick(100).deadline_after(50);
        assert_eq!(d, Tick(150));
        assert!(!wrapped);
    }

    #[test]
    fn deadline_past_wrap_lands_in_next_epoch() {
        let (d, wrapped) = Tick(Tick::ROLLOVER - 10).deadline_after(25);
        assert_eq!(d, Tick(15));
        assert!(wrapped);
        // A wrapped deadline is always numerically below the tick it was
        // computed from; `until` relies on this.
        assert!(d.0 < Tick::ROLLOVER - 10);
    }

    #[test]
    fn until_spans_the_wrap() {
        let now = Tick(Tick::ROLLOVER - 10);
        let (d, _) = now.deadline_after(25);
        assert_eq!(now.until(d), 25);
        assert_eq!(Tick(100).until(Tick(150)), 50);
        assert_eq!(Tick(100).until(Tick(100)), 0);
    }

    #[test]
    fn ms_conversion_rounds_up() {
        // At 1 kHz one millisecond is one tick; fractions round up.
        assert_eq!(ticks_for_ms(1), 1);
        assert_eq!(ticks_for_ms(0), 0);
        assert!(ticks_for_ms(u32::MAX) < Tick::ROLLOVER);
    }
}

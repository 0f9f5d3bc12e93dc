// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority bitmap scheduler.
//!
//! The scheduler's entire job is: given the set of runnable priorities (the
//! intersection of the ready and blocked masks), name the numerically highest
//! one. Because each priority level is held by at most one task, that answer
//! plus the priority-to-task table fully determines the next task to run.
//!
//! There are two implementations of the highest-bit search, and they must
//! agree on every input:
//!
//! - [`highest_portable`], a binary search on halving ranges, which works on
//!   any target and any mask width, and
//! - [`highest_clz`], which leans on the count-leading-zeros instruction that
//!   most 32-bit cores provide.
//!
//! The `clz` Cargo feature selects which one [`PrioSet::highest`] uses; the
//! tests check them against each other exhaustively.
//!
//! Neither function blocks, allocates, or touches any state but its argument.

use abi::Priority;

cfg_if::cfg_if! {
    if #[cfg(feature = "prio-8")] {
        /// Raw storage for a priority mask; one bit per priority level.
        pub type RawMask = u8;
    } else if #[cfg(feature = "prio-16")] {
        /// Raw storage for a priority mask; one bit per priority level.
        pub type RawMask = u16;
    } else {
        /// Raw storage for a priority mask; one bit per priority level.
        pub type RawMask = u32;
    }
}

/// Number of priority levels in this build, fixed by the mask width.
pub const NUM_PRIORITIES: usize = RawMask::BITS as usize;

/// A set of priorities. Bit *i* set means priority *i* is a member.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct PrioSet(RawMask);

impl PrioSet {
    pub const EMPTY: Self = PrioSet(0);
    pub const ALL: Self = PrioSet(RawMask::MAX);

    pub fn insert(&mut self, p: Priority) {
        self.0 |= bit(p);
    }

    pub fn remove(&mut self, p: Priority) {
        self.0 &= !bit(p);
    }

    pub fn contains(&self, p: Priority) -> bool {
        self.0 & bit(p) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn intersect(self, other: Self) -> Self {
        PrioSet(self.0 & other.0)
    }

    /// The most important member, if the set is nonempty.
    pub fn highest(self) -> Option<Priority> {
        #[cfg(feature = "clz")]
        {
            highest_clz(self.0)
        }
        #[cfg(not(feature = "clz"))]
        {
            highest_portable(self.0)
        }
    }
}

fn bit(p: Priority) -> RawMask {
    debug_assert!(p.index() < NUM_PRIORITIES);
    (1 as RawMask) << p.0
}

/// Portable highest-set-bit search.
///
/// Classic binary search on halving ranges: at each step, if the upper half
/// of the remaining range is nonzero the answer lives there, otherwise keep
/// the lower half. Runs in log2(width) steps with no hardware help.
pub fn highest_portable(m: RawMask) -> Option<Priority> {
    if m == 0 {
        return None;
    }
    let mut v = u32::from(m);
    let mut prio = 0u8;
    let mut width = RawMask::BITS;
    while width > 1 {
        width /= 2;
        let upper = v >> width;
        if upper != 0 {
            prio += width as u8;
            v = upper;
        } else {
            v &= (1u32 << width) - 1;
        }
    }
    Some(Priority(prio))
}

/// Highest-set-bit via count-leading-zeros.
///
/// `leading_zeros` lowers to a single instruction on cores that have one
/// (CLZ on ARMv7-M and up).
pub fn highest_clz(m: RawMask) -> Option<Priority> {
    if m == 0 {
        None
    } else {
        Some(Priority((RawMask::BITS - 1 - m.leading_zeros()) as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Exhaustive over all 16-bit patterns; for the 32-bit build each pattern
    // is also swept through every byte shift so all bit positions are hit.
    fn all_masks(mut f: impl FnMut(RawMask)) {
        for low in 0..=0xFFFFu32 {
            for shift in (0..RawMask::BITS).step_by(8) {
                let m = (low as u64) << shift;
                if m <= u64::from(RawMask::MAX) {
                    f(m as RawMask);
                }
            }
        }
    }

    #[test]
    fn portable_and_clz_agree_everywhere() {
        all_masks(|m| {
            assert_eq!(
                highest_portable(m),
                highest_clz(m),
                "implementations disagree on {m:#x}",
            );
        });
    }

    #[test]
    fn highest_really_is_highest() {
        all_masks(|m| {
            match highest_portable(m) {
                None => assert_eq!(m, 0),
                Some(p) => {
                    // The named bit is set, and nothing above it is.
                    assert_eq!(m >> p.0, 1, "wrong answer for {m:#x}");
                }
            }
        });
    }

    #[test]
    fn empty_set_has_no_highest() {
        assert_eq!(PrioSet::EMPTY.highest(), None);
    }

    #[test]
    fn set_operations() {
        let mut s = PrioSet::EMPTY;
        s.insert(Priority(3));
        s.insert(Priority(7));
        assert!(s.contains(Priority(3)));
        assert!(!s.contains(Priority(4)));
        assert_eq!(s.highest(), Some(Priority(7)));

        s.remove(Priority(7));
        assert_eq!(s.highest(), Some(Priority(3)));

        let other = {
            let mut o = PrioSet::EMPTY;
            o.insert(Priority(3));
            o.insert(Priority(5));
            o
        };
        assert_eq!(s.intersect(other).highest(), Some(Priority(3)));
        s.remove(Priority(3));
        assert!(s.is_empty());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Synchronization primitives.
//!
//! All four primitives (semaphore, mutex, mailbox, queue) share one waiting
//! protocol, split into two phases because the task actually stops running
//! in between:
//!
//! 1. **Start**: under the critical section, the primitive either satisfies
//!    the request immediately ([`Pend::Taken`]) or parks the caller
//!    ([`Pend::Waiting`]): wait-set insertion, ready-bit clear, and, for a
//!    bounded wait, delay-list registration. The caller then asks the arch
//!    layer for a context change and stops running.
//!
//! 2. **Finish**: when the task runs again, it re-enters the critical
//!    section and asks how it was woken. A poster clears the waiter's wait
//!    bit before waking it, so *still being in the wait set* plus a
//!    [`Deadline::TimedOut`] marker means the wake came from the tick
//!    service, not a post.
//!
//! Wake order is always priority order, computed by the same highest-bit
//! search the scheduler uses, applied to the primitive's wait set. There is
//! no FIFO fairness to implement: priorities are unique per task, so the
//! wait set is a complete description of who's waiting.

mod mailbox;
mod mutex;
mod queue;
mod semaphore;

pub use mailbox::{Mailbox, MailboxHandle, MboxPend};
pub use mutex::{Mutex, MutexHandle};
pub use queue::{Queue, QueueHandle};
pub use semaphore::{SemHandle, SemKind, Semaphore};

use abi::Priority;

use crate::err::KernelError;
use crate::schedule::PrioSet;
use crate::task::Kernel;
use crate::time::{Deadline, Timeout};

/// Set of priorities parked on one primitive.
#[derive(Copy, Clone, Debug, Default)]
pub struct WaitList {
    set: PrioSet,
    count: u8,
}

impl WaitList {
    pub fn insert(&mut self, p: Priority) {
        debug_assert!(!self.set.contains(p));
        self.set.insert(p);
        self.count += 1;
    }

    /// Removes `p`, reporting whether it was present.
    pub fn remove(&mut self, p: Priority) -> bool {
        if self.set.contains(p) {
            self.set.remove(p);
            self.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn contains(&self, p: Priority) -> bool {
        self.set.contains(p)
    }

    /// The most important waiter, if any.
    pub fn highest(&self) -> Option<Priority> {
        self.set.highest()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        usize::from(self.count)
    }
}

/// First-phase outcome of a pend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Pend {
    /// Satisfied immediately; no suspension happened.
    Taken,
    /// The caller was parked and must request a context change, then run the
    /// matching `finish` operation once it's scheduled again.
    Waiting,
}

/// Checks a pend timeout's delay bound. `Poll` must be handled before this.
pub(crate) fn validated_delay(
    timeout: Timeout,
) -> Result<Option<u32>, KernelError> {
    match timeout {
        Timeout::Poll => Ok(None),
        Timeout::Forever => Ok(None),
        Timeout::For(n) => {
            if n == 0 || n >= crate::time::Tick::ROLLOVER {
                Err(KernelError::BadDelay)
            } else {
                Ok(Some(n))
            }
        }
    }
}

impl Kernel {
    /// Parks the running task: clears its ready bit and, for a bounded wait,
    /// registers its deadline. The caller has already joined the primitive's
    /// wait set and validated the timeout.
    pub(crate) fn park_current(&mut self, delay: Option<u32>) {
        let slot = self.current;
        let prio = self.task(slot).priority;
        self.ready.remove(prio);
        if let Some(n) = delay {
            let (deadline, _) = self.now().deadline_after(n);
            self.delay_insert(slot, deadline);
        }
    }

    /// Wakes the task in `slot` after its wait was satisfied by a post: pulls
    /// it off the delay list if its wait was bounded, clears its deadline,
    /// and sets its ready bit. The poster removes the task from the wait set
    /// before calling this; that removal is what marks the wake as
    /// post-driven.
    pub(crate) fn wake_waiter(&mut self, slot: u8) {
        if matches!(self.task(slot).deadline, Deadline::At(_)) {
            self.delay_remove(slot);
        }
        let prio = {
            let t = self.task_mut(slot);
            t.deadline = Deadline::None;
            t.priority
        };
        self.ready.insert(prio);
    }

    /// Maps a waiting priority back to its arena slot via the priority
    /// table.
    pub(crate) fn waiter_slot(&self, prio: Priority) -> u8 {
        match self.table[prio.index()] {
            crate::task::PrioSlot::Held(slot) => slot,
            _ => panic!("wait set names unheld priority {}", prio.0),
        }
    }

}

/// Second-phase outcome for a resumed waiter.
///
/// Returns `Ok(())` for a post-driven wake. Classifies a deadline-driven
/// wake as `TimedOut` and removes the caller from the wait set. A task that
/// resumes still parked without either marker had its wait abandoned (woken
/// by something other than the post or the tick service); that reads as
/// `NoEntryAvailable`.
///
/// This is a free function over the two pieces of state involved, because
/// they're borrowed out of disjoint parts of the kernel.
pub(crate) fn finish_wait(
    wait: &mut WaitList,
    prio: Priority,
    deadline: &mut Deadline,
) -> Result<(), KernelError> {
    if wait.contains(prio) {
        wait.remove(prio);
        match core::mem::replace(deadline, Deadline::None) {
            Deadline::TimedOut => Err(KernelError::TimedOut),
            _ => Err(KernelError::NoEntryAvailable),
        }
    } else {
        Ok(())
    }
}

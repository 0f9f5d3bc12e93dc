// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-ceiling mutexes.
//!
//! Each mutex permanently reserves one priority level, its *ceiling*, at
//! creation time; no task can be installed there. While a task holds the
//! mutex and the ceiling is above its own priority, the owner runs *at* the
//! ceiling: its ready bit and table entry move up, bounding how long a
//! middle-priority task can keep the owner (and so the real high-priority
//! contender) off the CPU.
//!
//! Release restores the owner's installed priority. If anyone is waiting,
//! ownership transfers directly to the highest-priority waiter -- the mutex
//! never passes through the "available" state -- and the elevation rules
//! apply to the new owner immediately.
//!
//! Ownership is re-entrant in the cheapest possible way: an owner acquiring
//! again gets success and no state change, and one release frees the mutex
//! regardless of how many times the owner re-acquired it.

use abi::Priority;

use crate::err::KernelError;
use crate::schedule::NUM_PRIORITIES;
use crate::sync::{finish_wait, validated_delay, Pend, WaitList};
use crate::task::{Kernel, PrioSlot, SwitchHint};
use crate::time::{Deadline, Timeout};

/// Mutex control block.
#[derive(Debug)]
pub struct Mutex {
    pub(crate) ceiling: Priority,
    /// Arena slot of the owner; `None` means available.
    pub(crate) owner: Option<u8>,
    /// The owner's installed priority, restored on release.
    pub(crate) owner_base: Priority,
    pub(crate) wait: WaitList,
}

/// Names a mutex in the kernel's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MutexHandle(pub(crate) u8);

impl Kernel {
    /// Allocates a mutex, reserving `ceiling` in the priority table.
    ///
    /// The ceiling must be a free, nonzero priority; it becomes unavailable
    /// to task installation for the life of the mutex.
    pub fn mutex_create(
        &mut self,
        ceiling: Priority,
    ) -> Result<MutexHandle, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        if ceiling.index() >= NUM_PRIORITIES {
            return Err(KernelError::BadPriority);
        }
        if ceiling == Priority::IDLE {
            return Err(KernelError::IdlePriorityReserved);
        }
        match self.table[ceiling.index()] {
            PrioSlot::Vacant => (),
            PrioSlot::Reserved => return Err(KernelError::PriorityReserved),
            PrioSlot::Held(_) => return Err(KernelError::PriorityInUse),
        }
        let idx = self
            .mutexes
            .iter()
            .position(|m| m.is_none())
            .ok_or(KernelError::NoFreeControlBlock)?;
        self.table[ceiling.index()] = PrioSlot::Reserved;
        self.mutexes[idx] = Some(Mutex {
            ceiling,
            owner: None,
            owner_base: Priority::IDLE,
            wait: WaitList::default(),
        });
        Ok(MutexHandle(idx as u8))
    }

    /// Releases a mutex's control block and its ceiling reservation. Refused
    /// while owned or waited on.
    pub fn mutex_delete(&mut self, h: MutexHandle) -> Result<(), KernelError> {
        let m = self.mutex(h)?;
        if m.owner.is_some() {
            return Err(KernelError::InUse);
        }
        if !m.wait.is_empty() {
            return Err(KernelError::WaitersPresent);
        }
        let ceiling = m.ceiling;
        self.table[ceiling.index()] = PrioSlot::Vacant;
        self.mutexes[usize::from(h.0)] = None;
        Ok(())
    }

    /// First phase of an acquire.
    ///
    /// Success paths: the caller already owns it (no state change), or it
    /// was free (the caller becomes owner, elevated to the ceiling if the
    /// ceiling is higher). Otherwise this behaves like a semaphore pend:
    /// `Poll` fails fast, a blocking request parks the caller.
    ///
    /// Mutexes guard task-level resources; every acquire is refused in
    /// interrupt context.
    pub fn mutex_acquire_start(
        &mut self,
        h: MutexHandle,
        timeout: Timeout,
    ) -> Result<Pend, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let caller = self.current;
        let (owner, ceiling) = {
            let m = self.mutex(h)?;
            (m.owner, m.ceiling)
        };
        match owner {
            Some(owner) if owner == caller => Ok(Pend::Taken),
            None => {
                let base = self.task(caller).priority;
                {
                    let m = self.mutex_mut(h)?;
                    m.owner = Some(caller);
                    m.owner_base = base;
                }
                if ceiling.is_more_important_than(base) {
                    self.elevate(caller, base, ceiling);
                }
                Ok(Pend::Taken)
            }
            Some(_) => {
                if timeout == Timeout::Poll {
                    return Err(KernelError::NoEntryAvailable);
                }
                let delay = validated_delay(timeout)?;
                let prio = self.task(caller).priority;
                self.mutex_mut(h)?.wait.insert(prio);
                self.park_current(delay);
                Ok(Pend::Waiting)
            }
        }
    }

    /// Second phase of an acquire, run after the task is scheduled again.
    ///
    /// On a post-driven wake the releaser has already made the caller the
    /// owner; there is nothing left to claim.
    pub fn mutex_acquire_finish(
        &mut self,
        h: MutexHandle,
    ) -> Result<(), KernelError> {
        let slot = self.current;
        // A wake that is neither a transfer nor a timeout leaves the
        // deadline armed; unlink from the delay list before classifying.
        if matches!(self.task(slot).deadline, Deadline::At(_)) {
            self.delay_remove(slot);
        }
        let slot = usize::from(slot);
        let m = self
            .mutexes
            .get_mut(usize::from(h.0))
            .and_then(|m| m.as_mut())
            .ok_or(KernelError::BadHandle)?;
        let task = self.tasks[slot]
            .as_mut()
            .expect("current task slot vacant");
        finish_wait(&mut m.wait, task.priority, &mut task.deadline)?;
        debug_assert_eq!(m.owner, Some(self.current));
        Ok(())
    }

    /// Releases the mutex.
    ///
    /// Fails unless the caller owns it. Restores the caller's installed
    /// priority, then either hands ownership to the highest-priority waiter
    /// (waking and elevating it) or marks the mutex available, reverting the
    /// ceiling slot to its reservation.
    pub fn mutex_release(
        &mut self,
        h: MutexHandle,
    ) -> Result<SwitchHint, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let caller = self.current;
        let m = self.mutex(h)?;
        if m.owner != Some(caller) {
            return Err(KernelError::NotOwner);
        }
        let ceiling = m.ceiling;
        let base = m.owner_base;

        // Drop the caller back to its installed priority if it was elevated.
        if self.task(caller).priority == ceiling && ceiling != base {
            self.demote(caller, base, ceiling);
        }

        let waiter = self.mutex(h)?.wait.highest();
        match waiter {
            Some(prio) => {
                // Transfer: the mutex skips "available" entirely.
                self.mutex_mut(h)?.wait.remove(prio);
                let new_owner = self.waiter_slot(prio);
                self.wake_waiter(new_owner);
                {
                    let m = self.mutex_mut(h)?;
                    m.owner = Some(new_owner);
                    m.owner_base = prio;
                }
                if ceiling.is_more_important_than(prio) {
                    self.elevate(new_owner, prio, ceiling);
                }
            }
            None => {
                let m = self.mutex_mut(h)?;
                m.owner = None;
                m.owner_base = Priority::IDLE;
                self.table[ceiling.index()] = PrioSlot::Reserved;
            }
        }
        Ok(self.reschedule_hint())
    }

    /// Moves a task's scheduling identity from `from` up to the ceiling
    /// `to`. Its installed priority keeps its table entry, so nothing can be
    /// installed there while the task is elevated.
    fn elevate(&mut self, slot: u8, from: Priority, to: Priority) {
        debug_assert_eq!(self.table[to.index()], PrioSlot::Reserved);
        let was_ready = self.ready.contains(from);
        self.ready.remove(from);
        if was_ready {
            self.ready.insert(to);
        }
        self.table[to.index()] = PrioSlot::Held(slot);
        let t = self.task_mut(slot);
        t.priority = to;
        t.base_priority = from;
    }

    /// Inverse of `elevate`. The ceiling slot's disposition (re-reserved or
    /// handed to the next owner) is the caller's business.
    fn demote(&mut self, slot: u8, to: Priority, ceiling: Priority) {
        let was_ready = self.ready.contains(ceiling);
        self.ready.remove(ceiling);
        if was_ready {
            self.ready.insert(to);
        }
        self.table[ceiling.index()] = PrioSlot::Reserved;
        let t = self.task_mut(slot);
        t.priority = to;
        t.base_priority = to;
    }

    fn mutex(&self, h: MutexHandle) -> Result<&Mutex, KernelError> {
        self.mutexes
            .get(usize::from(h.0))
            .and_then(|m| m.as_ref())
            .ok_or(KernelError::BadHandle)
    }

    fn mutex_mut(&mut self, h: MutexHandle) -> Result<&mut Mutex, KernelError> {
        self.mutexes
            .get_mut(usize::from(h.0))
            .and_then(|m| m.as_mut())
            .ok_or(KernelError::BadHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::TaskFlags;
    use crate::task::TaskDesc;

    fn never(_: usize) -> ! {
        unreachable!("task entry executed in a hosted test");
    }

    fn kernel_with_tasks(prios: &[u8]) -> Kernel {
        let mut k = Kernel::new(0x2000_0000, 8192);
        for &p in prios {
            k.install(&TaskDesc {
                name: "t",
                entry: never,
                arg: 0,
                stack_size: 128,
                priority: Priority(p),
                flags: TaskFlags::empty(),
            })
            .unwrap();
        }
        k
    }

    #[test]
    fn create_reserves_ceiling() {
        let mut k = kernel_with_tasks(&[4]);
        let _h = k.mutex_create(Priority(9)).unwrap();
        assert_eq!(k.table[9], PrioSlot::Reserved);
        // Ordinary installation at the ceiling now fails.
        let r = k.install(&TaskDesc {
            name: "late",
            entry: never,
            arg: 0,
            stack_size: 128,
            priority: Priority(9),
            flags: TaskFlags::empty(),
        });
        assert_eq!(r, Err(KernelError::PriorityReserved));
    }

    #[test]
    fn create_refuses_occupied_priority() {
        let mut k = kernel_with_tasks(&[4]);
        assert_eq!(
            k.mutex_create(Priority(4)),
            Err(KernelError::PriorityInUse)
        );
        assert_eq!(
            k.mutex_create(Priority::IDLE),
            Err(KernelError::IdlePriorityReserved)
        );
    }

    #[test]
    fn acquire_elevates_to_ceiling() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mutex_create(Priority(9)).unwrap();

        assert_eq!(
            k.mutex_acquire_start(h, Timeout::Forever),
            Ok(Pend::Taken)
        );
        // The owner's scheduling identity moved up...
        assert!(k.ready.contains(Priority(9)));
        assert!(!k.ready.contains(Priority(4)));
        assert_eq!(k.table[9], PrioSlot::Held(0));
        assert_eq!(k.task(0).priority, Priority(9));
        // ...but its installed priority still holds its table entry.
        assert_eq!(k.table[4], PrioSlot::Held(0));
        assert_eq!(k.task(0).base_priority, Priority(4));
    }

    #[test]
    fn reacquire_by_owner_is_free() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mutex_create(Priority(9)).unwrap();
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));
        for _ in 0..5 {
            assert_eq!(
                k.mutex_acquire_start(h, Timeout::Poll),
                Ok(Pend::Taken)
            );
        }
        // One release frees it.
        let _ = k.mutex_release(h).unwrap();
        assert_eq!(k.mutexes[0].as_ref().unwrap().owner, None);
    }

    #[test]
    fn priority_restored_after_acquire_release_cycles() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mutex_create(Priority(9)).unwrap();
        for _ in 0..3 {
            assert_eq!(
                k.mutex_acquire_start(h, Timeout::Forever),
                Ok(Pend::Taken)
            );
            assert_eq!(k.task(0).priority, Priority(9));
            let _ = k.mutex_release(h).unwrap();
            assert_eq!(k.task(0).priority, Priority(4));
            assert_eq!(k.task(0).base_priority, Priority(4));
            assert!(k.ready.contains(Priority(4)));
            assert!(!k.ready.contains(Priority(9)));
            assert_eq!(k.table[9], PrioSlot::Reserved);
        }
    }

    #[test]
    fn ceiling_not_above_owner_means_no_elevation() {
        let mut k = kernel_with_tasks(&[7]);
        k.set_current_slot(0);
        let h = k.mutex_create(Priority(5)).unwrap();
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));
        assert_eq!(k.task(0).priority, Priority(7));
        assert_eq!(k.table[5], PrioSlot::Reserved);
        let _ = k.mutex_release(h).unwrap();
        assert_eq!(k.task(0).priority, Priority(7));
    }

    #[test]
    fn release_by_non_owner_fails() {
        let mut k = kernel_with_tasks(&[4, 6]);
        k.set_current_slot(0);
        let h = k.mutex_create(Priority(9)).unwrap();
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));
        k.set_current_slot(1);
        assert_eq!(k.mutex_release(h), Err(KernelError::NotOwner));
    }

    #[test]
    fn contended_acquire_blocks_then_receives_transfer() {
        let mut k = kernel_with_tasks(&[4, 6]);
        let h = k.mutex_create(Priority(9)).unwrap();

        k.set_current_slot(0);
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));

        k.set_current_slot(1);
        assert_eq!(
            k.mutex_acquire_start(h, Timeout::Forever),
            Ok(Pend::Waiting)
        );
        assert!(!k.ready.contains(Priority(6)));

        // Owner releases: ownership must transfer directly, never passing
        // through "available", and the new owner is elevated.
        k.set_current_slot(0);
        let _ = k.mutex_release(h).unwrap();
        let m = k.mutexes[0].as_ref().unwrap();
        assert_eq!(m.owner, Some(1));
        assert_eq!(m.owner_base, Priority(6));
        assert!(k.ready.contains(Priority(9)));
        assert_eq!(k.task(1).priority, Priority(9));

        // The woken waiter completes its acquire.
        k.set_current_slot(1);
        assert_eq!(k.mutex_acquire_finish(h), Ok(()));

        // No two tasks ever observe themselves as owner at once.
        assert_ne!(k.mutexes[0].as_ref().unwrap().owner, Some(0));
    }

    #[test]
    fn transfer_prefers_highest_priority_waiter() {
        let mut k = kernel_with_tasks(&[3, 5, 4]);
        let h = k.mutex_create(Priority(9)).unwrap();
        k.set_current_slot(0);
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));
        k.set_current_slot(1);
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Waiting));
        k.set_current_slot(2);
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Waiting));

        k.set_current_slot(0);
        let _ = k.mutex_release(h).unwrap();
        assert_eq!(k.mutexes[0].as_ref().unwrap().owner, Some(1));
        // Priority 4 keeps waiting.
        assert!(k.mutexes[0].as_ref().unwrap().wait.contains(Priority(4)));
    }

    #[test]
    fn contended_acquire_can_time_out() {
        let mut k = kernel_with_tasks(&[4, 6]);
        let h = k.mutex_create(Priority(9)).unwrap();
        k.set_current_slot(0);
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));
        k.set_current_slot(1);
        assert_eq!(
            k.mutex_acquire_start(h, Timeout::For(5)),
            Ok(Pend::Waiting)
        );
        for _ in 0..5 {
            let _ = k.tick();
        }
        assert!(k.ready.contains(Priority(6)));
        assert_eq!(k.mutex_acquire_finish(h), Err(KernelError::TimedOut));
        // Ownership never moved.
        assert_eq!(k.mutexes[0].as_ref().unwrap().owner, Some(0));
        assert!(k.mutexes[0].as_ref().unwrap().wait.is_empty());
    }

    #[test]
    fn acquire_in_isr_is_refused() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mutex_create(Priority(9)).unwrap();
        k.isr_enter();
        assert_eq!(
            k.mutex_acquire_start(h, Timeout::Poll),
            Err(KernelError::IllegalInIsr)
        );
        let _ = k.isr_exit();
    }

    #[test]
    fn delete_frees_ceiling() {
        let mut k = kernel_with_tasks(&[4]);
        let h = k.mutex_create(Priority(9)).unwrap();
        k.set_current_slot(0);
        assert_eq!(k.mutex_acquire_start(h, Timeout::Forever), Ok(Pend::Taken));
        assert_eq!(k.mutex_delete(h), Err(KernelError::InUse));
        let _ = k.mutex_release(h).unwrap();
        assert_eq!(k.mutex_delete(h), Ok(()));
        assert_eq!(k.table[9], PrioSlot::Vacant);
    }
}

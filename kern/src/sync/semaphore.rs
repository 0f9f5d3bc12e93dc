// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Counting and binary semaphores.
//!
//! Both variants share one control block; a binary semaphore is just a
//! counting semaphore whose post saturates at one instead of reporting
//! overflow.

use crate::err::KernelError;
use crate::sync::{finish_wait, validated_delay, Pend, WaitList};
use crate::task::{Kernel, SwitchHint};
use crate::time::{Deadline, Timeout};

/// Which flavor a semaphore was created as.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemKind {
    /// Count is 0 or 1; extra posts are silently absorbed.
    Binary,
    /// Count ranges up to `max`; posting past it reports `CountOverflow`.
    Counting { max: u16 },
}

/// Semaphore control block.
#[derive(Debug)]
pub struct Semaphore {
    pub(crate) kind: SemKind,
    pub(crate) count: u16,
    pub(crate) wait: WaitList,
}

/// Names a semaphore in the kernel's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SemHandle(pub(crate) u8);

impl Kernel {
    /// Allocates a semaphore with the given initial count.
    pub fn sem_create(
        &mut self,
        kind: SemKind,
        initial: u16,
    ) -> Result<SemHandle, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        match kind {
            SemKind::Binary if initial > 1 => {
                return Err(KernelError::CountOverflow)
            }
            SemKind::Counting { max } if initial > max => {
                return Err(KernelError::CountOverflow)
            }
            _ => (),
        }
        let idx = self
            .sems
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::NoFreeControlBlock)?;
        self.sems[idx] = Some(Semaphore {
            kind,
            count: initial,
            wait: WaitList::default(),
        });
        Ok(SemHandle(idx as u8))
    }

    /// Releases a semaphore's control block. Refused while anyone waits on
    /// it.
    pub fn sem_delete(&mut self, h: SemHandle) -> Result<(), KernelError> {
        let sem = self.sem(h)?;
        if !sem.wait.is_empty() {
            return Err(KernelError::WaitersPresent);
        }
        self.sems[usize::from(h.0)] = None;
        Ok(())
    }

    /// First phase of a pend.
    ///
    /// Takes the semaphore if the count allows. Otherwise: a `Poll` reports
    /// `NoEntryAvailable` without suspending; a blocking request (illegal in
    /// interrupt context) parks the caller and returns [`Pend::Waiting`],
    /// after which the caller must yield the CPU and then call
    /// [`Kernel::sem_pend_finish`].
    pub fn sem_pend_start(
        &mut self,
        h: SemHandle,
        timeout: Timeout,
    ) -> Result<Pend, KernelError> {
        let sem = self.sem_mut(h)?;
        if sem.count > 0 {
            sem.count -= 1;
            return Ok(Pend::Taken);
        }
        if timeout == Timeout::Poll {
            return Err(KernelError::NoEntryAvailable);
        }
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let delay = validated_delay(timeout)?;
        let prio = self.task(self.current).priority;
        self.sem_mut(h)?.wait.insert(prio);
        self.park_current(delay);
        Ok(Pend::Waiting)
    }

    /// Second phase of a pend, run after the task is scheduled again.
    pub fn sem_pend_finish(&mut self, h: SemHandle) -> Result<(), KernelError> {
        let slot = self.current;
        // A wake that is neither a post nor a timeout leaves the deadline
        // armed; unlink from the delay list before classifying.
        if matches!(self.task(slot).deadline, Deadline::At(_)) {
            self.delay_remove(slot);
        }
        let slot = usize::from(slot);
        let sem = self
            .sems
            .get_mut(usize::from(h.0))
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::BadHandle)?;
        let task = self.tasks[slot]
            .as_mut()
            .expect("current task slot vacant");
        finish_wait(&mut sem.wait, task.priority, &mut task.deadline)
    }

    /// Posts the semaphore.
    ///
    /// If anyone is waiting, the highest-priority waiter is handed the
    /// signal directly: its wait bit is cleared here (marking the wake as
    /// post-driven) and it becomes ready. Otherwise the count rises, with
    /// binary saturation or counting overflow per [`SemKind`].
    pub fn sem_post(&mut self, h: SemHandle) -> Result<SwitchHint, KernelError> {
        let woken = {
            let sem = self.sem_mut(h)?;
            match sem.wait.highest() {
                Some(prio) => {
                    sem.wait.remove(prio);
                    Some(prio)
                }
                None => {
                    match sem.kind {
                        SemKind::Binary => sem.count = 1,
                        SemKind::Counting { max } => {
                            if sem.count >= max {
                                return Err(KernelError::CountOverflow);
                            }
                            sem.count += 1;
                        }
                    }
                    None
                }
            }
        };
        match woken {
            Some(prio) => {
                let slot = self.waiter_slot(prio);
                self.wake_waiter(slot);
                Ok(self.reschedule_hint())
            }
            None => Ok(SwitchHint::Same),
        }
    }

    /// Current count, for diagnostics.
    pub fn sem_count(&self, h: SemHandle) -> Result<u16, KernelError> {
        Ok(self.sem(h)?.count)
    }

    fn sem(&self, h: SemHandle) -> Result<&Semaphore, KernelError> {
        self.sems
            .get(usize::from(h.0))
            .and_then(|s| s.as_ref())
            .ok_or(KernelError::BadHandle)
    }

    fn sem_mut(&mut self, h: SemHandle) -> Result<&mut Semaphore, KernelError> {
        self.sems
            .get_mut(usize::from(h.0))
            .and_then(|s| s.as_mut())
            .ok_or(KernelError::BadHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Priority, TaskFlags};
    use crate::task::TaskDesc;
    use crate::time::Deadline;

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
    fn pend_takes_available_count() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.sem_create(SemKind::Counting { max: 4 }, 2).unwrap();
        assert_eq!(k.sem_pend_start(h, Timeout::Forever), Ok(Pend::Taken));
        assert_eq!(k.sem_pend_start(h, Timeout::Poll), Ok(Pend::Taken));
        assert_eq!(
            k.sem_pend_start(h, Timeout::Poll),
            Err(KernelError::NoEntryAvailable)
        );
    }

    #[test]
    fn post_with_no_waiter_raises_count() {
        let mut k = kernel_with_tasks(&[4]);
        let h = k.sem_create(SemKind::Counting { max: 2 }, 0).unwrap();
        assert_eq!(k.sem_post(h), Ok(SwitchHint::Same));
        assert_eq!(k.sem_post(h), Ok(SwitchHint::Same));
        assert_eq!(k.sem_post(h), Err(KernelError::CountOverflow));
        assert_eq!(k.sem_count(h), Ok(2));
    }

    #[test]
    fn binary_post_saturates_silently() {
        let mut k = kernel_with_tasks(&[4]);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        assert_eq!(k.sem_post(h), Ok(SwitchHint::Same));
        assert_eq!(k.sem_post(h), Ok(SwitchHint::Same));
        assert_eq!(k.sem_count(h), Ok(1));
    }

    #[test]
    fn signal_conservation_over_mixed_sequences() {
        // Successful pends never outnumber posts plus the initial count.
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let initial = 2u32;
        let h = k
            .sem_create(SemKind::Counting { max: 100 }, initial as u16)
            .unwrap();

        let mut posts = 0u32;
        let mut takes = 0u32;
        // A little deterministic churn.
        for i in 0u32..200 {
            if i % 3 == 0 {
                if k.sem_post(h).is_ok() {
                    posts += 1;
                }
            } else if k.sem_pend_start(h, Timeout::Poll) == Ok(Pend::Taken) {
                takes += 1;
            }
            assert!(takes <= posts + initial, "spurious signal at step {i}");
        }
        assert_eq!(
            u32::from(k.sem_count(h).unwrap()),
            posts + initial - takes
        );
    }

    #[test]
    fn timeout_expiry_reports_timed_out() {
        // Task A pends with a 50-tick timeout and nobody posts.
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        assert_eq!(
            k.sem_pend_start(h, Timeout::For(50)),
            Ok(Pend::Waiting)
        );
        assert!(!k.ready.contains(Priority(4)));

        for _ in 0..49 {
            let _ = k.tick();
            assert!(!k.ready.contains(Priority(4)));
        }
        let _ = k.tick();
        assert!(k.ready.contains(Priority(4)), "no wake at the deadline");

        assert_eq!(k.sem_pend_finish(h), Err(KernelError::TimedOut));
        assert!(k.sems[0].as_ref().unwrap().wait.is_empty());
        assert_eq!(k.task(0).deadline, Deadline::None);
    }

    #[test]
    fn post_before_deadline_wins() {
        // Same setup, but task B posts at tick 10.
        let mut k = kernel_with_tasks(&[4, 2]);
        k.set_current_slot(0);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        assert_eq!(
            k.sem_pend_start(h, Timeout::For(50)),
            Ok(Pend::Waiting)
        );
        // The low-priority task runs while A waits.
        k.set_current_slot(1);

        for _ in 0..10 {
            let _ = k.tick();
        }
        let hint = k.sem_post(h).unwrap();
        assert_eq!(hint, SwitchHint::Preempt);
        assert!(k.ready.contains(Priority(4)));
        k.set_current_slot(0);
        assert_eq!(k.sem_pend_finish(h), Ok(()));

        // The count was handed to the waiter, not banked.
        assert_eq!(k.sem_count(h), Ok(0));
        // And the deadline must not fire later.
        for _ in 0..60 {
            let _ = k.tick();
        }
        assert_eq!(k.task(0).deadline, Deadline::None);
    }

    #[test]
    fn post_wakes_highest_priority_waiter() {
        let mut k = kernel_with_tasks(&[3, 5, 4]);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        for slot in 0..3 {
            k.set_current_slot(slot);
            assert_eq!(
                k.sem_pend_start(h, Timeout::Forever),
                Ok(Pend::Waiting)
            );
        }
        let _ = k.sem_post(h).unwrap();
        // Priority 5 (slot 1) goes first, regardless of arrival order.
        assert!(k.ready.contains(Priority(5)));
        assert!(!k.ready.contains(Priority(3)));
        assert!(!k.ready.contains(Priority(4)));

        let _ = k.sem_post(h).unwrap();
        assert!(k.ready.contains(Priority(4)));
        assert!(!k.ready.contains(Priority(3)));
    }

    #[test]
    fn blocking_pend_in_isr_is_refused() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        k.isr_enter();
        assert_eq!(
            k.sem_pend_start(h, Timeout::Forever),
            Err(KernelError::IllegalInIsr)
        );
        // Polling is non-blocking and stays legal.
        assert_eq!(
            k.sem_pend_start(h, Timeout::Poll),
            Err(KernelError::NoEntryAvailable)
        );
        let _ = k.isr_exit();
    }

    #[test]
    fn zero_tick_timeout_is_malformed() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        assert_eq!(
            k.sem_pend_start(h, Timeout::For(0)),
            Err(KernelError::BadDelay)
        );
        // A malformed timeout must not leave the caller parked.
        assert!(k.ready.contains(Priority(4)));
        assert!(k.sems[0].as_ref().unwrap().wait.is_empty());
    }

    #[test]
    fn delete_refuses_while_waited_on() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.sem_create(SemKind::Binary, 0).unwrap();
        assert_eq!(
            k.sem_pend_start(h, Timeout::Forever),
            Ok(Pend::Waiting)
        );
        assert_eq!(k.sem_delete(h), Err(KernelError::WaitersPresent));
        let _ = k.sem_post(h).unwrap();
        assert_eq!(k.sem_pend_finish(h), Ok(()));
        assert_eq!(k.sem_delete(h), Ok(()));
        assert_eq!(k.sem_post(h), Err(KernelError::BadHandle));
    }

    #[test]
    fn pool_exhaustion() {
        let mut k = kernel_with_tasks(&[4]);
        for _ in 0..abi::MAX_SEMAPHORES {
            k.sem_create(SemKind::Binary, 0).unwrap();
        }
        assert_eq!(
            k.sem_create(SemKind::Binary, 0),
            Err(KernelError::NoFreeControlBlock)
        );
    }
}

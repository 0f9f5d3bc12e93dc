// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-slot mailboxes.
//!
//! A mailbox passes one word-sized message at a time. Posting into a mailbox
//! that already holds an unclaimed message *replaces* it -- no error is
//! raised and the older message is gone. That is the contract, not an
//! accident; callers that need depth use a queue.
//!
//! When a waiter exists, the poster bypasses the slot entirely and writes
//! the message straight into the waiter's TCB, so the slot stays free for
//! the next post.

use crate::err::KernelError;
use crate::sync::{finish_wait, validated_delay, Pend, WaitList};
use crate::task::{Kernel, SwitchHint};
use crate::time::{Deadline, Timeout};

/// Mailbox control block.
#[derive(Debug, Default)]
pub struct Mailbox {
    pub(crate) message: Option<usize>,
    pub(crate) wait: WaitList,
}

/// Names a mailbox in the kernel's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MailboxHandle(pub(crate) u8);

/// First-phase outcome of a mailbox pend.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum MboxPend {
    /// A message was already stored.
    Taken(usize),
    /// The caller was parked; the message will arrive via
    /// [`Kernel::mbox_pend_finish`].
    Waiting,
}

impl Kernel {
    /// Allocates an empty mailbox.
    pub fn mbox_create(&mut self) -> Result<MailboxHandle, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let idx = self
            .mailboxes
            .iter()
            .position(|m| m.is_none())
            .ok_or(KernelError::NoFreeControlBlock)?;
        self.mailboxes[idx] = Some(Mailbox::default());
        Ok(MailboxHandle(idx as u8))
    }

    /// Releases a mailbox's control block. Refused while waited on; a stored
    /// message is discarded.
    pub fn mbox_delete(&mut self, h: MailboxHandle) -> Result<(), KernelError> {
        let m = self.mbox(h)?;
        if !m.wait.is_empty() {
            return Err(KernelError::WaitersPresent);
        }
        self.mailboxes[usize::from(h.0)] = None;
        Ok(())
    }

    /// First phase of a pend: take the stored message, or park.
    pub fn mbox_pend_start(
        &mut self,
        h: MailboxHandle,
        timeout: Timeout,
    ) -> Result<MboxPend, KernelError> {
        let m = self.mbox_mut(h)?;
        if let Some(msg) = m.message.take() {
            return Ok(MboxPend::Taken(msg));
        }
        if timeout == Timeout::Poll {
            return Err(KernelError::NoEntryAvailable);
        }
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let delay = validated_delay(timeout)?;
        let prio = self.task(self.current).priority;
        self.mbox_mut(h)?.wait.insert(prio);
        self.park_current(delay);
        Ok(MboxPend::Waiting)
    }

    /// Second phase of a pend; on success, yields the message the poster
    /// stored in the caller's TCB.
    pub fn mbox_pend_finish(
        &mut self,
        h: MailboxHandle,
    ) -> Result<usize, KernelError> {
        let slot = self.current;
        // A wake that is neither a delivery nor a timeout leaves the
        // deadline armed; unlink from the delay list before classifying.
        if matches!(self.task(slot).deadline, Deadline::At(_)) {
            self.delay_remove(slot);
        }
        let slot = usize::from(slot);
        let m = self
            .mailboxes
            .get_mut(usize::from(h.0))
            .and_then(|m| m.as_mut())
            .ok_or(KernelError::BadHandle)?;
        let task = self.tasks[slot]
            .as_mut()
            .expect("current task slot vacant");
        finish_wait(&mut m.wait, task.priority, &mut task.deadline)?;
        Ok(task
            .mbox_msg
            .take()
            .expect("mailbox wake without a delivered message"))
    }

    /// Posts a message. Delivers directly to the highest-priority waiter if
    /// there is one; otherwise stores it, replacing any unclaimed message.
    pub fn mbox_post(
        &mut self,
        h: MailboxHandle,
        msg: usize,
    ) -> Result<SwitchHint, KernelError> {
        let woken = {
            let m = self.mbox_mut(h)?;
            match m.wait.highest() {
                Some(prio) => {
                    m.wait.remove(prio);
                    Some(prio)
                }
                None => {
                    // Replaces any unclaimed message; see the module doc.
                    m.message = Some(msg);
                    None
                }
            }
        };
        match woken {
            Some(prio) => {
                let slot = self.waiter_slot(prio);
                self.task_mut(slot).mbox_msg = Some(msg);
                self.wake_waiter(slot);
                Ok(self.reschedule_hint())
            }
            None => Ok(SwitchHint::Same),
        }
    }

    fn mbox(&self, h: MailboxHandle) -> Result<&Mailbox, KernelError> {
        self.mailboxes
            .get(usize::from(h.0))
            .and_then(|m| m.as_ref())
            .ok_or(KernelError::BadHandle)
    }

    fn mbox_mut(
        &mut self,
        h: MailboxHandle,
    ) -> Result<&mut Mailbox, KernelError> {
        self.mailboxes
            .get_mut(usize::from(h.0))
            .and_then(|m| m.as_mut())
            .ok_or(KernelError::BadHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use abi::{Priority, TaskFlags};
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
    fn post_then_pend_round_trips() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mbox_create().unwrap();
        let _ = k.mbox_post(h, 0xAB).unwrap();
        assert_eq!(
            k.mbox_pend_start(h, Timeout::Poll),
            Ok(MboxPend::Taken(0xAB))
        );
        // Slot is empty again.
        assert_eq!(
            k.mbox_pend_start(h, Timeout::Poll),
            Err(KernelError::NoEntryAvailable)
        );
    }

    #[test]
    fn double_post_overwrites_silently() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mbox_create().unwrap();
        assert_eq!(k.mbox_post(h, 1), Ok(SwitchHint::Same));
        assert_eq!(k.mbox_post(h, 2), Ok(SwitchHint::Same));
        // The newer message wins; the older one is simply gone.
        assert_eq!(
            k.mbox_pend_start(h, Timeout::Poll),
            Ok(MboxPend::Taken(2))
        );
    }

    #[test]
    fn post_delivers_directly_to_waiter() {
        let mut k = kernel_with_tasks(&[4, 6]);
        let h = k.mbox_create().unwrap();
        k.set_current_slot(0);
        assert_eq!(
            k.mbox_pend_start(h, Timeout::Forever),
            Ok(MboxPend::Waiting)
        );
        k.set_current_slot(1);
        let hint = k.mbox_post(h, 77).unwrap();
        assert_eq!(hint, SwitchHint::Same); // waiter is lower priority
        assert!(k.ready.contains(Priority(4)));
        // Delivery bypassed the slot.
        assert_eq!(k.mailboxes[0].as_ref().unwrap().message, None);

        k.set_current_slot(0);
        assert_eq!(k.mbox_pend_finish(h), Ok(77));
    }

    #[test]
    fn waiting_pend_times_out() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mbox_create().unwrap();
        assert_eq!(
            k.mbox_pend_start(h, Timeout::For(3)),
            Ok(MboxPend::Waiting)
        );
        for _ in 0..3 {
            let _ = k.tick();
        }
        assert_eq!(k.mbox_pend_finish(h), Err(KernelError::TimedOut));
    }

    #[test]
    fn waiters_are_woken_in_priority_order() {
        let mut k = kernel_with_tasks(&[3, 5, 4]);
        let h = k.mbox_create().unwrap();
        for slot in 0..3 {
            k.set_current_slot(slot);
            assert_eq!(
                k.mbox_pend_start(h, Timeout::Forever),
                Ok(MboxPend::Waiting)
            );
        }
        let _ = k.mbox_post(h, 111).unwrap();
        k.set_current_slot(1);
        assert_eq!(k.mbox_pend_finish(h), Ok(111));

        let _ = k.mbox_post(h, 222).unwrap();
        k.set_current_slot(2);
        assert_eq!(k.mbox_pend_finish(h), Ok(222));
    }

    #[test]
    fn delete_discards_message_but_not_waiters() {
        let mut k = kernel_with_tasks(&[4]);
        k.set_current_slot(0);
        let h = k.mbox_create().unwrap();
        assert_eq!(
            k.mbox_pend_start(h, Timeout::Forever),
            Ok(MboxPend::Waiting)
        );
        assert_eq!(k.mbox_delete(h), Err(KernelError::WaitersPresent));
        let _ = k.mbox_post(h, 5).unwrap();
        assert_eq!(k.mbox_pend_finish(h), Ok(5));
        assert_eq!(k.mbox_delete(h), Ok(()));
    }
}

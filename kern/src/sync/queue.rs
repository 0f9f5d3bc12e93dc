// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FIFO queues over a circular ring of fixed-size elements.
//!
//! The ring works in bytes with a runtime element size, so the same cursor
//! logic serves byte queues (element size 1) and record queues (element size
//! = the record's size; the typed front end in the API layer moves records
//! through here with `zerocopy`).
//!
//! Fixed queues borrow their storage -- typically a named `static`, which
//! keeps it visible to debuggers -- and live until deleted. Dynamic queues
//! (feature `dynamic`) own heap storage and give it back on delete.
//!
//! `post` never blocks: a full ring reports [`KernelError::QueueFull`] and
//! leaves the contents untouched. `pend` follows the shared two-phase
//! blocking protocol, with one twist: being woken promises only that an
//! element *was* posted, so the resumed waiter drains the ring itself and
//! reports whether anything was still there.

use crate::err::KernelError;
use crate::sync::{finish_wait, validated_delay, Pend, WaitList};
use crate::task::{Kernel, SwitchHint};
use crate::time::{Deadline, Timeout};

/// Backing memory for a queue's ring.
#[derive(Debug)]
pub(crate) enum RingStorage {
    /// Caller-provided memory, alive for the life of the system.
    Borrowed(&'static mut [u8]),
    /// Heap allocation owned by the queue.
    #[cfg(feature = "dynamic")]
    Owned(alloc::boxed::Box<[u8]>),
}

impl RingStorage {
    fn bytes(&self) -> &[u8] {
        match self {
            RingStorage::Borrowed(b) => b,
            #[cfg(feature = "dynamic")]
            RingStorage::Owned(b) => b,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            RingStorage::Borrowed(b) => b,
            #[cfg(feature = "dynamic")]
            RingStorage::Owned(b) => b,
        }
    }
}

/// Queue control block.
#[derive(Debug)]
pub struct Queue {
    pub(crate) elem_size: usize,
    /// Capacity in elements.
    pub(crate) capacity: usize,
    /// Elements currently stored.
    pub(crate) count: usize,
    /// Element index of the next write.
    pub(crate) inpos: usize,
    /// Element index of the next read.
    pub(crate) outpos: usize,
    pub(crate) storage: RingStorage,
    pub(crate) wait: WaitList,
}

impl Queue {
    fn write_from(&mut self, elem: &[u8]) {
        debug_assert!(self.count < self.capacity);
        let esz = self.elem_size;
        let at = self.inpos * esz;
        self.storage.bytes_mut()[at..at + esz].copy_from_slice(elem);
        self.inpos += 1;
        if self.inpos == self.capacity {
            self.inpos = 0;
        }
        self.count += 1;
    }

    fn read_into(&mut self, dest: &mut [u8]) {
        debug_assert!(self.count > 0);
        let esz = self.elem_size;
        let at = self.outpos * esz;
        dest.copy_from_slice(&self.storage.bytes()[at..at + esz]);
        self.outpos += 1;
        if self.outpos == self.capacity {
            self.outpos = 0;
        }
        self.count -= 1;
    }
}

/// Names a queue in the kernel's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct QueueHandle(pub(crate) u8);

impl Kernel {
    /// Allocates a queue over caller-provided storage. The capacity is
    /// however many whole elements fit.
    pub fn queue_create(
        &mut self,
        storage: &'static mut [u8],
        elem_size: usize,
    ) -> Result<QueueHandle, KernelError> {
        // Fail before taking the caller's storage.
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let capacity = storage
            .len()
            .checked_div(elem_size)
            .ok_or(KernelError::BadElementSize)?;
        self.queue_install(RingStorage::Borrowed(storage), elem_size, capacity)
    }

    /// Allocates a queue with heap-owned storage for `capacity` elements.
    #[cfg(feature = "dynamic")]
    pub fn queue_create_dynamic(
        &mut self,
        capacity: usize,
        elem_size: usize,
    ) -> Result<QueueHandle, KernelError> {
        if elem_size == 0 {
            return Err(KernelError::BadElementSize);
        }
        let len = capacity
            .checked_mul(elem_size)
            .ok_or(KernelError::AllocFailed)?;
        let buf = alloc::vec![0u8; len].into_boxed_slice();
        self.queue_install(RingStorage::Owned(buf), elem_size, capacity)
    }

    fn queue_install(
        &mut self,
        storage: RingStorage,
        elem_size: usize,
        capacity: usize,
    ) -> Result<QueueHandle, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        if capacity == 0 {
            return Err(KernelError::BadElementSize);
        }
        let idx = self
            .queues
            .iter()
            .position(|q| q.is_none())
            .ok_or(KernelError::NoFreeControlBlock)?;
        self.queues[idx] = Some(Queue {
            elem_size,
            capacity,
            count: 0,
            inpos: 0,
            outpos: 0,
            storage,
            wait: WaitList::default(),
        });
        Ok(QueueHandle(idx as u8))
    }

    /// Releases a queue's control block (and its buffer, for dynamic
    /// queues). Refused while waited on.
    pub fn queue_delete(&mut self, h: QueueHandle) -> Result<(), KernelError> {
        let q = self.queue(h)?;
        if !q.wait.is_empty() {
            return Err(KernelError::WaitersPresent);
        }
        self.queues[usize::from(h.0)] = None;
        Ok(())
    }

    /// Posts one element. Never blocks: a full ring is `QueueFull` and
    /// nothing is disturbed. Legal in interrupt context.
    pub fn queue_post(
        &mut self,
        h: QueueHandle,
        elem: &[u8],
    ) -> Result<SwitchHint, KernelError> {
        let woken = {
            let q = self.queue_mut(h)?;
            if elem.len() != q.elem_size {
                return Err(KernelError::BadElementSize);
            }
            if q.count == q.capacity {
                return Err(KernelError::QueueFull);
            }
            q.write_from(elem);
            match q.wait.highest() {
                Some(prio) => {
                    q.wait.remove(prio);
                    Some(prio)
                }
                None => None,
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

    /// First phase of a pend: drain one element into `dest`, or park.
    pub fn queue_pend_start(
        &mut self,
        h: QueueHandle,
        timeout: Timeout,
        dest: &mut [u8],
    ) -> Result<Pend, KernelError> {
        let q = self.queue_mut(h)?;
        if dest.len() != q.elem_size {
            return Err(KernelError::BadElementSize);
        }
        if q.count > 0 {
            q.read_into(dest);
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
        self.queue_mut(h)?.wait.insert(prio);
        self.park_current(delay);
        Ok(Pend::Waiting)
    }

    /// Second phase of a pend. `Ok(true)` means an element landed in `dest`;
    /// `Ok(false)` means the wake was genuine but something else drained the
    /// ring first, and the caller should start over (its remaining timeout
    /// is its own bookkeeping).
    pub fn queue_pend_finish(
        &mut self,
        h: QueueHandle,
        dest: &mut [u8],
    ) -> Result<bool, KernelError> {
        let slot = self.current;
        // A wake that is neither a post nor a timeout leaves the deadline
        // armed; unlink from the delay list before classifying.
        if matches!(self.task(slot).deadline, Deadline::At(_)) {
            self.delay_remove(slot);
        }
        let slot = usize::from(slot);
        let q = self
            .queues
            .get_mut(usize::from(h.0))
            .and_then(|q| q.as_mut())
            .ok_or(KernelError::BadHandle)?;
        let task = self.tasks[slot]
            .as_mut()
            .expect("current task slot vacant");
        finish_wait(&mut q.wait, task.priority, &mut task.deadline)?;
        if q.count > 0 {
            q.read_into(dest);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Discards everything in the ring. Waiters stay parked; they're waiting
    /// for *future* posts.
    pub fn queue_flush(&mut self, h: QueueHandle) -> Result<(), KernelError> {
        let q = self.queue_mut(h)?;
        q.count = 0;
        q.inpos = 0;
        q.outpos = 0;
        Ok(())
    }

    /// Elements currently stored, for diagnostics.
    pub fn queue_len(&self, h: QueueHandle) -> Result<usize, KernelError> {
        Ok(self.queue(h)?.count)
    }

    fn queue(&self, h: QueueHandle) -> Result<&Queue, KernelError> {
        self.queues
            .get(usize::from(h.0))
            .and_then(|q| q.as_ref())
            .ok_or(KernelError::BadHandle)
    }

    fn queue_mut(&mut self, h: QueueHandle) -> Result<&mut Queue, KernelError> {
        self.queues
            .get_mut(usize::from(h.0))
            .and_then(|q| q.as_mut())
            .ok_or(KernelError::BadHandle)
    }
}

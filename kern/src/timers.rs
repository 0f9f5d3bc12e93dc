// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Soft timers: software timers multiplexed over the kernel tick by a
//! dedicated service task.
//!
//! Timers live in a fixed pool and are organized by absolute deadline in two
//! binary min-heaps. The heaps are classic 1-indexed arrays (parent at
//! `i >> 1`, children at `2i` and `2i + 1`) holding pool indices, keyed by
//! the pool entries' deadlines.
//!
//! Why two heaps: deadlines are absolute ticks and the tick counter wraps.
//! A deadline landing past the wrap point cannot be compared numerically
//! with deadlines on this side of it, so it goes into the *other* heap. At
//! every counter rollover the heaps swap roles -- the "future" heap becomes
//! "current" -- and the cycle restarts. Each heap only ever holds deadlines
//! from a single counter epoch, so within a heap, numeric comparison is
//! correct.
//!
//! The service task sleeps on a private semaphore with a timeout equal to
//! the nearest current-heap deadline. Arming or stopping a timer, and the
//! rollover swap, post that semaphore so the task re-evaluates its sleep.
//! Expired timers are popped (sifting down to re-heapify), their callbacks
//! run *in the service task's context, outside the critical section*, and a
//! callback returning `Some(period)` is re-armed into whichever heap its new
//! deadline belongs to. One-shot callbacks return `None` and leave the timer
//! stopped but reusable.

use core::num::NonZeroU32;

use abi::MAX_TIMERS;

use crate::err::KernelError;
use crate::sync::SemHandle;
use crate::task::{Kernel, SwitchHint};
use crate::time::Tick;

/// Timer callback, run by the service task when the deadline arrives. The
/// argument is the context word given at creation. Returning `Some(period)`
/// re-arms the timer `period` ticks out; `None` retires it to the stopped
/// state.
pub type TimerCallback = fn(usize) -> Option<NonZeroU32>;

/// Names a timer in the kernel's pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct TimerHandle(pub(crate) u8);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum TimerState {
    /// Pool entry is free.
    Unused,
    /// Allocated but not armed.
    Stopped,
    /// Armed; resident in one of the heaps (or popped and about to run).
    Running,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct SoftTimer {
    pub(crate) state: TimerState,
    /// Absolute deadline; meaningful while `Running`.
    pub(crate) deadline: Tick,
    pub(crate) callback: TimerCallback,
    pub(crate) context: usize,
    /// Which heap holds this timer while `Running`.
    pub(crate) heap: u8,
}

fn unarmed(_: usize) -> Option<NonZeroU32> {
    None
}

impl SoftTimer {
    const UNUSED: Self = SoftTimer {
        state: TimerState::Unused,
        deadline: Tick::ZERO,
        callback: unarmed,
        context: 0,
        heap: 0,
    };
}

/// 1-indexed binary min-heap of pool indices, keyed by deadline.
#[derive(Debug)]
pub(crate) struct TimerHeap {
    /// Slot 0 is unused; live entries occupy `1..=len`.
    slots: [u8; MAX_TIMERS + 1],
    len: usize,
}

impl TimerHeap {
    const fn new() -> Self {
        Self {
            slots: [0; MAX_TIMERS + 1],
            len: 0,
        }
    }

    fn key(&self, pool: &[SoftTimer], i: usize) -> u32 {
        pool[usize::from(self.slots[i])].deadline.0
    }

    fn insert(&mut self, pool: &[SoftTimer], idx: u8) {
        debug_assert!(self.len < MAX_TIMERS);
        self.len += 1;
        self.slots[self.len] = idx;
        self.sift_up(pool, self.len);
    }

    fn sift_up(&mut self, pool: &[SoftTimer], mut i: usize) {
        while i > 1 {
            let parent = i >> 1;
            if self.key(pool, i) < self.key(pool, parent) {
                self.slots.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, pool: &[SoftTimer], mut i: usize) {
        loop {
            let left = 2 * i;
            let right = left + 1;
            let mut least = i;
            if left <= self.len && self.key(pool, left) < self.key(pool, least)
            {
                least = left;
            }
            if right <= self.len
                && self.key(pool, right) < self.key(pool, least)
            {
                least = right;
            }
            if least == i {
                break;
            }
            self.slots.swap(i, least);
            i = least;
        }
    }

    fn peek(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.slots[1])
        } else {
            None
        }
    }

    fn pop(&mut self, pool: &[SoftTimer]) -> Option<u8> {
        if self.len == 0 {
            return None;
        }
        let root = self.slots[1];
        self.slots[1] = self.slots[self.len];
        self.len -= 1;
        if self.len > 1 {
            self.sift_down(pool, 1);
        }
        Some(root)
    }

    /// Removes an arbitrary pool index: locate it by linear scan, bubble it
    /// to the root unconditionally (each displaced ancestor is no larger
    /// than anything in the subtree it moves down into), then pop.
    fn remove(&mut self, pool: &[SoftTimer], idx: u8) -> bool {
        let Some(mut pos) = (1..=self.len).find(|&i| self.slots[i] == idx)
        else {
            return false;
        };
        while pos > 1 {
            self.slots.swap(pos, pos >> 1);
            pos >>= 1;
        }
        let _ = self.pop(pool);
        true
    }

    #[cfg(test)]
    fn assert_valid(&self, pool: &[SoftTimer]) {
        for i in 2..=self.len {
            assert!(
                self.key(pool, i >> 1) <= self.key(pool, i),
                "heap order broken at {i}",
            );
        }
    }
}

/// State of the soft-timer service, owned by the kernel object.
#[derive(Debug)]
pub struct TimerService {
    pub(crate) pool: [SoftTimer; MAX_TIMERS],
    pub(crate) heaps: [TimerHeap; 2],
    /// Index of the "current" heap; the other collects deadlines past the
    /// wrap.
    pub(crate) active: u8,
    /// Semaphore the service task sleeps on. Filled in at startup; timer
    /// operations in a kernel without the service task simply don't poke
    /// anyone.
    pub(crate) service_sem: Option<SemHandle>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            pool: [SoftTimer::UNUSED; MAX_TIMERS],
            heaps: [TimerHeap::new(), TimerHeap::new()],
            active: 0,
            service_sem: None,
        }
    }

    fn arm(&mut self, idx: usize, deadline: Tick, heap: usize) {
        let t = &mut self.pool[idx];
        t.state = TimerState::Running;
        t.deadline = deadline;
        t.heap = heap as u8;
        self.heaps[heap].insert(&self.pool, idx as u8);
    }

    fn disarm(&mut self, idx: usize) {
        let heap = usize::from(self.pool[idx].heap);
        let removed = self.heaps[heap].remove(&self.pool, idx as u8);
        debug_assert!(removed, "running timer absent from its heap");
    }

    fn next_deadline(&self) -> Option<Tick> {
        self.heaps[usize::from(self.active)]
            .peek()
            .map(|idx| self.pool[usize::from(idx)].deadline)
    }

    /// Pops the nearest current-heap timer if its deadline has arrived,
    /// marking it stopped (a periodic callback will re-arm it).
    fn pop_expired(&mut self, now: Tick) -> Option<u8> {
        let heap = &mut self.heaps[usize::from(self.active)];
        let idx = heap.peek()?;
        if self.pool[usize::from(idx)].deadline.0 > now.0 {
            return None;
        }
        let popped = heap.pop(&self.pool);
        debug_assert_eq!(popped, Some(idx));
        self.pool[usize::from(idx)].state = TimerState::Stopped;
        Some(idx)
    }

    fn swap_heaps(&mut self) {
        self.active ^= 1;
    }

    pub(crate) fn live(&self) -> u32 {
        self.pool
            .iter()
            .filter(|t| t.state != TimerState::Unused)
            .count() as u32
    }
}

impl Kernel {
    /// Allocates a timer in the stopped state.
    pub fn timer_create(
        &mut self,
        callback: TimerCallback,
        context: usize,
    ) -> Result<TimerHandle, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let idx = self
            .timers
            .pool
            .iter()
            .position(|t| t.state == TimerState::Unused)
            .ok_or(KernelError::NoFreeControlBlock)?;
        self.timers.pool[idx] = SoftTimer {
            state: TimerState::Stopped,
            deadline: Tick::ZERO,
            callback,
            context,
            heap: 0,
        };
        Ok(TimerHandle(idx as u8))
    }

    /// Arms a timer to fire `delta` ticks from now, re-arming it if it was
    /// already running. The deadline decides which heap it joins: this
    /// epoch's, or the one that becomes current after the next rollover.
    pub fn timer_start(
        &mut self,
        h: TimerHandle,
        delta: u32,
    ) -> Result<SwitchHint, KernelError> {
        let idx = self.timer_index(h)?;
        if delta == 0 || delta >= Tick::ROLLOVER {
            return Err(KernelError::BadDelay);
        }
        if self.timers.pool[idx].state == TimerState::Running {
            self.timers.disarm(idx);
        }
        let (deadline, wrapped) = self.tick.deadline_after(delta);
        let active = usize::from(self.timers.active);
        let heap = if wrapped { active ^ 1 } else { active };
        self.timers.arm(idx, deadline, heap);
        Ok(self.poke_timer_service())
    }

    /// Stops a timer. With `release`, the pool entry is freed for reuse;
    /// otherwise the timer stays allocated and can be started again.
    pub fn timer_stop(
        &mut self,
        h: TimerHandle,
        release: bool,
    ) -> Result<SwitchHint, KernelError> {
        let idx = self.timer_index(h)?;
        if self.timers.pool[idx].state == TimerState::Running {
            self.timers.disarm(idx);
        }
        self.timers.pool[idx].state = if release {
            TimerState::Unused
        } else {
            TimerState::Stopped
        };
        Ok(self.poke_timer_service())
    }

    /// Ticks until the timer fires; 0 if it isn't running.
    pub fn timer_remaining(&self, h: TimerHandle) -> Result<u32, KernelError> {
        let idx = self.timer_index(h)?;
        let t = &self.timers.pool[idx];
        if t.state == TimerState::Running {
            // `until` reads a numerically smaller deadline as next-epoch,
            // which is exactly how wrapped deadlines are laid out.
            Ok(self.tick.until(t.deadline))
        } else {
            Ok(0)
        }
    }

    /// Ticks until the nearest current-heap deadline: the service task's
    /// sleep budget. `None` means nothing is due this epoch.
    pub fn timers_next_wait(&self) -> Option<u32> {
        self.timers.next_deadline().map(|d| {
            if d.0 <= self.tick.0 {
                0
            } else {
                self.tick.until(d)
            }
        })
    }

    /// Hands out the next expired timer, if any, for the service task to
    /// run. The timer leaves its heap and is marked stopped; a periodic
    /// callback re-arms it via [`Kernel::timer_start`].
    pub fn timers_take_expired(
        &mut self,
    ) -> Option<(TimerHandle, TimerCallback, usize)> {
        let now = self.tick;
        self.timers.pop_expired(now).map(|idx| {
            let t = &self.timers.pool[usize::from(idx)];
            (TimerHandle(idx), t.callback, t.context)
        })
    }

    /// Rollover service: swap heap roles and wake the service task to look
    /// at the newly current heap.
    pub(crate) fn timers_rollover(&mut self) -> SwitchHint {
        self.timers.swap_heaps();
        crate::klog!("tick rollover; timer heaps swapped");
        self.poke_timer_service()
    }

    /// Wakes the service task by posting its semaphore. Saturation is fine;
    /// the task re-evaluates everything on each wake.
    fn poke_timer_service(&mut self) -> SwitchHint {
        match self.timers.service_sem {
            Some(sem) => self.sem_post(sem).unwrap_or(SwitchHint::Same),
            None => SwitchHint::Same,
        }
    }

    fn timer_index(&self, h: TimerHandle) -> Result<usize, KernelError> {
        let idx = usize::from(h.0);
        if idx >= MAX_TIMERS
            || self.timers.pool[idx].state == TimerState::Unused
        {
            return Err(KernelError::BadHandle);
        }
        Ok(idx)
    }
}

/// Entry point of the soft-timer service task, installed at startup.
///
/// The loop alternates between sleeping until the nearest deadline (or a
/// poke) and draining expired timers. Callbacks run here, in task context,
/// with no kernel lock held.
pub fn timer_service_entry(_: usize) -> ! {
    loop {
        let wait = crate::arch::with_kernel(|k| k.timers_next_wait());
        match wait {
            // Something is due right now; skip the nap.
            Some(0) => (),
            wait => {
                let timeout = match wait {
                    None => crate::time::Timeout::Forever,
                    Some(n) => crate::time::Timeout::For(n),
                };
                // Waking by timeout is the normal case; a poke just means
                // "look again sooner".
                crate::api::timer_service_wait(timeout);
            }
        }
        while let Some((h, callback, context)) =
            crate::arch::with_kernel(|k| k.timers_take_expired())
        {
            if let Some(period) = callback(context) {
                let _ = crate::api::timer_start(h, period.get());
            }
        }
    }
}

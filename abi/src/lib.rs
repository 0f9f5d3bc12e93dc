// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel ABI definitions, shared between the kernel and application code.
//!
//! Everything in this crate is either plain data or a constant, so that
//! host-side tools can interpret kernel state without linking the kernel
//! itself.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Number of slots in the kernel's task arena. This bounds the number of
/// simultaneously installed tasks, including the idle task and the soft-timer
/// service task.
pub const MAX_TASKS: usize = 16;

/// Semaphore pool size.
pub const MAX_SEMAPHORES: usize = 8;
/// Mutex pool size. Each live mutex also pins one priority level as its
/// ceiling, so this is bounded in practice by the priority count.
pub const MAX_MUTEXES: usize = 4;
/// Mailbox pool size.
pub const MAX_MAILBOXES: usize = 4;
/// Queue pool size (fixed and dynamic queues share it).
pub const MAX_QUEUES: usize = 4;
/// Soft-timer pool size.
pub const MAX_TIMERS: usize = 8;

/// Rate of the periodic hardware tick, in Hz. Time-unit conversions in the
/// kernel API (e.g. sleeping for milliseconds) are derived from this.
pub const TICK_HZ: u32 = 1_000;

/// Indicates priority of a task.
///
/// Priorities are small numbers starting from zero. Numerically *higher*
/// priorities are more important: among runnable tasks, the one with the
/// largest priority value runs. Priority 0 belongs to the idle task, whose
/// ready bit is never cleared, so the scheduler always has something to pick.
///
/// Each priority level is held by at most one task at a time. This is what
/// lets the kernel represent ready sets and wait sets as plain bit masks.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, FromBytes, AsBytes,
    Unaligned, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// The idle task's permanent priority.
    pub const IDLE: Self = Priority(0);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values of the
    /// priorities directly.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// This priority as a table index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Type used to track generation numbers of task arena slots.
///
/// A slot's generation is bumped every time the task occupying it is
/// uninstalled, so a `TaskId` minted for the old occupant stops resolving.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Generation(pub u8);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1))
    }
}

/// Type used at the kernel boundary to name tasks.
///
/// A `TaskId` is a combination of an arena slot index (fixed for the task's
/// lifetime) and a generation number. The generation changes each time a slot
/// is recycled, to detect handles that outlived their task.
///
/// The split between the two is given by `TaskId::IDX_BITS`.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, FromBytes, AsBytes, Serialize,
    Deserialize,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Number of bits in the index portion of a `TaskId`. The remaining bits
    /// are generation.
    pub const IDX_BITS: u32 = 10;
    /// Mask derived from `IDX_BITS` for extracting the slot index.
    pub const IDX_MASK: u16 = (1 << Self::IDX_BITS) - 1;

    /// Fabricates a `TaskId` for the given slot index and generation.
    pub fn from_index_and_gen(index: usize, gen: Generation) -> Self {
        Self(
            (u16::from(gen.0) << Self::IDX_BITS)
                | (index as u16 & Self::IDX_MASK),
        )
    }

    /// Extracts the index part of this ID.
    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::IDX_MASK)
    }

    /// Extracts the generation part of this ID.
    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::IDX_BITS) as u8)
    }
}

bitflags::bitflags! {
    /// Collection of boolean flags controlling task installation.
    pub struct TaskFlags: u32 {
        /// Take the task's stack from the general-purpose heap instead of the
        /// kernel's static stack arena. Requires the kernel's `dynamic`
        /// feature.
        const DYNAMIC_STACK = 1 << 0;
        const RESERVED = !1;
    }
}

/// One task's scheduling condition, as reported by the diagnostics surface.
///
/// This is computed on demand from the kernel's bitmaps and wait sets; the
/// kernel does not store it.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SchedSnapshot {
    /// Runnable, and it is the task the CPU is executing.
    Running,
    /// Runnable, waiting its turn.
    Ready,
    /// Parked on the delay list with no primitive involved.
    Delayed,
    /// Parked on a primitive's wait set.
    InWait(WaitKind),
    /// Its priority bit is cleared in the blocked mask.
    Blocked,
}

/// Which kind of primitive a task is waiting on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WaitKind {
    Semaphore,
    Mutex,
    Mailbox,
    Queue,
}

/// Per-task record produced by the diagnostics surface and marshalled out to
/// debug transports.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub id: TaskId,
    /// Current priority, which may be a mutex ceiling.
    pub priority: Priority,
    /// The priority the task was installed at.
    pub base_priority: Priority,
    pub state: SchedSnapshot,
    /// Stack size in bytes.
    pub stack_size: u32,
    /// High-water mark of stack usage in bytes, where the platform can
    /// measure it (0 otherwise).
    pub stack_watermark: u32,
}

/// Kernel-wide counters reported by the diagnostics surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KernelStats {
    /// Current value of the wrapping tick counter.
    pub tick: u32,
    /// Number of times the tick counter has wrapped since boot.
    pub rollovers: u32,
    /// Installed task count.
    pub tasks_live: u32,
    /// Allocated soft-timer count.
    pub timers_live: u32,
}

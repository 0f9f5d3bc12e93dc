// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Every fallible kernel operation reports failure through `Result` with a
//! [`KernelError`]. The kernel never halts on resource exhaustion or a bad
//! request -- the caller gets the error and decides. Panics are reserved for
//! broken kernel invariants (say, a priority bitmap naming a vacant table
//! slot), which indicate a kernel bug rather than a caller mistake.

/// Things that can go wrong with a kernel request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum KernelError {
    /// All task arena slots are occupied.
    NoFreeTcb,
    /// The relevant primitive pool is exhausted.
    NoFreeControlBlock,
    /// The static stack arena cannot fit the requested stack.
    OutOfStack,
    /// The general-purpose allocator refused the request, or the build has no
    /// `dynamic` support.
    AllocFailed,
    /// Another task already holds the requested priority.
    PriorityInUse,
    /// The priority is reserved as a mutex ceiling.
    PriorityReserved,
    /// Priority 0 belongs to the idle task.
    IdlePriorityReserved,
    /// Priority value outside the configured range.
    BadPriority,
    /// A blocking or creating operation was attempted in interrupt context.
    IllegalInIsr,
    /// Mutex release attempted by a task that does not own it.
    NotOwner,
    /// Zero or unrepresentably large delay/timeout value.
    BadDelay,
    /// The wait's deadline passed before the resource became available.
    TimedOut,
    /// A poll (or an abandoned wait) found nothing available.
    NoEntryAvailable,
    /// Counting semaphore already at its configured maximum.
    CountOverflow,
    /// Queue ring is full.
    QueueFull,
    /// Element length doesn't match the queue's configured element size.
    BadElementSize,
    /// The task is parked on a wait set or the delay list.
    TaskInWait,
    /// The task still owns a mutex.
    OwnsMutex,
    /// The handle's generation does not match the slot's current occupant.
    StaleTaskId,
    /// Handle does not name a live kernel object.
    BadHandle,
    /// The primitive still has waiters parked on it.
    WaitersPresent,
    /// The primitive is held or otherwise in use.
    InUse,
    /// Serialized record does not fit the caller's buffer.
    BufferTooSmall,
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only diagnostics over kernel state.
//!
//! Nothing here feeds back into scheduling; these functions compute
//! reporting records from the bitmaps, wait sets, and pools, and marshal
//! them into caller-supplied buffers for whatever debug transport the
//! application wires up. The record types live in the `abi` crate so
//! host-side tools can share them.

use abi::{KernelStats, SchedSnapshot, TaskId, TaskStatus, WaitKind};

use crate::err::KernelError;
use crate::task::Kernel;
use crate::time::Deadline;

/// Computes a task's scheduling condition from first principles.
fn sched_snapshot(k: &Kernel, slot: u8) -> SchedSnapshot {
    let t = k.task(slot);
    let prio = t.priority;
    if let Some(kind) = wait_kind(k, slot) {
        return SchedSnapshot::InWait(kind);
    }
    if matches!(t.deadline, Deadline::At(_)) {
        return SchedSnapshot::Delayed;
    }
    if !k.blocked.contains(prio) {
        return SchedSnapshot::Blocked;
    }
    if slot == k.current_slot() {
        SchedSnapshot::Running
    } else {
        SchedSnapshot::Ready
    }
}

fn wait_kind(k: &Kernel, slot: u8) -> Option<WaitKind> {
    let prio = k.task(slot).priority;
    if k.sems.iter().flatten().any(|s| s.wait.contains(prio)) {
        Some(WaitKind::Semaphore)
    } else if k.mutexes.iter().flatten().any(|m| m.wait.contains(prio)) {
        Some(WaitKind::Mutex)
    } else if k.mailboxes.iter().flatten().any(|m| m.wait.contains(prio)) {
        Some(WaitKind::Mailbox)
    } else if k.queues.iter().flatten().any(|q| q.wait.contains(prio)) {
        Some(WaitKind::Queue)
    } else {
        None
    }
}

/// Status record for one task.
pub fn task_status(k: &Kernel, id: TaskId) -> Result<TaskStatus, KernelError> {
    let slot = k.resolve(id)?;
    let t = k.task(slot);
    Ok(TaskStatus {
        id,
        priority: t.priority,
        base_priority: t.base_priority,
        state: sched_snapshot(k, slot),
        stack_size: t.stack.size() as u32,
        stack_watermark: crate::arch::stack_watermark(&t.stack) as u32,
    })
}

/// The task's name, for display. Names live in the kernel only; status
/// records stay fixed-size.
pub fn task_name(k: &Kernel, id: TaskId) -> Result<&'static str, KernelError> {
    let slot = k.resolve(id)?;
    Ok(k.task(slot).name)
}

/// Iterator fodder: handles of all installed tasks.
pub fn task_ids(
    k: &Kernel,
) -> impl Iterator<Item = TaskId> + '_ {
    k.tasks.iter().flatten().map(|t| t.id)
}

/// Kernel-wide counters.
pub fn kernel_stats(k: &Kernel) -> KernelStats {
    KernelStats {
        tick: k.now().0,
        rollovers: k.rollovers,
        tasks_live: k.tasks_live(),
        timers_live: k.timers.live(),
    }
}

/// Uptime in milliseconds, folding rollovers in.
pub fn uptime_ms(k: &Kernel) -> u64 {
    let ticks = u64::from(k.rollovers)
        * u64::from(crate::time::Tick::ROLLOVER)
        + u64::from(k.now().0);
    ticks * 1_000 / u64::from(abi::TICK_HZ)
}

/// Marshals a record into `buf`, returning the number of bytes written.
pub fn serialize_record<T: serde::Serialize>(
    buf: &mut [u8],
    val: &T,
) -> Result<usize, KernelError> {
    ssmarshal::serialize(buf, val).map_err(|_| KernelError::BufferTooSmall)
}

/// Counterpart for tools and tests living on the host side of the
/// transport.
pub fn deserialize_record<T: serde::de::DeserializeOwned>(
    buf: &[u8],
) -> Result<T, KernelError> {
    ssmarshal::deserialize(buf)
        .map(|(v, _)| v)
        .map_err(|_| KernelError::BufferTooSmall)
}

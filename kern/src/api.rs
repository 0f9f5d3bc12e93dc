// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel-exposed application surface.
//!
//! Tasks and drivers call these free functions; each one enters the global
//! critical section through `arch::with_kernel`, performs the state
//! transition, and acts on the resulting [`SwitchHint`] by requesting a
//! context change from the arch layer.
//!
//! Blocking operations are two calls into the kernel with a suspension in
//! between: the start phase parks the caller and this layer requests the
//! context change; when the task is scheduled again, execution resumes here
//! and the finish phase classifies the wake. Interrupt handlers may use the
//! posting and polling entry points, bracketed by [`interrupt_enter`] and
//! [`interrupt_exit`]; the blocking ones refuse interrupt context.

use abi::{KernelStats, TaskId, TaskStatus};
use zerocopy::{AsBytes, FromBytes};

use crate::arch;
use crate::err::KernelError;
use crate::sync::{
    MailboxHandle, MboxPend, MutexHandle, Pend, QueueHandle, SemHandle,
    SemKind,
};
use crate::task::{SwitchHint, TaskDesc};
use crate::time::{ticks_for_ms, Tick, Timeout};
use crate::timers::{TimerCallback, TimerHandle};

fn maybe_switch(hint: SwitchHint) {
    if hint == SwitchHint::Preempt {
        arch::request_context_switch();
    }
}

// --- Tasks and time ---

/// Installs a task; it becomes ready immediately.
pub fn install_task(desc: &TaskDesc) -> Result<TaskId, KernelError> {
    let id = arch::with_kernel(|k| k.install(desc))?;
    // The newcomer may outrank the caller.
    maybe_switch(arch::with_kernel(|k| k.reschedule_hint()));
    Ok(id)
}

/// Uninstalls a task that isn't waiting anywhere.
pub fn uninstall_task(id: TaskId) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.uninstall(id))?;
    maybe_switch(hint);
    Ok(())
}

/// Suspends the caller for an exact number of ticks.
pub fn sleep(ticks: u32) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.sleep_current(ticks))?;
    maybe_switch(hint);
    arch::with_kernel(|k| k.finish_sleep());
    Ok(())
}

/// Suspends the caller for at least `ms` milliseconds.
pub fn sleep_ms(ms: u32) -> Result<(), KernelError> {
    sleep(ticks_for_ms(ms))
}

/// Current tick counter.
pub fn now() -> Tick {
    arch::with_kernel(|k| k.now())
}

pub fn block_priority(p: abi::Priority) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.block_priority(p))?;
    maybe_switch(hint);
    Ok(())
}

pub fn unblock_priority(p: abi::Priority) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.unblock_priority(p))?;
    maybe_switch(hint);
    Ok(())
}

pub fn block_priority_range(
    lo: abi::Priority,
    hi: abi::Priority,
) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.block_priority_range(lo, hi))?;
    maybe_switch(hint);
    Ok(())
}

pub fn unblock_priority_range(
    lo: abi::Priority,
    hi: abi::Priority,
) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.unblock_priority_range(lo, hi))?;
    maybe_switch(hint);
    Ok(())
}

pub fn block_task(id: TaskId) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.block_task(id))?;
    maybe_switch(hint);
    Ok(())
}

pub fn unblock_task(id: TaskId) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.unblock_task(id))?;
    maybe_switch(hint);
    Ok(())
}

// --- Interrupt bracket ---

/// Interrupt handlers that use any kernel entry point must call this first.
pub fn interrupt_enter() {
    arch::with_kernel(|k| k.isr_enter());
}

/// Matching epilogue; performs any context change that was deferred while
/// the interrupt ran.
pub fn interrupt_exit() {
    let hint = arch::with_kernel(|k| k.isr_exit());
    maybe_switch(hint);
}

// --- Semaphores ---

pub fn sem_create(
    kind: SemKind,
    initial: u16,
) -> Result<SemHandle, KernelError> {
    arch::with_kernel(|k| k.sem_create(kind, initial))
}

pub fn sem_delete(h: SemHandle) -> Result<(), KernelError> {
    arch::with_kernel(|k| k.sem_delete(h))
}

/// Takes the semaphore, waiting per `timeout`.
pub fn sem_pend(h: SemHandle, timeout: Timeout) -> Result<(), KernelError> {
    match arch::with_kernel(|k| k.sem_pend_start(h, timeout))? {
        Pend::Taken => Ok(()),
        Pend::Waiting => {
            arch::request_context_switch();
            // Execution resumes here once a post or the tick service wakes
            // us.
            arch::with_kernel(|k| k.sem_pend_finish(h))
        }
    }
}

pub fn sem_post(h: SemHandle) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.sem_post(h))?;
    maybe_switch(hint);
    Ok(())
}

// --- Mutexes ---

pub fn mutex_create(
    ceiling: abi::Priority,
) -> Result<MutexHandle, KernelError> {
    arch::with_kernel(|k| k.mutex_create(ceiling))
}

pub fn mutex_delete(h: MutexHandle) -> Result<(), KernelError> {
    arch::with_kernel(|k| k.mutex_delete(h))
}

pub fn mutex_acquire(
    h: MutexHandle,
    timeout: Timeout,
) -> Result<(), KernelError> {
    match arch::with_kernel(|k| k.mutex_acquire_start(h, timeout))? {
        Pend::Taken => Ok(()),
        Pend::Waiting => {
            arch::request_context_switch();
            arch::with_kernel(|k| k.mutex_acquire_finish(h))
        }
    }
}

pub fn mutex_release(h: MutexHandle) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.mutex_release(h))?;
    maybe_switch(hint);
    Ok(())
}

// --- Mailboxes ---

pub fn mbox_create() -> Result<MailboxHandle, KernelError> {
    arch::with_kernel(|k| k.mbox_create())
}

pub fn mbox_delete(h: MailboxHandle) -> Result<(), KernelError> {
    arch::with_kernel(|k| k.mbox_delete(h))
}

/// Receives the mailbox's message, waiting per `timeout`.
pub fn mbox_pend(
    h: MailboxHandle,
    timeout: Timeout,
) -> Result<usize, KernelError> {
    match arch::with_kernel(|k| k.mbox_pend_start(h, timeout))? {
        MboxPend::Taken(msg) => Ok(msg),
        MboxPend::Waiting => {
            arch::request_context_switch();
            arch::with_kernel(|k| k.mbox_pend_finish(h))
        }
    }
}

pub fn mbox_post(h: MailboxHandle, msg: usize) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.mbox_post(h, msg))?;
    maybe_switch(hint);
    Ok(())
}

// --- Queues ---

/// Creates a queue over caller-provided storage (typically a named
/// `static`).
pub fn queue_create(
    storage: &'static mut [u8],
    elem_size: usize,
) -> Result<QueueHandle, KernelError> {
    arch::with_kernel(|k| k.queue_create(storage, elem_size))
}

#[cfg(feature = "dynamic")]
pub fn queue_create_dynamic(
    capacity: usize,
    elem_size: usize,
) -> Result<QueueHandle, KernelError> {
    arch::with_kernel(|k| k.queue_create_dynamic(capacity, elem_size))
}

pub fn queue_delete(h: QueueHandle) -> Result<(), KernelError> {
    arch::with_kernel(|k| k.queue_delete(h))
}

/// Posts one element. Never blocks; a full ring is `QueueFull`.
pub fn queue_post(h: QueueHandle, elem: &[u8]) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.queue_post(h, elem))?;
    maybe_switch(hint);
    Ok(())
}

/// Receives one element into `dest`, waiting per `timeout`.
///
/// A woken waiter may find the ring drained by a higher-priority consumer
/// that never slept; in that case the wait restarts with whatever remains of
/// the original budget.
pub fn queue_pend(
    h: QueueHandle,
    timeout: Timeout,
    dest: &mut [u8],
) -> Result<(), KernelError> {
    let mut timeout = timeout;
    loop {
        let (started, t0) = arch::with_kernel(|k| {
            let t0 = k.now();
            k.queue_pend_start(h, timeout, dest).map(|p| (p, t0))
        })?;
        match started {
            Pend::Taken => return Ok(()),
            Pend::Waiting => {
                arch::request_context_switch();
                let (got, t1) = arch::with_kernel(|k| {
                    k.queue_pend_finish(h, dest).map(|g| (g, k.now()))
                })?;
                if got {
                    return Ok(());
                }
                if let Timeout::For(n) = timeout {
                    let left = n.saturating_sub(t0.until(t1));
                    if left == 0 {
                        return Err(KernelError::TimedOut);
                    }
                    timeout = Timeout::For(left);
                }
            }
        }
    }
}

/// Posts a plain-data record; the ring carries it as bytes.
pub fn queue_post_record<T: AsBytes>(
    h: QueueHandle,
    val: &T,
) -> Result<(), KernelError> {
    queue_post(h, val.as_bytes())
}

/// Receives a plain-data record.
pub fn queue_pend_record<T: AsBytes + FromBytes>(
    h: QueueHandle,
    timeout: Timeout,
) -> Result<T, KernelError> {
    let mut val = T::new_zeroed();
    queue_pend(h, timeout, val.as_bytes_mut())?;
    Ok(val)
}

pub fn queue_flush(h: QueueHandle) -> Result<(), KernelError> {
    arch::with_kernel(|k| k.queue_flush(h))
}

// --- Soft timers ---

pub fn timer_create(
    callback: TimerCallback,
    context: usize,
) -> Result<TimerHandle, KernelError> {
    arch::with_kernel(|k| k.timer_create(callback, context))
}

/// Creates and immediately arms a timer.
pub fn timer_set(
    callback: TimerCallback,
    context: usize,
    delta: u32,
) -> Result<TimerHandle, KernelError> {
    let h = timer_create(callback, context)?;
    timer_start(h, delta)?;
    Ok(h)
}

pub fn timer_start(h: TimerHandle, delta: u32) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.timer_start(h, delta))?;
    maybe_switch(hint);
    Ok(())
}

/// Stops a timer, optionally releasing its pool entry.
pub fn timer_stop(h: TimerHandle, release: bool) -> Result<(), KernelError> {
    let hint = arch::with_kernel(|k| k.timer_stop(h, release))?;
    maybe_switch(hint);
    Ok(())
}

/// Ticks left until the timer fires; 0 if it isn't running.
pub fn timer_remaining(h: TimerHandle) -> Result<u32, KernelError> {
    arch::with_kernel(|k| k.timer_remaining(h))
}

/// The soft-timer service task's nap. Waking by timeout is expected; a post
/// just means the heaps changed under us.
pub(crate) fn timer_service_wait(timeout: Timeout) {
    let sem = arch::with_kernel(|k| k.timers.service_sem);
    if let Some(sem) = sem {
        let _ = sem_pend(sem, timeout);
    }
}

// --- Diagnostics ---

pub fn task_status(id: TaskId) -> Result<TaskStatus, KernelError> {
    arch::with_kernel(|k| crate::diag::task_status(k, id))
}

pub fn kernel_stats() -> KernelStats {
    arch::with_kernel(|k| crate::diag::kernel_stats(k))
}

pub fn uptime_ms() -> u64 {
    arch::with_kernel(|k| crate::diag::uptime_ms(k))
}

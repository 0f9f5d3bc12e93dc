// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted stand-in for the architecture layer.
//!
//! Everything is a thread-local fake: the "critical section" is a nesting
//! counter, a requested context switch just latches a flag a test can
//! observe, and the kernel instance lives in a thread local so parallel
//! tests don't share state. None of this switches real contexts -- tests
//! drive blocking protocols through the kernel's two-phase methods instead.

use core::cell::{Cell, RefCell};

use crate::task::{Kernel, StackRegion, Task};

/// Per-task "machine state" for hosted builds: just the stack pointer the
/// frame builder computed.
#[derive(Debug, Default)]
pub struct SavedState {
    pub sp: usize,
}

thread_local! {
    static KERNEL: RefCell<Option<Kernel>> = const { RefCell::new(None) };
    static CRIT_DEPTH: Cell<u32> = const { Cell::new(0) };
    static SWITCH_PENDED: Cell<bool> = const { Cell::new(false) };
}

/// Installs the kernel instance for this thread.
pub fn set_kernel(k: Kernel) {
    KERNEL.with(|c| *c.borrow_mut() = Some(k));
}

/// Runs `body` against the kernel instance with the (fake) critical section
/// held.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    let _guard = enter_critical();
    KERNEL.with(|c| {
        let mut slot = c.borrow_mut();
        body(slot.as_mut().expect("kernel not started"))
    })
}

/// Counted critical section, released when the guard drops.
pub struct CriticalGuard {
    _private: (),
}

pub fn enter_critical() -> CriticalGuard {
    CRIT_DEPTH.with(|c| c.set(c.get() + 1));
    CriticalGuard { _private: () }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        CRIT_DEPTH.with(|c| c.set(c.get() - 1));
    }
}

/// Current critical-section nesting, for tests.
pub fn crit_depth() -> u32 {
    CRIT_DEPTH.with(|c| c.get())
}

/// Latches the "a switch was requested" flag.
pub fn request_context_switch() {
    SWITCH_PENDED.with(|c| c.set(true));
}

/// Reads and clears the switch flag, for tests.
pub fn take_pended_switch() -> bool {
    SWITCH_PENDED.with(|c| c.replace(false))
}

/// Hosted frame "construction": record where the stack pointer would start.
pub fn init_task_frame(task: &mut Task, _entry: fn(usize) -> !, _arg: usize) {
    task.save.sp = task.stack.initial_sp();
}

pub fn paint_stack(_region: &StackRegion) {}

/// Hosted stacks are never really used, so the watermark is always zero.
pub fn stack_watermark(_region: &StackRegion) -> usize {
    0
}

pub fn idle() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_section_nests() {
        assert_eq!(crit_depth(), 0);
        let a = enter_critical();
        let b = enter_critical();
        assert_eq!(crit_depth(), 2);
        drop(b);
        assert_eq!(crit_depth(), 1);
        drop(a);
        assert_eq!(crit_depth(), 0);
    }

    #[test]
    fn switch_request_latches() {
        assert!(!take_pended_switch());
        request_context_switch();
        request_context_switch();
        assert!(take_pended_switch());
        assert!(!take_pended_switch());
    }
}

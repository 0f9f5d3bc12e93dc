// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A preemptive, priority-based kernel for small microcontrollers.
//!
//! # Design principles
//!
//! 1. Use safe Rust for as much as possible; `unsafe` lives in the arch
//!    layer and the boot path.
//! 2. Make the scheduler's data structures boringly small: a priority is a
//!    bit index, a set of priorities is a machine word, and "who runs next"
//!    is a highest-set-bit search.
//! 3. Keep everything host-testable. The kernel proper is a state machine
//!    over one [`task::Kernel`] struct; the only parts that need a real
//!    CPU are context switch entry/exit and the tick interrupt, and those
//!    are faked on the host.
//!
//! Assumptions enabling the simple structures:
//!
//! - Each priority level is held by at most one task, so wait sets and the
//!   ready set are bit masks, and wake-order questions reduce to the same
//!   highest-bit search the scheduler runs.
//! - The task count is fixed at build time and small. Linear walks over the
//!   task arena and delay list are fine; the tick path is O(installed
//!   tasks) in the worst case.
//!
//! # Time
//!
//! The tick counter wraps a little early (at [`time::Tick::ROLLOVER`]), and
//! a task's timing condition is the [`time::Deadline`] enum rather than a
//! reserved counter value. The soft-timer service double-buffers its
//! deadline heaps across the wrap; see [`timers`].

#![cfg_attr(target_os = "none", no_std)]
#![forbid(clippy::wildcard_imports)]

#[cfg(feature = "dynamic")]
extern crate alloc;

/// Kernel log output. Compiled to nothing unless one of the `klog-*`
/// features routes it somewhere (semihosting or ITM). Keep call sites rare;
/// this is for events a human debugging a board wants to see, not a trace.
#[cfg(feature = "klog-semihosting")]
macro_rules! klog {
    ($s:expr) => { let _ = cortex_m_semihosting::hprintln!($s); };
    ($s:expr, $($tt:tt)*) => {
        let _ = cortex_m_semihosting::hprintln!($s, $($tt)*);
    };
}

#[cfg(all(feature = "klog-itm", not(feature = "klog-semihosting")))]
macro_rules! klog {
    ($($tt:tt)*) => {
        // Stimulus port 0, the conventional debug channel.
        let itm = unsafe {
            &mut *(cortex_m::peripheral::ITM::PTR
                as *mut cortex_m::peripheral::itm::RegisterBlock)
        };
        cortex_m::iprintln!(&mut itm.stim[0], $($tt)*);
    };
}

#[cfg(not(any(feature = "klog-semihosting", feature = "klog-itm")))]
macro_rules! klog {
    ($($tt:tt)*) => {{}};
}

pub(crate) use klog;

pub mod api;
pub mod arch;
pub mod diag;
pub mod err;
pub mod schedule;
pub mod startup;
pub mod sync;
pub mod task;
pub mod time;
pub mod timers;

pub use abi;

pub use crate::err::KernelError;
pub use crate::sync::{
    MailboxHandle, MutexHandle, QueueHandle, SemHandle, SemKind,
};
pub use crate::task::{Kernel, SwitchHint, TaskDesc};
pub use crate::time::{Deadline, Tick, Timeout};
pub use crate::timers::{TimerCallback, TimerHandle};

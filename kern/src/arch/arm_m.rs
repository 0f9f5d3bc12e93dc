// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support for ARMv{7,8}-M.
//!
//! # Interrupt layout
//!
//! Three handlers, for three different jobs:
//!
//! - `SysTick` drives the kernel tick. It runs the tick service through the
//!   normal kernel gateway and, if that produces a scheduling hint, *pends*
//!   a context switch rather than performing one -- its entry sequence
//!   doesn't save the full register state.
//! - `PendSV` is the only place full context save/restore happens. Anyone
//!   who wants a context change (a blocking pend, a post that readies a
//!   more important task, an interrupt) sets the PendSV-pending bit; the
//!   switch then runs after the current handler chain unwinds, exactly
//!   once, no matter how many callers asked for it.
//! - `SVCall` exists to launch the first task: the boot path stacks a
//!   synthetic exception frame on the process stack and issues `svc`, and
//!   the handler returns "from" that frame into the task.
//!
//! Deferring all switches to PendSV is the standard Cortex-M discipline;
//! it also means the critical section never needs to survive an actual
//! context change.
//!
//! # Critical section
//!
//! PRIMASK-based, counted, restored when the outermost guard drops. The
//! kernel is entered exclusively through [`with_kernel`], which holds the
//! guard for the duration, so every handler and API call sees kernel state
//! whole.

use core::marker::PhantomData;
use core::mem::size_of;
use core::ptr::NonNull;

use crate::task::{Kernel, StackRegion, SwitchHint, Task};

/// Volatile registers saved across context switches, in the exact order the
/// `stm`/`ldm` sequences in `PendSV` expect. This struct sits at offset zero
/// of `Task`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SavedState {
    // NOTE: the following fields must be kept contiguous!
    r4: u32,
    r5: u32,
    r6: u32,
    r7: u32,
    r8: u32,
    r9: u32,
    r10: u32,
    r11: u32,
    psp: u32,
    exc_return: u32,
    // NOTE: the above fields must be kept contiguous!
}

/// Hardware-stacked exception frame (no FPU extension; tasks that want the
/// FPU get lazy stacking from the hardware).
#[repr(C)]
#[derive(Debug, Default)]
struct ExceptionFrame {
    r0: u32,
    r1: u32,
    r2: u32,
    r3: u32,
    r12: u32,
    lr: u32,
    pc: u32,
    xpsr: u32,
}

/// Thumb bit; the minimum viable PSR for a new task.
const INITIAL_PSR: u32 = 1 << 24;

/// Return into thread mode, process stack, no FPU state.
const INITIAL_EXC_RETURN: u32 = 0xFFFF_FFFD;

/// Stack paint pattern for the high-water diagnostic.
const STACK_PAINT: u8 = 0xA5;

/// Kernel state object location. Written once at startup.
static mut KERNEL: Option<NonNull<Kernel>> = None;

/// The running task, for the handlers' save/restore sequences. We have no
/// scratch register to dedicate to this, so it's a global the asm can name.
#[no_mangle]
static mut CURRENT_TASK_PTR: Option<NonNull<Task>> = None;

// Critical-section bookkeeping. Single core: plain statics mutated with
// interrupts disabled.
static mut CRIT_DEPTH: u32 = 0;
static mut CRIT_ENABLE_ON_EXIT: bool = false;

/// Counted PRIMASK critical section. Dropping the outermost guard restores
/// the interrupt state captured on entry.
pub struct CriticalGuard {
    // Keep the guard from migrating across threads it could never exist on.
    _not_send: PhantomData<*mut ()>,
}

pub fn enter_critical() -> CriticalGuard {
    let was_active = cortex_m::register::primask::read().is_active();
    cortex_m::interrupt::disable();
    unsafe {
        if CRIT_DEPTH == 0 {
            CRIT_ENABLE_ON_EXIT = was_active;
        }
        CRIT_DEPTH += 1;
    }
    CriticalGuard {
        _not_send: PhantomData,
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        unsafe {
            CRIT_DEPTH -= 1;
            if CRIT_DEPTH == 0 && CRIT_ENABLE_ON_EXIT {
                cortex_m::interrupt::enable();
            }
        }
    }
}

/// Records `kernel` as the system-wide kernel instance.
///
/// # Safety
///
/// This stashes a pointer that aliases `kernel` without revoking your
/// access, so the caller must not touch the reference again except through
/// [`with_kernel`]. The startup sequence honors this.
pub unsafe fn set_kernel(kernel: &'static mut Kernel) {
    // Catch double-uses of this function.
    let prev = KERNEL;
    assert!(prev.is_none());
    KERNEL = Some(NonNull::from(kernel));
}

/// Runs `body` against the kernel with the critical section held.
///
/// All kernel entry points funnel through here -- API calls from tasks and
/// the interrupt handlers alike -- which is what makes manufacturing the
/// `&mut` sound on a single core.
pub fn with_kernel<R>(body: impl FnOnce(&mut Kernel) -> R) -> R {
    let _guard = enter_critical();
    let mut k = unsafe { KERNEL.expect("kernel not started") };
    body(unsafe { k.as_mut() })
}

/// Pends a PendSV, i.e. schedules a context switch for when the current
/// handler chain (if any) unwinds.
pub fn request_context_switch() {
    cortex_m::peripheral::SCB::set_pendsv();
}

/// Programs the system tick timer. `cycles_per_tick` is the core clock
/// divided by `abi::TICK_HZ`; the board setup knows both.
pub fn tick_timer_setup(cycles_per_tick: u32) {
    // Reload is period minus one.
    let syst = unsafe { &*cortex_m::peripheral::SYST::PTR };
    unsafe {
        syst.rvr.write(cycles_per_tick - 1);
        syst.cvr.write(0);
        // Processor clock, interrupt on, counter on.
        syst.csr.modify(|v| v | 0b111);
    }
}

/// Builds the synthetic exception frame that makes a fresh task resumable:
/// when `PendSV` "returns" to it, execution begins at `entry` with `arg` in
/// `r0`.
pub fn init_task_frame(task: &mut Task, entry: fn(usize) -> !, arg: usize) {
    let sp = task.stack.initial_sp();
    let frame_addr = sp - size_of::<ExceptionFrame>();
    let frame = frame_addr as *mut ExceptionFrame;
    unsafe {
        frame.write(ExceptionFrame {
            r0: arg as u32,
            lr: 0xFFFF_FFFF, // a task returning from its entry fn is a bug
            pc: entry as usize as u32 | 1, // thumb
            xpsr: INITIAL_PSR,
            ..Default::default()
        });
    }
    task.save = SavedState {
        psp: frame_addr as u32,
        exc_return: INITIAL_EXC_RETURN,
        ..Default::default()
    };
}

/// Fills a freshly carved stack with the paint pattern, so the high-water
/// diagnostic has something to measure.
pub fn paint_stack(region: &StackRegion) {
    unsafe {
        core::ptr::write_bytes(
            region.base() as *mut u8,
            STACK_PAINT,
            region.size(),
        );
    }
}

/// Bytes of the stack that have ever been used, judged by how much paint
/// survives from the base up.
pub fn stack_watermark(region: &StackRegion) -> usize {
    let base = region.base() as *const u8;
    for offset in 0..region.size() {
        if unsafe { base.add(offset).read_volatile() } != STACK_PAINT {
            return region.size() - offset;
        }
    }
    0
}

/// Parks the CPU until the next interrupt; the idle task's whole job.
pub fn idle() {
    cortex_m::asm::wfi();
}

/// Launches the first task. Never returns; the `svc` lands in [`SVCall`],
/// which returns into the task's synthetic frame.
pub fn start_first_task(task: &Task) -> ! {
    unsafe {
        CURRENT_TASK_PTR = Some(NonNull::from(task));
        core::arch::asm!(
            "msr PSP, {sp}",
            "svc #0xFF", // svc number is ignored
            "udf #0xad", // should not return
            sp = in(reg) task.save.psp,
            options(noreturn),
        )
    }
}

/// Handler for the SVC instruction; only used to enter the first task.
/// (Name is dictated by the `cortex_m` crate's vector table.)
#[allow(non_snake_case)]
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn SVCall() {
    core::arch::naked_asm!(
        // Return into thread mode on the process stack; the boot path has
        // already stacked the first task's frame there.
        "ldr lr, =0xFFFFFFFD",
        "bx lr",
    )
}

/// Handler for the system tick. Runs the tick service; if anything became
/// runnable, the actual switch is deferred to PendSV.
#[allow(non_snake_case)]
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    let hint = with_kernel(|k| {
        k.isr_enter();
        let hint = k.tick();
        hint.combine(k.isr_exit())
    });
    if hint == SwitchHint::Preempt {
        request_context_switch();
    }
}

/// Deferred context switch. Saves the volatile registers of the outgoing
/// task into its `SavedState`, asks the kernel for the next task, and
/// restores that one's registers.
#[allow(non_snake_case)]
#[unsafe(naked)]
#[no_mangle]
pub unsafe extern "C" fn PendSV() {
    core::arch::naked_asm!(
        // Store volatile state into the current task.
        "ldr r0, =CURRENT_TASK_PTR",
        "ldr r1, [r0]",
        // Fetching PSP into r12 makes the register order in the stm match
        // the SavedState layout.
        "mrs r12, PSP",
        "stm r1, {{r4-r12, lr}}",
        // Pick the next task; pendsv_entry updates CURRENT_TASK_PTR.
        "bl pendsv_entry",
        // We're returning into *some* task, maybe a different one.
        "ldr r0, =CURRENT_TASK_PTR",
        "ldr r0, [r0]",
        "ldm r0, {{r4-r12, lr}}",
        "msr PSP, r12",
        "bx lr",
    )
}

/// The Rust side of `PendSV`, after the outgoing task's state is parked
/// somewhere predictable.
#[no_mangle]
unsafe extern "C" fn pendsv_entry() {
    with_kernel(|k| {
        let slot = k.next_task_slot();
        let task = k.task_mut(slot);
        CURRENT_TASK_PTR = Some(NonNull::from(task));
    });
}

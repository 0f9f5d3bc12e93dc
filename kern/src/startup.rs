// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel startup.
//!
//! The board's reset path hands us a scratch RAM region; the kernel object
//! is bump-allocated from its front and everything left over becomes the
//! static stack arena that task installation carves up. Then the two
//! permanent tasks go in -- idle at priority 0 and the soft-timer service
//! near the top -- the tick timer starts, and we switch into whatever the
//! scheduler likes best.
//!
//! Failures here are startup bugs (a scratch region too small to hold the
//! kernel, a priority collision with the service task), not runtime
//! conditions, so this is the one place that asserts instead of returning
//! errors.

use abi::Priority;

#[cfg(target_os = "none")]
use abi::TaskFlags;
#[cfg(target_os = "none")]
use crate::sync::SemKind;
#[cfg(target_os = "none")]
use crate::task::{Kernel, TaskDesc};

/// Stack for the idle task, which runs nothing but the wait-for-interrupt
/// loop.
pub const IDLE_STACK_SIZE: usize = 256;

/// Stack for the soft-timer service task; sized for timer callbacks, which
/// run on it.
pub const TIMER_STACK_SIZE: usize = 1024;

/// The soft-timer service runs one notch below the top, so an application
/// can still install something that outranks timer callbacks.
pub const TIMER_SERVICE_PRIORITY: Priority =
    Priority((crate::schedule::NUM_PRIORITIES - 2) as u8);

/// Brings the kernel up and never returns.
///
/// `cycles_per_tick` is the core clock divided by `abi::TICK_HZ`.
///
/// # Safety
///
/// `scratch_ram` must point at `scratch_ram_size` bytes of RAM that nothing
/// else will ever touch.
#[cfg(target_os = "none")]
pub unsafe fn start_kernel(
    scratch_ram: *mut u8,
    scratch_ram_size: usize,
    cycles_per_tick: u32,
) -> ! {
    let mut alloc = BumpPointer(core::slice::from_raw_parts_mut(
        scratch_ram,
        scratch_ram_size,
    ));

    // The kernel object comes out of scratch first; everything left is the
    // stack arena.
    let kernel = alloc.gimme(Kernel::new(0, 0));
    let arena = core::mem::take(&mut alloc.0);
    kernel.set_stack_arena(arena.as_mut_ptr() as usize, arena.len());

    kernel
        .install_idle(&TaskDesc {
            name: "idle",
            entry: idle_main,
            arg: 0,
            stack_size: IDLE_STACK_SIZE,
            priority: Priority::IDLE,
            flags: TaskFlags::empty(),
        })
        .expect("idle task install failed");

    let service_sem = kernel
        .sem_create(SemKind::Binary, 0)
        .expect("timer service semaphore");
    kernel.timers.service_sem = Some(service_sem);
    kernel
        .install(&TaskDesc {
            name: "timers",
            entry: crate::timers::timer_service_entry,
            arg: 0,
            stack_size: TIMER_STACK_SIZE,
            priority: TIMER_SERVICE_PRIORITY,
            flags: TaskFlags::empty(),
        })
        .expect("timer service install failed");

    crate::arch::set_kernel(kernel);
    crate::arch::tick_timer_setup(cycles_per_tick);

    let first = crate::arch::with_kernel(|k| {
        let slot = k.next_task_slot();
        core::ptr::NonNull::from(k.task(slot))
    });
    crate::arch::start_first_task(first.as_ref())
}

#[cfg(target_os = "none")]
fn idle_main(_: usize) -> ! {
    loop {
        crate::arch::idle();
    }
}

/// Dead-simple allocator for boot-time carving of scratch RAM.
pub struct BumpPointer(pub &'static mut [u8]);

impl BumpPointer {
    /// Takes properly aligned space for a `T` off the front of the region
    /// and moves `value` into it.
    pub fn gimme<T>(&mut self, value: T) -> &'static mut T {
        use core::mem::{align_of, size_of};

        // Temporarily steal the entire allocation region from self. This
        // helps with lifetime inference issues.
        let free = core::mem::take(&mut self.0);

        // Bump the pointer up to the required alignment for T.
        let align_delta = free.as_ptr().align_offset(align_of::<T>());
        let (_discarded, free) = free.split_at_mut(align_delta);
        // Split off RAM for a T.
        let (allocated, free) = free.split_at_mut(size_of::<T>());

        // Put free memory back.
        self.0 = free;

        // `allocated` has the alignment and size of a `T`, so we can start
        // treating it like one. However, we have to initialize it first --
        // without dropping its current contents!
        let allocated = allocated.as_mut_ptr() as *mut T;
        unsafe {
            allocated.write(value);
            &mut *allocated
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gimme_aligns_and_initializes() {
        let backing = Box::leak(vec![0u8; 256].into_boxed_slice());
        let mut bump = BumpPointer(backing);

        let a: &'static mut u8 = bump.gimme(7u8);
        let b: &'static mut u64 = bump.gimme(0x1122_3344_5566_7788u64);
        assert_eq!(*a, 7);
        assert_eq!(*b, 0x1122_3344_5566_7788);
        assert_eq!(b as *const u64 as usize % core::mem::align_of::<u64>(), 0);
    }

    #[test]
    fn gimme_consumes_the_region() {
        let backing = Box::leak(vec![0u8; 16].into_boxed_slice());
        let mut bump = BumpPointer(backing);
        let _ = bump.gimme([0u8; 12]);
        assert!(bump.0.len() <= 4);
    }
}

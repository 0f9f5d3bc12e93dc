// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Architecture support.
//!
//! Each arch module provides the same surface, fixed at build time:
//!
//! - `SavedState`, the per-task register save area;
//! - `with_kernel`, the sole gateway to the kernel state object, holding the
//!   global critical section for the duration of the closure;
//! - `enter_critical`, the nesting critical section as an RAII guard, for
//!   code that needs the lock without the kernel reference;
//! - `request_context_switch`, which schedules a deferred switch;
//! - `init_task_frame` / `paint_stack` / `stack_watermark`, the stack-frame
//!   builder and stack instrumentation;
//! - `tick_timer_setup`, `start_first_task`, and `idle` on real targets.
//!
//! The `hosted` module backs all of this with thread-local fakes so the
//! whole kernel state machine runs under `cargo test` on a desk.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        mod arm_m;
        pub use arm_m::*;
    } else {
        mod hosted;
        pub use hosted::*;
    }
}

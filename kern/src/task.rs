// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks, the task arena, and the kernel state object.
//!
//! All mutable kernel state lives in one [`Kernel`] struct: the ready and
//! blocked masks, the priority-to-task table, the task arena, the delay
//! list, the tick counter, and the primitive pools. Kernel entry points reach
//! the single live instance through `arch::with_kernel`, which holds the
//! global critical section for the duration; tests just build a `Kernel`
//! value and call methods on it.
//!
//! Tasks are addressed by arena slot index everywhere inside the kernel. The
//! delay list is intrusive, but its links are slot *indices*, not pointers,
//! so list surgery is ordinary array indexing. The outside world names tasks
//! by [`TaskId`], which carries a generation number so a handle to an
//! uninstalled task is detected rather than resolving to the slot's next
//! occupant.

use abi::{Generation, Priority, TaskFlags, TaskId, MAX_TASKS};

use crate::err::KernelError;
use crate::schedule::{PrioSet, NUM_PRIORITIES};
use crate::sync::{Mailbox, Mutex, Queue, Semaphore};
use crate::time::{Deadline, Tick};
use crate::timers::TimerService;

/// Description of a task to install.
pub struct TaskDesc {
    /// Shown in diagnostics; not interpreted by the kernel.
    pub name: &'static str,
    /// First code executed when the task is switched to. Tasks never return.
    pub entry: fn(usize) -> !,
    /// Argument handed to `entry`.
    pub arg: usize,
    /// Requested stack size in bytes.
    pub stack_size: usize,
    /// Priority to install at. Must be unoccupied, unreserved, and nonzero.
    pub priority: Priority,
    pub flags: TaskFlags,
}

/// Where a task's stack lives.
#[derive(Debug)]
pub enum StackRegion {
    /// Carved from the kernel's static stack arena at install time.
    Arena { base: usize, size: usize },
    /// Owned allocation from the general-purpose heap.
    #[cfg(feature = "dynamic")]
    Heap { base: usize, size: usize },
}

impl StackRegion {
    pub fn base(&self) -> usize {
        match *self {
            StackRegion::Arena { base, .. } => base,
            #[cfg(feature = "dynamic")]
            StackRegion::Heap { base, .. } => base,
        }
    }

    pub fn size(&self) -> usize {
        match *self {
            StackRegion::Arena { size, .. } => size,
            #[cfg(feature = "dynamic")]
            StackRegion::Heap { size, .. } => size,
        }
    }

    /// Initial stack pointer: the top of the region, kept 8-byte aligned.
    pub fn initial_sp(&self) -> usize {
        (self.base() + self.size()) & !7
    }
}

/// Internal representation of a task.
#[repr(C)] // so the location of SavedState is predictable
pub struct Task {
    /// Saved machine state. The context-switch code finds this at offset
    /// zero; keep it first.
    pub save: crate::arch::SavedState,
    /// Name from the install descriptor.
    pub name: &'static str,
    /// Handle minted at install time.
    pub id: TaskId,
    /// Current priority; equals `base_priority` except while elevated to a
    /// mutex ceiling.
    pub priority: Priority,
    /// Priority the task was installed at.
    pub base_priority: Priority,
    pub stack: StackRegion,
    /// Timing condition, if any. `At` implies membership in the delay list.
    pub deadline: Deadline,
    /// Mailbox delivery slot; a poster stores here when handing a message
    /// directly to a waiter.
    pub(crate) mbox_msg: Option<usize>,
    // Delay-list links: arena slot indices, not pointers.
    pub(crate) dq_next: Option<u8>,
    pub(crate) dq_prev: Option<u8>,
}

/// Occupancy of one priority level in the priority-to-task table.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum PrioSlot {
    /// Nobody uses this priority.
    #[default]
    Vacant,
    /// A mutex holds this priority as its ceiling; ordinary installation is
    /// refused.
    Reserved,
    /// The task in this arena slot owns the priority.
    Held(u8),
}

/// Scheduling consequence of a state change. Marked `must_use` because
/// forgetting to act on one would strand a higher-priority task in the ready
/// set while something less important keeps the CPU.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum SwitchHint {
    /// The running task is still the right one.
    Same,
    /// A context change should be requested.
    Preempt,
}

impl SwitchHint {
    pub fn combine(self, other: Self) -> Self {
        if self == SwitchHint::Preempt || other == SwitchHint::Preempt {
            SwitchHint::Preempt
        } else {
            SwitchHint::Same
        }
    }
}

/// The kernel state object.
pub struct Kernel {
    /// Bit *i* set: the task holding priority *i* is runnable.
    pub(crate) ready: PrioSet,
    /// Bit *i* clear: priority *i* is administratively blocked.
    pub(crate) blocked: PrioSet,
    /// Priority-to-task mapping.
    pub(crate) table: [PrioSlot; NUM_PRIORITIES],
    /// Task arena. `None` slots are free.
    pub(crate) tasks: [Option<Task>; MAX_TASKS],
    /// Slot generations, bumped on uninstall. Kept outside `Task` so they
    /// survive the slot being vacated.
    pub(crate) gens: [Generation; MAX_TASKS],
    /// Head of the delay list.
    pub(crate) delay_head: Option<u8>,
    /// Arena slot of the running task.
    pub(crate) current: u8,
    /// Wrapping tick counter.
    pub(crate) tick: Tick,
    pub(crate) rollovers: u32,
    /// Interrupt nesting depth; nonzero means we're in interrupt context.
    pub(crate) isr_depth: u8,
    // Static stack arena, carved cumulatively at install time.
    pub(crate) arena_base: usize,
    pub(crate) arena_size: usize,
    pub(crate) arena_used: usize,
    // Primitive pools.
    pub(crate) sems: [Option<Semaphore>; abi::MAX_SEMAPHORES],
    pub(crate) mutexes: [Option<Mutex>; abi::MAX_MUTEXES],
    pub(crate) mailboxes: [Option<Mailbox>; abi::MAX_MAILBOXES],
    pub(crate) queues: [Option<Queue>; abi::MAX_QUEUES],
    pub(crate) timers: TimerService,
}

impl Kernel {
    /// Creates a kernel with all pools empty and the given static stack
    /// arena. The idle priority's ready and blocked bits are set from the
    /// start, so the scheduler always has an answer.
    pub fn new(stack_arena_base: usize, stack_arena_size: usize) -> Self {
        let mut ready = PrioSet::EMPTY;
        ready.insert(Priority::IDLE);
        let mut blocked = PrioSet::EMPTY;
        blocked.insert(Priority::IDLE);
        Self {
            ready,
            blocked,
            table: [PrioSlot::Vacant; NUM_PRIORITIES],
            tasks: core::array::from_fn(|_| None),
            gens: [Generation::default(); MAX_TASKS],
            delay_head: None,
            current: 0,
            tick: Tick::ZERO,
            rollovers: 0,
            isr_depth: 0,
            arena_base: stack_arena_base,
            arena_size: stack_arena_size,
            arena_used: 0,
            sems: core::array::from_fn(|_| None),
            mutexes: core::array::from_fn(|_| None),
            mailboxes: core::array::from_fn(|_| None),
            queues: core::array::from_fn(|_| None),
            timers: TimerService::new(),
        }
    }

    /// Points the stack arena at real memory. Startup calls this once,
    /// before any task is installed.
    pub fn set_stack_arena(&mut self, base: usize, size: usize) {
        debug_assert_eq!(self.arena_used, 0);
        self.arena_base = base;
        self.arena_size = size;
    }

    // Arena accessors. These expect a live slot; being handed a vacant one
    // means a bitmap or table entry is stale, which is a kernel bug.

    pub(crate) fn task(&self, slot: u8) -> &Task {
        self.tasks[usize::from(slot)]
            .as_ref()
            .expect("vacant task slot named by kernel state")
    }

    pub(crate) fn task_mut(&mut self, slot: u8) -> &mut Task {
        self.tasks[usize::from(slot)]
            .as_mut()
            .expect("vacant task slot named by kernel state")
    }

    /// Slot of the running task.
    pub fn current_slot(&self) -> u8 {
        self.current
    }

    pub(crate) fn set_current_slot(&mut self, slot: u8) {
        self.current = slot;
    }

    /// Handle of the running task.
    pub fn current_task_id(&self) -> TaskId {
        self.task(self.current).id
    }

    /// Current tick counter value.
    pub fn now(&self) -> Tick {
        self.tick
    }

    pub fn in_isr(&self) -> bool {
        self.isr_depth > 0
    }

    /// Interrupt prologue: bump the nesting counter. Interrupt handlers that
    /// call kernel operations must bracket them with this and
    /// [`Kernel::isr_exit`].
    pub fn isr_enter(&mut self) {
        self.isr_depth += 1;
    }

    /// Interrupt epilogue. At the outermost exit, reports whether a context
    /// change deferred during the interrupt should happen now.
    pub fn isr_exit(&mut self) -> SwitchHint {
        debug_assert!(self.isr_depth > 0);
        self.isr_depth -= 1;
        if self.isr_depth == 0 {
            self.reschedule_hint()
        } else {
            SwitchHint::Same
        }
    }

    /// Resolves a `TaskId` to an arena slot, checking the generation.
    pub(crate) fn resolve(&self, id: TaskId) -> Result<u8, KernelError> {
        let idx = id.index();
        if idx >= MAX_TASKS {
            return Err(KernelError::BadHandle);
        }
        match &self.tasks[idx] {
            Some(t) if t.id == id => Ok(idx as u8),
            _ => Err(KernelError::StaleTaskId),
        }
    }

    /// Installs a task. Fails in interrupt context, on a bad or occupied or
    /// reserved priority, on priority 0 (which belongs to the idle task), or
    /// when the arena, stack space, or heap is exhausted.
    pub fn install(&mut self, desc: &TaskDesc) -> Result<TaskId, KernelError> {
        if desc.priority == Priority::IDLE {
            return Err(KernelError::IdlePriorityReserved);
        }
        self.install_raw(desc)
    }

    /// Installs the idle task. Startup-only; everything else goes through
    /// [`Kernel::install`].
    pub(crate) fn install_idle(
        &mut self,
        desc: &TaskDesc,
    ) -> Result<TaskId, KernelError> {
        debug_assert_eq!(desc.priority, Priority::IDLE);
        self.install_raw(desc)
    }

    fn install_raw(&mut self, desc: &TaskDesc) -> Result<TaskId, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let prio = desc.priority;
        if prio.index() >= NUM_PRIORITIES {
            return Err(KernelError::BadPriority);
        }
        match self.table[prio.index()] {
            PrioSlot::Vacant => (),
            PrioSlot::Reserved => return Err(KernelError::PriorityReserved),
            PrioSlot::Held(_) => return Err(KernelError::PriorityInUse),
        }
        let slot = self
            .tasks
            .iter()
            .position(|t| t.is_none())
            .ok_or(KernelError::NoFreeTcb)? as u8;

        let stack = if desc.flags.contains(TaskFlags::DYNAMIC_STACK) {
            self.alloc_dynamic_stack(desc.stack_size)?
        } else {
            self.carve_stack(desc.stack_size)?
        };
        crate::arch::paint_stack(&stack);

        let id = TaskId::from_index_and_gen(
            usize::from(slot),
            self.gens[usize::from(slot)],
        );
        let mut task = Task {
            save: Default::default(),
            name: desc.name,
            id,
            priority: prio,
            base_priority: prio,
            stack,
            deadline: Deadline::None,
            mbox_msg: None,
            dq_next: None,
            dq_prev: None,
        };
        crate::arch::init_task_frame(&mut task, desc.entry, desc.arg);

        self.tasks[usize::from(slot)] = Some(task);
        self.table[prio.index()] = PrioSlot::Held(slot);
        self.ready.insert(prio);
        self.blocked.insert(prio);
        Ok(id)
    }

    fn carve_stack(&mut self, size: usize) -> Result<StackRegion, KernelError> {
        let offset = (self.arena_used + 7) & !7;
        let end = offset.checked_add(size).ok_or(KernelError::OutOfStack)?;
        if end > self.arena_size {
            return Err(KernelError::OutOfStack);
        }
        self.arena_used = end;
        Ok(StackRegion::Arena {
            base: self.arena_base + offset,
            size,
        })
    }

    #[cfg(feature = "dynamic")]
    fn alloc_dynamic_stack(
        &mut self,
        size: usize,
    ) -> Result<StackRegion, KernelError> {
        let layout = core::alloc::Layout::from_size_align(size.max(8), 8)
            .map_err(|_| KernelError::AllocFailed)?;
        let p = unsafe { alloc::alloc::alloc(layout) };
        if p.is_null() {
            return Err(KernelError::AllocFailed);
        }
        Ok(StackRegion::Heap {
            base: p as usize,
            size: size.max(8),
        })
    }

    #[cfg(not(feature = "dynamic"))]
    fn alloc_dynamic_stack(
        &mut self,
        _size: usize,
    ) -> Result<StackRegion, KernelError> {
        Err(KernelError::AllocFailed)
    }

    /// Uninstalls a task, freeing its slot, priority, and stack.
    ///
    /// Only legal for a task that is not parked anywhere: not on the delay
    /// list, not in any primitive's wait set, and not holding a mutex (which
    /// would strand the ceiling machinery).
    pub fn uninstall(&mut self, id: TaskId) -> Result<SwitchHint, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        let slot = self.resolve(id)?;
        let prio = self.task(slot).priority;
        if self.task(slot).deadline != Deadline::None {
            return Err(KernelError::TaskInWait);
        }
        if self.priority_waits_somewhere(prio) {
            return Err(KernelError::TaskInWait);
        }
        if self
            .mutexes
            .iter()
            .flatten()
            .any(|m| m.owner == Some(slot))
        {
            return Err(KernelError::OwnsMutex);
        }

        self.ready.remove(prio);
        self.blocked.remove(prio);
        self.table[prio.index()] = PrioSlot::Vacant;

        let task = self.tasks[usize::from(slot)]
            .take()
            .expect("resolve returned a vacant slot");
        self.release_stack(task.stack);
        self.gens[usize::from(slot)] = self.gens[usize::from(slot)].next();

        if slot == self.current {
            // The caller just removed itself; it must not keep running.
            crate::klog!("task @{} uninstalled itself", slot);
            Ok(SwitchHint::Preempt)
        } else {
            Ok(SwitchHint::Same)
        }
    }

    fn release_stack(&mut self, stack: StackRegion) {
        match stack {
            StackRegion::Arena { base, size } => {
                // Cumulative carving can only hand back the top region;
                // interior regions stay out of circulation until the arena
                // empties some other way.
                if base + size == self.arena_base + self.arena_used {
                    self.arena_used = base - self.arena_base;
                }
            }
            #[cfg(feature = "dynamic")]
            StackRegion::Heap { base, size } => {
                let layout =
                    core::alloc::Layout::from_size_align(size, 8).unwrap();
                unsafe { alloc::alloc::dealloc(base as *mut u8, layout) };
            }
        }
    }

    /// True if `prio` appears in any primitive's wait set.
    fn priority_waits_somewhere(&self, prio: Priority) -> bool {
        self.sems.iter().flatten().any(|s| s.wait.contains(prio))
            || self.mutexes.iter().flatten().any(|m| m.wait.contains(prio))
            || self
                .mailboxes
                .iter()
                .flatten()
                .any(|m| m.wait.contains(prio))
            || self.queues.iter().flatten().any(|q| q.wait.contains(prio))
    }

    // Administrative blocking. These touch only the blocked mask; a task's
    // timing and wait state is unaffected, it just stops being schedulable.

    fn check_blockable(&self, p: Priority) -> Result<(), KernelError> {
        if p.index() >= NUM_PRIORITIES {
            Err(KernelError::BadPriority)
        } else if p == Priority::IDLE {
            Err(KernelError::IdlePriorityReserved)
        } else {
            Ok(())
        }
    }

    pub fn block_priority(
        &mut self,
        p: Priority,
    ) -> Result<SwitchHint, KernelError> {
        self.check_blockable(p)?;
        self.blocked.remove(p);
        Ok(self.reschedule_hint())
    }

    pub fn unblock_priority(
        &mut self,
        p: Priority,
    ) -> Result<SwitchHint, KernelError> {
        self.check_blockable(p)?;
        self.blocked.insert(p);
        Ok(self.reschedule_hint())
    }

    pub fn block_priority_range(
        &mut self,
        lo: Priority,
        hi: Priority,
    ) -> Result<SwitchHint, KernelError> {
        self.check_blockable(lo)?;
        self.check_blockable(hi)?;
        for v in lo.0..=hi.0 {
            self.blocked.remove(Priority(v));
        }
        Ok(self.reschedule_hint())
    }

    pub fn unblock_priority_range(
        &mut self,
        lo: Priority,
        hi: Priority,
    ) -> Result<SwitchHint, KernelError> {
        self.check_blockable(lo)?;
        self.check_blockable(hi)?;
        for v in lo.0..=hi.0 {
            self.blocked.insert(Priority(v));
        }
        Ok(self.reschedule_hint())
    }

    pub fn block_task(
        &mut self,
        id: TaskId,
    ) -> Result<SwitchHint, KernelError> {
        let slot = self.resolve(id)?;
        let prio = self.task(slot).priority;
        self.block_priority(prio)
    }

    pub fn unblock_task(
        &mut self,
        id: TaskId,
    ) -> Result<SwitchHint, KernelError> {
        let slot = self.resolve(id)?;
        let prio = self.task(slot).priority;
        self.unblock_priority(prio)
    }

    // Delay list. Insertion is push-front; the tick walk is linear over the
    // whole list anyway, and the list is bounded by MAX_TASKS.

    pub(crate) fn delay_insert(&mut self, slot: u8, deadline: Tick) {
        let old_head = self.delay_head;
        {
            let t = self.task_mut(slot);
            debug_assert_eq!(t.deadline, Deadline::None);
            t.deadline = Deadline::At(deadline);
            t.dq_next = old_head;
            t.dq_prev = None;
        }
        if let Some(o) = old_head {
            self.task_mut(o).dq_prev = Some(slot);
        }
        self.delay_head = Some(slot);
    }

    pub(crate) fn delay_remove(&mut self, slot: u8) {
        let (prev, next) = {
            let t = self.task(slot);
            (t.dq_prev, t.dq_next)
        };
        match prev {
            Some(p) => self.task_mut(p).dq_next = next,
            None => self.delay_head = next,
        }
        if let Some(n) = next {
            self.task_mut(n).dq_prev = prev;
        }
        let t = self.task_mut(slot);
        t.dq_next = None;
        t.dq_prev = None;
    }

    /// Suspends the running task for `ticks`. The wake happens in
    /// [`Kernel::tick`] when the counter equals the computed deadline
    /// exactly; the resumed task then calls [`Kernel::finish_sleep`].
    pub fn sleep_current(
        &mut self,
        ticks: u32,
    ) -> Result<SwitchHint, KernelError> {
        if self.in_isr() {
            return Err(KernelError::IllegalInIsr);
        }
        if ticks == 0 || ticks >= Tick::ROLLOVER {
            return Err(KernelError::BadDelay);
        }
        let slot = self.current;
        let (deadline, _) = self.tick.deadline_after(ticks);
        let prio = self.task(slot).priority;
        self.ready.remove(prio);
        self.delay_insert(slot, deadline);
        Ok(SwitchHint::Preempt)
    }

    /// Clears the expiry marker after a plain delay wake.
    pub fn finish_sleep(&mut self) {
        let slot = self.current;
        self.task_mut(slot).deadline = Deadline::None;
    }

    /// Tick interrupt service: advance the counter and wake every delayed
    /// task whose deadline equals the new value. Runs in interrupt context
    /// under the global critical section.
    pub fn tick(&mut self) -> SwitchHint {
        let (now, rolled) = self.tick.advance();
        self.tick = now;
        let mut hint = SwitchHint::Same;
        if rolled {
            self.rollovers = self.rollovers.wrapping_add(1);
            hint = hint.combine(self.timers_rollover());
        }

        let mut cursor = self.delay_head;
        while let Some(slot) = cursor {
            cursor = self.task(slot).dq_next;
            if self.task(slot).deadline == Deadline::At(now) {
                self.delay_remove(slot);
                let prio = {
                    let t = self.task_mut(slot);
                    // Mark the wake as deadline-driven; pend paths use this
                    // to tell a timeout from a post.
                    t.deadline = Deadline::TimedOut;
                    t.priority
                };
                self.ready.insert(prio);
            }
        }
        hint.combine(self.reschedule_hint())
    }

    /// The priority that should be running: the highest member of
    /// `ready & blocked`. The idle bit keeps this from ever being empty.
    pub fn next_priority(&self) -> Priority {
        self.ready
            .intersect(self.blocked)
            .highest()
            .expect("idle ready bit clear")
    }

    /// Whether the running task is still the one that should be running.
    pub fn reschedule_hint(&self) -> SwitchHint {
        let next = self.next_priority();
        match &self.tasks[usize::from(self.current)] {
            Some(t) if t.priority == next => SwitchHint::Same,
            _ => SwitchHint::Preempt,
        }
    }

    /// Picks the next task to run and records it as current. Called from the
    /// context-switch path with the critical section held.
    pub fn next_task_slot(&mut self) -> u8 {
        let p = self.next_priority();
        match self.table[p.index()] {
            PrioSlot::Held(slot) => {
                self.current = slot;
                slot
            }
            _ => panic!("runnable priority {} names no task", p.0),
        }
    }

    /// Count of installed tasks.
    pub fn tasks_live(&self) -> u32 {
        self.tasks.iter().flatten().count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: usize) -> ! {
        unreachable!("task entry executed in a hosted test");
    }

    fn desc(priority: u8) -> TaskDesc {
        TaskDesc {
            name: "test",
            entry: never,
            arg: 0,
            stack_size: 256,
            priority: Priority(priority),
            flags: TaskFlags::empty(),
        }
    }

    fn kernel() -> Kernel {
        Kernel::new(0x2000_0000, 4096)
    }

    #[test]
    fn install_makes_task_ready() {
        let mut k = kernel();
        let id = k.install(&desc(4)).unwrap();
        assert_eq!(k.resolve(id).unwrap(), 0);
        assert!(k.ready.contains(Priority(4)));
        assert!(k.blocked.contains(Priority(4)));
        assert_eq!(k.table[4], PrioSlot::Held(0));
        assert_eq!(k.next_priority(), Priority(4));
    }

    #[test]
    fn install_duplicate_priority_fails() {
        let mut k = kernel();
        k.install(&desc(4)).unwrap();
        assert_eq!(k.install(&desc(4)), Err(KernelError::PriorityInUse));
    }

    #[test]
    fn install_at_idle_priority_fails() {
        let mut k = kernel();
        assert_eq!(k.install(&desc(0)), Err(KernelError::IdlePriorityReserved));
    }

    #[test]
    fn install_rejects_out_of_range_priority() {
        let mut k = kernel();
        assert_eq!(
            k.install(&desc(NUM_PRIORITIES as u8)),
            Err(KernelError::BadPriority)
        );
    }

    #[test]
    fn install_in_isr_fails() {
        let mut k = kernel();
        k.isr_enter();
        assert_eq!(k.install(&desc(4)), Err(KernelError::IllegalInIsr));
        let _ = k.isr_exit();
    }

    #[test]
    fn arena_exhaustion_reports_out_of_stack() {
        let mut k = Kernel::new(0x2000_0000, 300);
        k.install(&desc(4)).unwrap();
        assert_eq!(k.install(&desc(5)), Err(KernelError::OutOfStack));
    }

    #[test]
    fn uninstall_frees_priority_and_slot() {
        let mut k = kernel();
        let id = k.install(&desc(4)).unwrap();
        // Current is some other task, so no preemption is needed.
        k.install(&desc(5)).unwrap();
        k.set_current_slot(1);

        let hint = k.uninstall(id).unwrap();
        assert_eq!(hint, SwitchHint::Same);
        assert!(!k.ready.contains(Priority(4)));
        assert!(!k.blocked.contains(Priority(4)));
        assert_eq!(k.table[4], PrioSlot::Vacant);

        // The priority and the slot are both reusable.
        let id2 = k.install(&desc(4)).unwrap();
        assert_eq!(id2.index(), id.index());
        assert_ne!(id2, id, "generation must advance on reuse");
        // And the stale handle no longer resolves.
        assert_eq!(k.resolve(id), Err(KernelError::StaleTaskId));
    }

    #[test]
    fn uninstall_of_current_task_preempts() {
        let mut k = kernel();
        let id = k.install(&desc(4)).unwrap();
        k.set_current_slot(0);
        assert_eq!(k.uninstall(id).unwrap(), SwitchHint::Preempt);
    }

    #[test]
    fn uninstall_refuses_delayed_task() {
        let mut k = kernel();
        let id = k.install(&desc(4)).unwrap();
        k.set_current_slot(0);
        let _ = k.sleep_current(10).unwrap();
        assert_eq!(k.uninstall(id), Err(KernelError::TaskInWait));
    }

    #[test]
    fn stack_arena_reclaims_top_region() {
        let mut k = kernel();
        k.install(&desc(4)).unwrap();
        let used_one = k.arena_used;
        let id = k.install(&desc(5)).unwrap();
        assert!(k.arena_used > used_one);
        k.set_current_slot(0);
        k.uninstall(id).unwrap();
        assert_eq!(k.arena_used, used_one);
    }

    #[test]
    fn delay_wakes_on_exact_tick() {
        let mut k = kernel();
        k.install(&desc(4)).unwrap();
        k.install(&desc(1)).unwrap();
        k.set_current_slot(0);
        let hint = k.sleep_current(3).unwrap();
        assert_eq!(hint, SwitchHint::Preempt);
        assert!(!k.ready.contains(Priority(4)));
        // The low-priority task takes over while the sleeper waits.
        k.set_current_slot(1);

        let _ = k.tick();
        let _ = k.tick();
        assert!(!k.ready.contains(Priority(4)), "woke early");

        let hint = k.tick();
        assert!(k.ready.contains(Priority(4)));
        assert_eq!(k.task(0).deadline, Deadline::TimedOut);
        assert_eq!(hint, SwitchHint::Preempt);

        // Wakes exactly once: later ticks leave it alone.
        k.set_current_slot(0);
        k.finish_sleep();
        let _ = k.tick();
        assert_eq!(k.task(0).deadline, Deadline::None);
    }

    #[test]
    fn delay_list_handles_multiple_sleepers() {
        let mut k = kernel();
        k.install(&desc(4)).unwrap();
        k.install(&desc(5)).unwrap();
        k.install(&desc(6)).unwrap();
        k.set_current_slot(0);
        let _ = k.sleep_current(2).unwrap();
        k.set_current_slot(1);
        let _ = k.sleep_current(1).unwrap();
        k.set_current_slot(2);
        let _ = k.sleep_current(2).unwrap();

        let _ = k.tick();
        assert!(k.ready.contains(Priority(5)));
        assert!(!k.ready.contains(Priority(4)));
        assert!(!k.ready.contains(Priority(6)));

        let _ = k.tick();
        assert!(k.ready.contains(Priority(4)));
        assert!(k.ready.contains(Priority(6)));
        assert_eq!(k.delay_head, None);
    }

    #[test]
    fn zero_and_huge_delays_are_rejected() {
        let mut k = kernel();
        k.install(&desc(4)).unwrap();
        k.set_current_slot(0);
        assert_eq!(k.sleep_current(0), Err(KernelError::BadDelay));
        assert_eq!(
            k.sleep_current(Tick::ROLLOVER),
            Err(KernelError::BadDelay)
        );
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let mut k = kernel();
        k.install(&desc(4)).unwrap();
        k.install(&desc(5)).unwrap();
        k.set_current_slot(0);

        // Blocking the more important task hands the CPU to the other.
        assert_eq!(k.next_priority(), Priority(5));
        let _ = k.block_priority(Priority(5)).unwrap();
        assert_eq!(k.next_priority(), Priority(4));
        let _ = k.unblock_priority(Priority(5)).unwrap();
        assert_eq!(k.next_priority(), Priority(5));
    }

    #[test]
    fn blocking_idle_priority_is_refused() {
        let mut k = kernel();
        assert_eq!(
            k.block_priority(Priority::IDLE),
            Err(KernelError::IdlePriorityReserved)
        );
    }

    #[test]
    fn ranged_block_covers_inclusive_span() {
        let mut k = kernel();
        for p in 3..=6 {
            k.install(&desc(p)).unwrap();
        }
        let _ = k
            .block_priority_range(Priority(4), Priority(6))
            .unwrap();
        assert_eq!(k.next_priority(), Priority(3));
        let _ = k
            .unblock_priority_range(Priority(4), Priority(6))
            .unwrap();
        assert_eq!(k.next_priority(), Priority(6));
    }

    #[test]
    fn block_by_task_handle() {
        let mut k = kernel();
        let id = k.install(&desc(4)).unwrap();
        let _ = k.block_task(id).unwrap();
        assert!(!k.blocked.contains(Priority(4)));
        let _ = k.unblock_task(id).unwrap();
        assert!(k.blocked.contains(Priority(4)));
    }

    #[test]
    fn tick_rollover_counts() {
        let mut k = kernel();
        k.tick = Tick(Tick::ROLLOVER - 1);
        let _ = k.tick();
        assert_eq!(k.now(), Tick::ZERO);
        assert_eq!(k.rollovers, 1);
    }
}

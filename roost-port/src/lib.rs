#![no_std]
//! Interface between the Roost generic scheduler and an architecture port
//! backend.
//!
//! The generic scheduler decides *which* task runs next; a port backend
//! knows *how* to stop one task and continue another on the target
//! architecture. The two sides meet here: the scheduler implements
//! [`Scheduler`], and a backend implements [`FlowControl`],
//! [`InterruptControl`] and [`AlarmClock`].

pub use aligned::{A16, Aligned, Alignment};

use core::ptr::NonNull;

/// Units of the emulated kernel's virtual time.
pub type Ticks = u64;

/// Task entry function. A task must never return from its entry function;
/// the port trampoline raises a fatal error if it does.
pub type TaskEntry = fn(arg: *mut ());

/// Opaque handle identifying a task to the port layer.
///
/// The handle wraps the address of the task's continuation record, as
/// returned by `FlowControl::init_stack`. The scheduler stores it in the
/// task descriptor and hands it back when asked which task runs next; it
/// must never inspect or dereference the wrapped pointer.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct TaskHandle(NonNull<()>);

impl TaskHandle {
    pub fn new(record: NonNull<()>) -> TaskHandle {
        TaskHandle(record)
    }

    pub fn as_ptr(&self) -> *mut () {
        self.0.as_ptr()
    }
}

// The wrapped address names a continuation record that outlives every use
// of the handle; handles travel between the host threads backing tasks.
unsafe impl Send for TaskHandle {}
unsafe impl Sync for TaskHandle {}

/// Callbacks the port layer consumes from the generic scheduler.
///
/// The scheduler is the sole writer of the current-task pointer; the port
/// only reads it to learn what it is switching away from.
pub trait Scheduler: Sync {
    /// Task currently recorded as running, `None` before the first switch.
    fn current_task(&self) -> Option<TaskHandle>;

    /// Ready-queue decision: the task that should run next.
    fn next_task(&self) -> TaskHandle;

    /// Record `task` as the currently running task.
    fn set_current_task(&self, task: TaskHandle);

    /// Notification hook invoked once per performed context switch, before
    /// the switch takes effect. Not invoked for no-op switch requests.
    fn on_context_switch(&self, next: TaskHandle);

    /// Advance the kernel's virtual clock by `ticks`.
    fn advance_clock(&self, ticks: u32);

    /// Whether the scheduler has been started.
    fn is_started(&self) -> bool;
}

/// Execution-flow primitives a port backend exposes to the scheduler.
pub trait FlowControl {
    /// Required alignment of task stack regions.
    type StackAlignment: Alignment;

    /// Carve a continuation record out of the top of the given stack region
    /// and prepare it so that its first resumption lands in the task entry
    /// trampoline.
    ///
    /// `stack_top` is the highest address of the region and `stack_size`
    /// its total size; the record is placed at the top and the space below
    /// it becomes the task's usable stack. The region must be large enough
    /// to hold the record plus the host's minimum task stack; an undersized
    /// region is a fatal caller error.
    ///
    /// # Safety
    ///
    /// `stack_top - stack_size .. stack_top` must be exclusively owned,
    /// writable memory aligned to `StackAlignment`, and must stay valid for
    /// the lifetime of the task.
    unsafe fn init_stack(
        &self,
        task: *mut (),
        name: &'static str,
        entry: TaskEntry,
        arg: *mut (),
        stack_top: *mut u8,
        stack_size: usize,
    ) -> TaskHandle;

    /// Switch execution to `next`. A request naming the current task is a
    /// no-op. Depending on the critical-section strategy the switch is
    /// performed immediately or deferred to the end of the enclosing
    /// critical section.
    fn request_switch(&self, next: TaskHandle);

    /// Start the emulated machine: arm the tick source and resume the first
    /// task. Never returns on success.
    fn start(&self) -> !;

    /// Disarm the tick source and release notification registrations.
    fn stop(&self);
}

/// Emulated interrupt-enable control.
///
/// `acquire`/`restore` form the enter/exit pair of a critical section. The
/// returned state is the previous enabled state: `false` marks a nested
/// enter whose matching `restore` must leave interrupts disabled.
pub trait InterruptControl {
    /// Enter a critical section, disabling emulated interrupts.
    fn acquire(&self) -> bool;

    /// Leave a critical section, re-enabling emulated interrupts if
    /// `restore_state` says they were enabled on entry.
    fn restore(&self, restore_state: bool);

    /// Whether emulated interrupts are currently enabled.
    fn interrupt_status(&self) -> bool;
}

/// Virtual time source of a port backend.
pub trait AlarmClock {
    /// Tick frequency as ticks per second.
    const TICK_FREQ_HZ: Ticks;

    /// Monotonically growing tick counter since some earlier epoch.
    fn clock_ticks(&self) -> Ticks;

    /// Sleep until the next wake-up notification, at most `ticks` ticks
    /// (0 = indefinitely). On return the virtual clock has been advanced by
    /// the elapsed time, before any other notification effect is applied.
    fn idle_for(&self, ticks: u32);
}

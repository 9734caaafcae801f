//! Continuation store, stack initializer, continuation switcher and the
//! task entry trampoline.
//!
//! A continuation is backed by a dedicated host thread parked on a condition
//! variable inside its [`TaskContext`]: resuming the continuation signals
//! the condvar, capturing it parks the thread again. Callers never see past
//! that interface.

use crate::irq::{self, IrqStrategy};
use crate::{SWITCH_SIGNAL, SimPort, TICK_SIGNAL, fatal};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, Ordering};
use roost_port::{TaskEntry, TaskHandle};

/// Continuation record of one task.
///
/// The record lives at the top of the task's own stack region, carved out
/// by [`init_stack`]; it is owned exclusively by that task and is valid
/// from initialization until the (forbidden) return of the entry function.
#[repr(C, align(16))]
pub struct TaskContext {
    // Access to `resumed` is protected with the `suspension_lock` mutex.
    resumed: UnsafeCell<bool>,
    suspension: UnsafeCell<libc::pthread_cond_t>,
    suspension_lock: UnsafeCell<libc::pthread_mutex_t>,

    pub(crate) thread_id: libc::pthread_t,
    name: &'static str,
    entry: TaskEntry,
    argument: *mut (),

    // Task descriptor owned by the generic scheduler. The port never
    // dereferences it; it identifies the owner in diagnostics and lets the
    // scheduler find its descriptor from a continuation record.
    task: *mut (),
}

/// Continuation record of the task currently executing. Written only by the
/// switcher and the lifecycle start path; the timer thread reads it to
/// direct tick signals at whichever task is current.
pub(crate) static CURRENT_CONTEXT: AtomicPtr<TaskContext> =
    AtomicPtr::new(core::ptr::null_mut());

impl TaskContext {
    unsafe fn is_resumed(&self) -> bool {
        unsafe { *self.resumed.get() }
    }

    unsafe fn set_resumed(&self, state: bool) {
        unsafe {
            *self.resumed.get() = state;
        }
    }

    /// Task descriptor of the owner, as given to `init_stack`.
    pub(crate) fn task(&self) -> *mut () {
        self.task
    }

    /// Capture: park the calling thread until the continuation is resumed.
    pub(crate) fn suspend(&self) {
        unsafe {
            if libc::pthread_mutex_lock(self.suspension_lock.get()) != 0 {
                fatal!("failed to lock suspension mutex of task '{}'", self.name);
            }

            while !self.is_resumed() {
                if libc::pthread_cond_wait(self.suspension.get(), self.suspension_lock.get()) != 0
                {
                    fatal!("failed to wait on suspension of task '{}'", self.name);
                }
            }
            self.set_resumed(false);

            if libc::pthread_mutex_unlock(self.suspension_lock.get()) != 0 {
                fatal!("failed to unlock suspension mutex of task '{}'", self.name);
            }
        }
    }

    /// Resume: wake the thread parked in [`TaskContext::suspend`]. Resuming
    /// the calling thread's own continuation is a no-op.
    pub(crate) fn resume(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.suspension_lock.get());
            if libc::pthread_self() != self.thread_id {
                self.set_resumed(true);
                libc::pthread_cond_signal(self.suspension.get());
            }
            libc::pthread_mutex_unlock(self.suspension_lock.get());
        }
    }

    pub(crate) unsafe fn from_handle<'a>(handle: TaskHandle) -> &'a TaskContext {
        unsafe { &*(handle.as_ptr() as *const TaskContext) }
    }
}

pub(crate) fn reset_current() {
    CURRENT_CONTEXT.store(core::ptr::null_mut(), Ordering::SeqCst);
}

/// Queue an emulated interrupt signal to the host thread of the current
/// task. Dropped when no task is current yet.
pub(crate) fn post_signal_to_current(signo: libc::c_int) {
    let context = CURRENT_CONTEXT.load(Ordering::SeqCst);
    let Some(context) = (unsafe { context.as_ref() }) else {
        return;
    };
    let value = libc::sigval {
        sival_ptr: core::ptr::null_mut(),
    };
    if unsafe { libc::pthread_sigqueue(context.thread_id, signo, value) } != 0 {
        fatal!("failed to queue signal {} to task '{}'", signo, context.name);
    }
}

/// Carve a continuation record out of the top of `stack_top - stack_size ..
/// stack_top` and prepare it so that its first resumption lands in
/// [`task_trampoline`].
///
/// The record is placed at the highest suitably aligned address of the
/// region; everything below it backs the host thread's stack. The usable
/// remainder must be at least the host's minimum thread stack, which is
/// checked here rather than left as an unchecked caller obligation.
pub(crate) unsafe fn init_stack(
    task: *mut (),
    name: &'static str,
    entry: TaskEntry,
    argument: *mut (),
    stack_top: *mut u8,
    stack_size: usize,
) -> TaskHandle {
    let top = stack_top as usize;
    let base = match top.checked_sub(stack_size) {
        Some(base) => base,
        None => fatal!("stack region of task '{}' wraps the address space", name),
    };
    let record_addr =
        top.saturating_sub(size_of::<TaskContext>()) & !(align_of::<TaskContext>() - 1);
    let usable = record_addr.saturating_sub(base);
    if usable < libc::PTHREAD_STACK_MIN {
        fatal!(
            "stack of task '{}' too small: {} usable bytes, host requires {}",
            name,
            usable,
            libc::PTHREAD_STACK_MIN
        );
    }

    let context = record_addr as *mut TaskContext;

    unsafe {
        let mut attr = MaybeUninit::uninit();
        if libc::pthread_attr_init(attr.as_mut_ptr()) != 0
            || libc::pthread_attr_setstack(attr.as_mut_ptr(), base as *mut libc::c_void, usable)
                != 0
        {
            fatal!("failed to set task '{}' stack to {} bytes", name, usable);
        }

        // All record fields are written before the thread that reads them
        // exists; `thread_id` is filled in last, by pthread_create itself.
        (*context).resumed = UnsafeCell::new(false);
        (*context).suspension = UnsafeCell::new(libc::PTHREAD_COND_INITIALIZER);
        (*context).suspension_lock = UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER);
        (*context).name = name;
        (*context).entry = entry;
        (*context).argument = argument;
        (*context).task = task;

        if libc::pthread_create(
            &raw mut (*context).thread_id,
            attr.as_ptr(),
            task_trampoline,
            context as *mut libc::c_void,
        ) != 0
        {
            fatal!("failed to create host thread for task '{}'", name);
        }

        libc::pthread_attr_destroy(attr.as_mut_ptr());

        // Host thread carries the task name for debugger output.
        if let Ok(c_name) = std::ffi::CString::new(name) {
            libc::pthread_setname_np((*context).thread_id, c_name.as_ptr());
        }

        TaskHandle::new(NonNull::new_unchecked(context as *mut ()))
    }
}

/// Fixed landing point of every task's first resumption.
///
/// The freshly created host thread parks here until the switcher or the
/// start path resumes its continuation for the first time. Whatever the
/// rest of the stack region contains, execution lands here and nowhere
/// else.
extern "C" fn task_trampoline(arg: *mut libc::c_void) -> *mut libc::c_void {
    let context = unsafe { &*(arg as *const TaskContext) };

    // Emulated interrupt signals stay out of this thread until the task is
    // scheduled in for the first time.
    unsafe {
        let mut set = MaybeUninit::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        libc::sigaddset(set.as_mut_ptr(), TICK_SIGNAL);
        libc::sigaddset(set.as_mut_ptr(), SWITCH_SIGNAL);
        libc::pthread_sigmask(libc::SIG_BLOCK, set.as_ptr(), core::ptr::null_mut());
    }

    // Wait for the first resume.
    context.suspend();

    // The scheduling machinery resumed this task from inside a critical
    // section; leave it before entering the task body.
    irq::Active::enable();

    (context.entry)(context.argument);

    fatal!("task '{}' returned from its entry function", context.name);
}

/// Switch execution from the current task to `next`.
///
/// Returns immediately when `next` is already current. Otherwise the
/// calling task's continuation is captured and the call returns only when
/// that continuation is resumed by some later switch; the resume path
/// reappears either here, right after the capture, or in the trampoline for
/// a first run.
pub(crate) fn switch_context(port: &SimPort, next: TaskHandle) {
    if irq::Active::interrupt_status() {
        fatal!("context switch attempted with emulated interrupts enabled");
    }

    let scheduler = port.scheduler();
    if scheduler.current_task() == Some(next) {
        return;
    }

    scheduler.on_context_switch(next);
    scheduler.set_current_task(next);

    let next_context = unsafe { TaskContext::from_handle(next) };
    let prev = CURRENT_CONTEXT.swap(
        next_context as *const TaskContext as *mut TaskContext,
        Ordering::SeqCst,
    );
    let Some(prev) = (unsafe { prev.as_ref() }) else {
        fatal!("context switch before the first task was started");
    };

    next_context.resume();
    // Capture point: execution continues here when this task is next
    // scheduled in.
    prev.suspend();
}

/// Record `first` as current and resume it. Start-path counterpart of
/// [`switch_context`]: the boot thread resumes the first task without
/// having a continuation of its own to capture.
pub(crate) fn resume_first(first: TaskHandle) {
    let context = unsafe { TaskContext::from_handle(first) };
    CURRENT_CONTEXT.store(
        context as *const TaskContext as *mut TaskContext,
        Ordering::SeqCst,
    );
    context.resume();
}

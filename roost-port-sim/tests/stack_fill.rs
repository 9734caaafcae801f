//! A stack region pre-filled with garbage must not change where the first
//! resumption lands: always the entry trampoline, then the entry function.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use roost_port::{Aligned, FlowControl, Scheduler, TaskHandle};
use roost_port_sim::SimPort;

const STACK_SIZE: usize = 256 * 1024;

struct FilledStack(UnsafeCell<Aligned<roost_port::A16, [u8; STACK_SIZE]>>);

// Handed to exactly one task; never touched again from this side.
unsafe impl Sync for FilledStack {}

static STACK: FilledStack = FilledStack(UnsafeCell::new(Aligned([0xAA; STACK_SIZE])));

struct SingleScheduler {
    only: AtomicPtr<()>,
    current: AtomicPtr<()>,
    started: AtomicBool,
}

static SCHED: SingleScheduler = SingleScheduler {
    only: AtomicPtr::new(core::ptr::null_mut()),
    current: AtomicPtr::new(core::ptr::null_mut()),
    started: AtomicBool::new(false),
};

impl Scheduler for SingleScheduler {
    fn current_task(&self) -> Option<TaskHandle> {
        NonNull::new(self.current.load(Ordering::SeqCst)).map(TaskHandle::new)
    }

    fn next_task(&self) -> TaskHandle {
        TaskHandle::new(NonNull::new(self.only.load(Ordering::SeqCst)).unwrap())
    }

    fn set_current_task(&self, task: TaskHandle) {
        self.current.store(task.as_ptr(), Ordering::SeqCst);
    }

    fn on_context_switch(&self, _next: TaskHandle) {}

    fn advance_clock(&self, _ticks: u32) {}

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

fn garbage_stack_task(arg: *mut ()) {
    // Reaching this point through the trampoline is the whole test; the
    // argument must have survived the garbage fill too.
    assert_eq!(arg as usize, 0xC0FFEE);
    std::process::exit(0);
}

fn main() {
    let port = SimPort::init(&SCHED);

    let bottom = STACK.0.get() as *mut u8;
    let handle = unsafe {
        port.init_stack(
            core::ptr::null_mut(),
            "garbage",
            garbage_stack_task,
            0xC0FFEE as *mut (),
            bottom.add(STACK_SIZE),
            STACK_SIZE,
        )
    };
    SCHED.only.store(handle.as_ptr(), Ordering::SeqCst);

    SCHED.started.store(true, Ordering::SeqCst);
    port.start();
}

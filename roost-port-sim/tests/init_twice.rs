//! Duplicate port initialization hands back the same instance, and the
//! emulated machine still starts normally afterwards.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use roost_port::{FlowControl, Scheduler, TaskHandle};
use roost_port_sim::SimPort;
use roost_port_sim::stack::Stack;

const STACK_SIZE: usize = 256 * 1024;

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

fn only_task(_arg: *mut ()) {
    // A third init from inside a running task is equally inert.
    let port = SimPort::init(&SCHED);
    assert!(core::ptr::eq(port, SimPort::instance()));
    std::process::exit(0);
}

fn main() {
    static STACK: Stack<STACK_SIZE> = Stack::new();

    let first = SimPort::init(&SCHED);
    let second = SimPort::init(&SCHED);
    assert!(core::ptr::eq(first, second));
    assert!(core::ptr::eq(first, SimPort::instance()));

    let mut stack = STACK.take();
    let handle = unsafe {
        first.init_stack(
            core::ptr::null_mut(),
            "only",
            only_task,
            core::ptr::null_mut(),
            stack.top_ptr(),
            stack.size(),
        )
    };
    SCHED.only.store(handle.as_ptr(), Ordering::SeqCst);

    SCHED.started.store(true, Ordering::SeqCst);
    second.start();
}

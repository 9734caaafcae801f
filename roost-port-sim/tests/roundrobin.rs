//! Three tasks pass control around the ring once and end up back at the
//! first; a switch request naming the current task must be a no-op.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use roost_port::{FlowControl, Scheduler, TaskHandle};
use roost_port_sim::SimPort;
use roost_port_sim::stack::Stack;

const STACK_SIZE: usize = 256 * 1024;

struct RingScheduler {
    tasks: [AtomicPtr<()>; 3],
    current: AtomicPtr<()>,
    switches: AtomicUsize,
    started: AtomicBool,
}

static SCHED: RingScheduler = RingScheduler {
    tasks: [
        AtomicPtr::new(core::ptr::null_mut()),
        AtomicPtr::new(core::ptr::null_mut()),
        AtomicPtr::new(core::ptr::null_mut()),
    ],
    current: AtomicPtr::new(core::ptr::null_mut()),
    switches: AtomicUsize::new(0),
    started: AtomicBool::new(false),
};

impl RingScheduler {
    fn task(&self, index: usize) -> TaskHandle {
        let record = self.tasks[index].load(Ordering::SeqCst);
        TaskHandle::new(NonNull::new(record).unwrap())
    }
}

impl Scheduler for RingScheduler {
    fn current_task(&self) -> Option<TaskHandle> {
        NonNull::new(self.current.load(Ordering::SeqCst)).map(TaskHandle::new)
    }

    fn next_task(&self) -> TaskHandle {
        // Switches are driven explicitly by the tasks; a tick changes
        // nothing, and the first task to start is task 0.
        match self.current_task() {
            Some(current) => current,
            None => self.task(0),
        }
    }

    fn set_current_task(&self, task: TaskHandle) {
        self.current.store(task.as_ptr(), Ordering::SeqCst);
    }

    fn on_context_switch(&self, _next: TaskHandle) {
        self.switches.fetch_add(1, Ordering::SeqCst);
    }

    fn advance_clock(&self, _ticks: u32) {}

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

static RUNS: [AtomicUsize; 3] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

fn ring_task(arg: *mut ()) {
    let index = arg as usize;
    RUNS[index].fetch_add(1, Ordering::SeqCst);

    let port = SimPort::instance();
    match index {
        0 => {
            port.request_switch(SCHED.task(1));

            // Back from the full round.
            assert_eq!(SCHED.current_task(), Some(SCHED.task(0)));
            for runs in &RUNS {
                assert_eq!(runs.load(Ordering::SeqCst), 1);
            }
            assert_eq!(SCHED.switches.load(Ordering::SeqCst), 3);

            std::process::exit(0);
        }
        1 => {
            port.request_switch(SCHED.task(2));
            unreachable!("task 1 resumed after handing off");
        }
        _ => {
            // Last in the ring: everyone before us ran exactly once.
            for runs in &RUNS {
                assert_eq!(runs.load(Ordering::SeqCst), 1);
            }
            assert_eq!(SCHED.switches.load(Ordering::SeqCst), 2);

            // Naming the current task must not switch and must not notify.
            port.request_switch(SCHED.task(2));
            assert_eq!(SCHED.switches.load(Ordering::SeqCst), 2);
            assert_eq!(SCHED.current_task(), Some(SCHED.task(2)));

            // Close the ring; task 0 finishes the test.
            port.request_switch(SCHED.task(0));
            unreachable!("last ring task resumed after closing the ring");
        }
    }
}

fn main() {
    static STACK_A: Stack<STACK_SIZE> = Stack::new();
    static STACK_B: Stack<STACK_SIZE> = Stack::new();
    static STACK_C: Stack<STACK_SIZE> = Stack::new();

    let port = SimPort::init(&SCHED);

    let members: [(&'static str, &'static Stack<STACK_SIZE>); 3] = [
        ("ring0", &STACK_A),
        ("ring1", &STACK_B),
        ("ring2", &STACK_C),
    ];
    for (index, (name, stack)) in members.into_iter().enumerate() {
        let mut stack = stack.take();
        let handle = unsafe {
            port.init_stack(
                core::ptr::null_mut(),
                name,
                ring_task,
                index as *mut (),
                stack.top_ptr(),
                stack.size(),
            )
        };
        SCHED.tasks[index].store(handle.as_ptr(), Ordering::SeqCst);
    }

    SCHED.started.store(true, Ordering::SeqCst);
    port.start();
}

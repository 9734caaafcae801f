//! Two tasks greeting each other in lockstep on the simulation port: a
//! minimal round-robin scheduler, explicit handoffs, a shared counter
//! updated inside a critical section, and a timed sleep between rounds.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use roost_port::{AlarmClock, FlowControl, Scheduler, TaskHandle};
use roost_port_sim::{SimPort, printkln};
use roost_port_sim::stack::Stack;

const STACK_SIZE: usize = 256 * 1024;
const ROUNDS: u64 = 5;

struct RoundRobin {
    tasks: [AtomicPtr<()>; 2],
    current: AtomicPtr<()>,
    clock: AtomicU64,
    started: AtomicBool,
}

static SCHED: RoundRobin = RoundRobin {
    tasks: [
        AtomicPtr::new(core::ptr::null_mut()),
        AtomicPtr::new(core::ptr::null_mut()),
    ],
    current: AtomicPtr::new(core::ptr::null_mut()),
    clock: AtomicU64::new(0),
    started: AtomicBool::new(false),
};

impl RoundRobin {
    fn task(&self, index: usize) -> TaskHandle {
        let record = self.tasks[index].load(Ordering::SeqCst);
        TaskHandle::new(NonNull::new(record).unwrap())
    }
}

impl Scheduler for RoundRobin {
    fn current_task(&self) -> Option<TaskHandle> {
        NonNull::new(self.current.load(Ordering::SeqCst)).map(TaskHandle::new)
    }

    fn next_task(&self) -> TaskHandle {
        match self.current_task() {
            Some(current) if current == self.task(0) => self.task(1),
            _ => self.task(0),
        }
    }

    fn set_current_task(&self, task: TaskHandle) {
        self.current.store(task.as_ptr(), Ordering::SeqCst);
    }

    fn on_context_switch(&self, _next: TaskHandle) {}

    fn advance_clock(&self, ticks: u32) {
        self.clock.fetch_add(ticks as u64, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

// Written by both tasks, one round at a time.
static GREETINGS: critical_section::Mutex<core::cell::Cell<u64>> =
    critical_section::Mutex::new(core::cell::Cell::new(0));

fn greeter(arg: *mut ()) {
    let index = arg as usize;
    let port = SimPort::instance();

    loop {
        let greetings = critical_section::with(|cs| {
            let counter = GREETINGS.borrow(cs);
            counter.set(counter.get() + 1);
            counter.get()
        });
        printkln!(
            "hello from task {} (greeting {}, tick {})",
            index,
            greetings,
            SCHED.clock.load(Ordering::SeqCst)
        );

        if greetings >= 2 * ROUNDS {
            printkln!("goodbye after {} greetings", greetings);
            std::process::exit(0);
        }

        // Let some virtual time pass, then hand over.
        port.idle_for(10);
        port.request_switch(SCHED.task(1 - index));
    }
}

fn main() {
    static STACK_A: Stack<STACK_SIZE> = Stack::new();
    static STACK_B: Stack<STACK_SIZE> = Stack::new();

    let port = SimPort::init(&SCHED);

    let stacks: [&'static Stack<STACK_SIZE>; 2] = [&STACK_A, &STACK_B];
    let names = ["greeter0", "greeter1"];
    for index in 0..2 {
        let mut stack = stacks[index].take();
        let handle = unsafe {
            port.init_stack(
                core::ptr::null_mut(),
                names[index],
                greeter,
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

//! POSIX host-simulation port backend for the Roost kernel.
//!
//! The backend makes a single host process behave like a preemptive
//! embedded CPU: every task is backed by a dedicated host thread of which
//! at most one runs at a time, emulated interrupts are host signals, and
//! the tick source is a host thread waiting on deadlines. The generic
//! scheduler talks to all of it through the `roost-port` traits.
//!
//! The critical-section strategy is selected at build time: the default is
//! cooperative emulation with a software flag; the `preempt` cargo feature
//! switches to real asynchronous preemption through signal masking.

#[macro_use]
pub mod printk;

mod context;
mod irq;
pub mod stack;
mod timer;

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::irq::IrqStrategy;
pub use crate::timer::{TICK_FREQ_HZ, clock_ticks};
use roost_port::{AlarmClock, FlowControl, InterruptControl, Scheduler, TaskEntry, TaskHandle, Ticks};

/// Host signal standing in for the context-switch interrupt line.
pub const SWITCH_SIGNAL: libc::c_int = libc::SIGUSR1;

/// Host signal standing in for the periodic tick interrupt line.
pub const TICK_SIGNAL: libc::c_int = libc::SIGALRM;

/// Terminate the emulated machine and the host process with it.
pub fn abort() -> ! {
    unsafe { libc::abort() }
}

/// The simulation port backend. One per process, created by
/// [`SimPort::init`].
pub struct SimPort {
    scheduler: &'static dyn Scheduler,
    timer: timer::VirtualTimer,
}

struct PortCell(UnsafeCell<MaybeUninit<SimPort>>);

// Written once by init before INITIALIZED is raised; read-only afterwards.
unsafe impl Sync for PortCell {}

static PORT: PortCell = PortCell(UnsafeCell::new(MaybeUninit::uninit()));
static INITIALIZED: AtomicBool = AtomicBool::new(false);

impl SimPort {
    /// Initialize the port backend for `scheduler`: spawn the virtual timer
    /// thread (disarmed) and install the emulated-interrupt signal
    /// handlers. Idempotent; a repeated call changes nothing and returns
    /// the existing instance.
    pub fn init(scheduler: &'static dyn Scheduler) -> &'static SimPort {
        if INITIALIZED.swap(true, Ordering::SeqCst) {
            return SimPort::instance();
        }

        context::reset_current();

        unsafe {
            let port = (*PORT.0.get()).as_mut_ptr();
            (&raw mut (*port).scheduler).write(scheduler);
            timer::VirtualTimer::init(&raw mut (*port).timer);
        }

        irq::Active::install();

        SimPort::instance()
    }

    /// The port backend created by [`SimPort::init`]. Fatal before init.
    pub fn instance() -> &'static SimPort {
        if !INITIALIZED.load(Ordering::SeqCst) {
            fatal!("port backend used before initialization");
        }
        unsafe { (*PORT.0.get()).assume_init_ref() }
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler
    }

    pub(crate) fn timer(&self) -> &timer::VirtualTimer {
        &self.timer
    }

    /// Whether the scheduler reports the emulated machine as started.
    pub fn is_started(&self) -> bool {
        self.scheduler.is_started()
    }

    /// Queue a context-switch interrupt to the current task, as an emulated
    /// peripheral would. Under asynchronous preemption the current task is
    /// trapped wherever it happens to be; under cooperative emulation the
    /// request is latched and honored at the next critical-section exit.
    pub fn post_interrupt(&self) {
        context::post_signal_to_current(SWITCH_SIGNAL);
    }

    fn start_first_task(&self) -> ! {
        // The boot thread never executes task code; emulated interrupts
        // must not land here.
        irq::set_thread_signal_mask(libc::SIG_BLOCK);

        let _ = irq::Active::acquire();

        let first = self.scheduler.next_task();
        self.scheduler.set_current_task(first);

        timer::reset_clock_origin();
        self.timer.arm_periodic(1);

        context::resume_first(first);

        // The emulated machine now lives in the task threads; this thread
        // only keeps the process alive.
        let set = irq::emulated_signal_set();
        loop {
            let mut sig: libc::c_int = 0;
            if unsafe { libc::sigwait(&set, &mut sig) } != 0 {
                fatal!("boot thread failed to park");
            }
        }
    }

    fn shut_down(&self) {
        self.timer.disarm();
        irq::Active::uninstall();
        context::reset_current();
    }
}

impl FlowControl for SimPort {
    type StackAlignment = roost_port::A16;

    unsafe fn init_stack(
        &self,
        task: *mut (),
        name: &'static str,
        entry: TaskEntry,
        arg: *mut (),
        stack_top: *mut u8,
        stack_size: usize,
    ) -> TaskHandle {
        unsafe { context::init_stack(task, name, entry, arg, stack_top, stack_size) }
    }

    fn request_switch(&self, next: TaskHandle) {
        irq::Active::request_switch(self, next);
    }

    fn start(&self) -> ! {
        self.start_first_task()
    }

    fn stop(&self) {
        self.shut_down();
    }
}

impl InterruptControl for SimPort {
    fn acquire(&self) -> bool {
        irq::Active::acquire()
    }

    fn restore(&self, restore_state: bool) {
        irq::Active::restore(restore_state);
    }

    fn interrupt_status(&self) -> bool {
        irq::Active::interrupt_status()
    }
}

impl AlarmClock for SimPort {
    const TICK_FREQ_HZ: Ticks = timer::TICK_FREQ_HZ;

    fn clock_ticks(&self) -> Ticks {
        timer::clock_ticks()
    }

    fn idle_for(&self, ticks: u32) {
        timer::idle_wait(self, ticks);
    }
}

mod critical_section_impl {
    //! Process-wide `critical_section` provider, so application code can
    //! use `critical_section::with` against the emulated interrupt-enable
    //! state.

    use crate::irq::{self, IrqStrategy};

    struct SimCriticalSection;
    critical_section::set_impl!(SimCriticalSection);

    unsafe impl critical_section::Impl for SimCriticalSection {
        unsafe fn acquire() -> bool {
            irq::Active::acquire()
        }

        unsafe fn release(restore_state: bool) {
            irq::Active::restore(restore_state);
        }
    }
}

//! Emulated interrupt-disable, in two build-time interchangeable
//! strategies.
//!
//! [`preempt::SignalMask`] (cargo feature `preempt`) gates real asynchronous
//! signal delivery with the per-thread signal mask, so an emulated interrupt
//! can land in the middle of anything the current task is doing, system
//! calls included. [`coop::SoftwareFlag`] (the default) replaces delivery
//! with a software flag and a deferred-switch flag, so a context switch can
//! only happen between atomic steps of the emulated kernel.
//!
//! Both implement [`IrqStrategy`]; [`Active`] is the compile-time selected
//! one.

use crate::context;
use crate::{SWITCH_SIGNAL, SimPort, TICK_SIGNAL, fatal};
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicBool, Ordering};
use roost_port::TaskHandle;

pub(crate) trait IrqStrategy {
    /// Register host signal handlers. Called once from port init.
    fn install();

    /// Remove the handler registrations again.
    fn uninstall();

    /// Enter a critical section. Returns the previous enabled state;
    /// `false` marks a nested enter whose matching [`IrqStrategy::restore`]
    /// must leave interrupts disabled.
    fn acquire() -> bool;

    /// Leave a critical section, honoring a deferred switch first where the
    /// strategy defers them.
    fn restore(restore_state: bool);

    /// Whether emulated interrupts are currently enabled.
    fn interrupt_status() -> bool;

    /// Unconditionally enable emulated interrupts for the calling thread.
    /// Used by the trampoline on the first entry of a task, which starts
    /// life inside the critical section of whoever scheduled it in.
    fn enable();

    /// `request_switch` entry point: switch now, or mark the switch
    /// deferred, as the strategy dictates.
    fn request_switch(port: &SimPort, next: TaskHandle);

    /// Replay of a switch notification collected while idle-sleeping.
    fn replay_switch(port: &SimPort);
}

#[cfg(feature = "preempt")]
pub(crate) type Active = preempt::SignalMask;
#[cfg(not(feature = "preempt"))]
pub(crate) type Active = coop::SoftwareFlag;

/// Signal set standing in for the interrupt lines of the emulated machine.
pub(crate) fn emulated_signal_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::uninit();
        if libc::sigemptyset(set.as_mut_ptr()) != 0
            || libc::sigaddset(set.as_mut_ptr(), TICK_SIGNAL) != 0
            || libc::sigaddset(set.as_mut_ptr(), SWITCH_SIGNAL) != 0
        {
            fatal!("failed to build emulated interrupt signal set");
        }
        set.assume_init()
    }
}

/// Block or unblock the emulated interrupt signals in the calling thread.
pub(crate) fn set_thread_signal_mask(how: libc::c_int) {
    let set = emulated_signal_set();
    if unsafe { libc::pthread_sigmask(how, &set, core::ptr::null_mut()) } != 0 {
        fatal!("failed to change emulated interrupt signal mask");
    }
}

type SignalHandler = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

fn install_handler(signo: libc::c_int, handler: SignalHandler) {
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = handler as usize;
        // The peer signal is held off while a handler runs.
        action.sa_mask = emulated_signal_set();
        action.sa_flags = libc::SA_SIGINFO;
        if libc::sigaction(signo, &action, core::ptr::null_mut()) != 0 {
            fatal!("failed to install handler for signal {}", signo);
        }
    }
}

fn restore_default(signo: libc::c_int) {
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        if libc::sigaction(signo, &action, core::ptr::null_mut()) != 0 {
            fatal!("failed to restore default disposition of signal {}", signo);
        }
    }
}

/// Strategy A: asynchronous preemption through real signal delivery.
#[cfg_attr(not(feature = "preempt"), allow(dead_code))]
pub(crate) mod preempt {
    use super::*;

    // Mirrors the emulated master interrupt-enable bit; the actual gate is
    // the per-thread signal mask of whichever task thread is current.
    static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);

    pub(crate) struct SignalMask;

    extern "C" fn trap_handler(
        sig: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
        let port = SimPort::instance();

        // Interrupts are disabled for the duration of trap handling.
        let restore_state = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);

        if port.scheduler().is_started() {
            match sig {
                TICK_SIGNAL => {
                    // The clock advance always precedes the reschedule it
                    // may cause.
                    crate::timer::report_elapsed(port.scheduler());
                    context::switch_context(port, port.scheduler().next_task());
                }
                SWITCH_SIGNAL => {
                    context::switch_context(port, port.scheduler().next_task());
                }
                _ => fatal!("unhandled emulated interrupt signal {}", sig),
            }
        }

        INTERRUPTS_ENABLED.store(restore_state, Ordering::SeqCst);
    }

    impl IrqStrategy for SignalMask {
        fn install() {
            install_handler(TICK_SIGNAL, trap_handler);
            install_handler(SWITCH_SIGNAL, trap_handler);
        }

        fn uninstall() {
            restore_default(TICK_SIGNAL);
            restore_default(SWITCH_SIGNAL);
        }

        fn acquire() -> bool {
            let old_state = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);
            if old_state {
                set_thread_signal_mask(libc::SIG_BLOCK);
            }
            old_state
        }

        fn restore(restore_state: bool) {
            // A nested enter found the signals already blocked; the outer
            // call remains responsible for unblocking them.
            if restore_state {
                INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
                set_thread_signal_mask(libc::SIG_UNBLOCK);
            }
        }

        fn interrupt_status() -> bool {
            INTERRUPTS_ENABLED.load(Ordering::SeqCst)
        }

        fn enable() {
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
            set_thread_signal_mask(libc::SIG_UNBLOCK);
        }

        fn request_switch(port: &SimPort, next: TaskHandle) {
            let restore_state = Self::acquire();
            context::switch_context(port, next);
            Self::restore(restore_state);
        }

        fn replay_switch(port: &SimPort) {
            context::switch_context(port, port.scheduler().next_task());
        }
    }
}

/// Strategy B: cooperative emulation with a software flag.
#[cfg_attr(feature = "preempt", allow(dead_code))]
pub(crate) mod coop {
    use super::*;

    // Interrupts start disabled; the first task entry enables them.
    static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(false);

    // Switch requested while inside a critical section, to be honored by
    // the matching restore.
    static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);

    // The periodic tick fired; its effect is applied at the next poll
    // point instead of inside the asynchronous delivery context.
    static TICK_PENDING: AtomicBool = AtomicBool::new(false);

    pub(crate) struct SoftwareFlag;

    extern "C" fn tick_flag_handler(
        _sig: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
        TICK_PENDING.store(true, Ordering::SeqCst);
    }

    extern "C" fn switch_flag_handler(
        _sig: libc::c_int,
        _info: *mut libc::siginfo_t,
        _ucontext: *mut libc::c_void,
    ) {
        SWITCH_PENDING.store(true, Ordering::SeqCst);
    }

    /// Apply the effect of any tick that fired since the last poll. The
    /// flag can only have been set after port init, so the instance lookup
    /// cannot fail here.
    fn poll_tick() {
        if TICK_PENDING.swap(false, Ordering::SeqCst) {
            let port = SimPort::instance();
            if port.scheduler().is_started() {
                crate::timer::report_elapsed(port.scheduler());
            }
        }
    }

    impl IrqStrategy for SoftwareFlag {
        fn install() {
            install_handler(TICK_SIGNAL, tick_flag_handler);
            install_handler(SWITCH_SIGNAL, switch_flag_handler);
        }

        fn uninstall() {
            restore_default(TICK_SIGNAL);
            restore_default(SWITCH_SIGNAL);
        }

        fn acquire() -> bool {
            let old_state = INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst);
            if old_state {
                // A tick that fired while interrupts were enabled takes
                // effect at the section boundary, entering as well as
                // leaving; code inside the section never sees it as stale.
                poll_tick();
            }
            old_state
        }

        fn restore(restore_state: bool) {
            if !restore_state {
                return;
            }
            if SWITCH_PENDING.swap(false, Ordering::SeqCst) {
                // The deferred switch runs while interrupts are still
                // disabled; the switcher requires it.
                let port = SimPort::instance();
                context::switch_context(port, port.scheduler().next_task());
            }
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
            poll_tick();
        }

        fn interrupt_status() -> bool {
            INTERRUPTS_ENABLED.load(Ordering::SeqCst)
        }

        fn enable() {
            INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
            // The flag handler is harmless wherever it lands; let the host
            // deliver the tick signal to this thread.
            set_thread_signal_mask(libc::SIG_UNBLOCK);
        }

        fn request_switch(port: &SimPort, next: TaskHandle) {
            if !INTERRUPTS_ENABLED.load(Ordering::SeqCst) {
                SWITCH_PENDING.store(true, Ordering::SeqCst);
                return;
            }
            let restore_state = Self::acquire();
            context::switch_context(port, next);
            Self::restore(restore_state);
        }

        fn replay_switch(_port: &SimPort) {
            // Latched instead of performed: the idle driver's own critical
            // section exit honors the flag.
            SWITCH_PENDING.store(true, Ordering::SeqCst);
        }
    }

}

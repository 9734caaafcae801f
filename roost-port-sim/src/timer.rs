//! Tick timer and the idle driver.
//!
//! A dedicated host thread converts armed deadlines into tick-signal
//! deliveries to whichever task thread is current. The idle driver parks
//! the current task in `sigwait` until the next notification, then replays
//! whatever accumulated while it slept, clock advance first.

use crate::context;
use crate::irq::{self, IrqStrategy};
use crate::{SWITCH_SIGNAL, SimPort, TICK_SIGNAL, fatal};
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU64, Ordering};
use roost_port::{Scheduler, Ticks};

/// Emulated tick frequency: one tick per millisecond.
pub const TICK_FREQ_HZ: Ticks = 1_000;

/// Host clock backing the emulated monotonic time.
const SIM_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;

/// Host tick count at which the virtual clock was last advanced.
static LAST_REPORTED: AtomicU64 = AtomicU64::new(0);

/// Monotonically growing host tick counter since some earlier epoch.
pub fn clock_ticks() -> Ticks {
    let mut now = MaybeUninit::uninit();
    if unsafe { libc::clock_gettime(SIM_CLOCK, now.as_mut_ptr()) } != 0 {
        fatal!("failed to read the simulation clock");
    }
    timespec_to_ticks(unsafe { now.assume_init() })
}

pub(crate) fn timespec_to_ticks(time: libc::timespec) -> Ticks {
    (time.tv_sec as u64) * TICK_FREQ_HZ + (time.tv_nsec as u64) * TICK_FREQ_HZ / 1_000_000_000
}

pub(crate) fn ticks_to_timespec(ticks: Ticks) -> libc::timespec {
    libc::timespec {
        tv_sec: (ticks / TICK_FREQ_HZ) as i64,
        tv_nsec: ((ticks % TICK_FREQ_HZ) * (1_000_000_000 / TICK_FREQ_HZ)) as i64,
    }
}

/// Reset the origin against which elapsed time is reported. Called once
/// when the tick source is armed at start.
pub(crate) fn reset_clock_origin() {
    LAST_REPORTED.store(clock_ticks(), Ordering::SeqCst);
}

/// Advance the scheduler's virtual clock by however much host time elapsed
/// since the previous report.
pub(crate) fn report_elapsed(scheduler: &dyn Scheduler) {
    let now = clock_ticks();
    let last = LAST_REPORTED.swap(now, Ordering::SeqCst);
    if now > last {
        scheduler.advance_clock((now - last).min(u32::MAX as u64) as u32);
    }
}

enum TimerMode {
    Disarmed,
    OneShot { deadline: Ticks },
    Periodic { deadline: Ticks, interval: Ticks },
}

pub(crate) struct VirtualTimer {
    wait: UnsafeCell<libc::pthread_cond_t>,
    wait_lock: UnsafeCell<libc::pthread_mutex_t>,
    mode: UnsafeCell<TimerMode>,
    thread_id: libc::pthread_t,
}

// `mode` is only touched with `wait_lock` held.
unsafe impl Sync for VirtualTimer {}

impl VirtualTimer {
    /// Initialize the timer in place and start its host thread, disarmed.
    pub(crate) unsafe fn init(timer_ptr: *mut Self) {
        unsafe {
            let mut cond_attr = MaybeUninit::uninit();
            if libc::pthread_condattr_init(cond_attr.as_mut_ptr()) != 0
                || libc::pthread_condattr_setclock(cond_attr.as_mut_ptr(), SIM_CLOCK) != 0
                || libc::pthread_cond_init((*timer_ptr).wait.get(), cond_attr.as_ptr()) != 0
            {
                fatal!("failed to initialize the virtual timer condition");
            }
            libc::pthread_condattr_destroy(cond_attr.as_mut_ptr());

            (*timer_ptr).wait_lock = UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER);
            (*timer_ptr).mode = UnsafeCell::new(TimerMode::Disarmed);

            let mut attr = MaybeUninit::uninit();
            if libc::pthread_attr_init(attr.as_mut_ptr()) != 0
                || libc::pthread_create(
                    &raw mut (*timer_ptr).thread_id,
                    attr.as_ptr(),
                    timer_thread,
                    timer_ptr as *mut libc::c_void,
                ) != 0
            {
                fatal!("failed to start the virtual timer thread");
            }
            libc::pthread_attr_destroy(attr.as_mut_ptr());
        }
    }

    pub(crate) fn arm_periodic(&self, interval: Ticks) {
        if interval == 0 {
            fatal!("periodic tick interval must be nonzero");
        }
        self.set_mode(TimerMode::Periodic {
            deadline: clock_ticks() + interval,
            interval,
        });
    }

    pub(crate) fn arm_oneshot(&self, ticks: Ticks) {
        self.set_mode(TimerMode::OneShot {
            deadline: clock_ticks() + ticks,
        });
    }

    pub(crate) fn disarm(&self) {
        self.set_mode(TimerMode::Disarmed);
    }

    fn set_mode(&self, mode: TimerMode) {
        unsafe {
            if libc::pthread_mutex_lock(self.wait_lock.get()) != 0 {
                fatal!("failed to lock the virtual timer");
            }
            *self.mode.get() = mode;
            libc::pthread_cond_signal(self.wait.get());
            libc::pthread_mutex_unlock(self.wait_lock.get());
        }
    }

    /// Called with `wait_lock` held when the armed deadline has passed.
    unsafe fn expire(&self) {
        unsafe {
            match *self.mode.get() {
                TimerMode::Disarmed => return,
                TimerMode::OneShot { .. } => {
                    *self.mode.get() = TimerMode::Disarmed;
                }
                TimerMode::Periodic { deadline, interval } => {
                    *self.mode.get() = TimerMode::Periodic {
                        deadline: deadline + interval,
                        interval,
                    };
                }
            }
        }
        context::post_signal_to_current(TICK_SIGNAL);
    }
}

extern "C" fn timer_thread(arg: *mut libc::c_void) -> *mut libc::c_void {
    let timer = unsafe { &*(arg as *const VirtualTimer) };

    // The timer thread produces emulated interrupts; it never receives any.
    irq::set_thread_signal_mask(libc::SIG_BLOCK);

    unsafe {
        let name = c"roost-timer";
        libc::pthread_setname_np(libc::pthread_self(), name.as_ptr());

        if libc::pthread_mutex_lock(timer.wait_lock.get()) != 0 {
            fatal!("failed to lock the virtual timer");
        }

        loop {
            let deadline = match *timer.mode.get() {
                TimerMode::Disarmed => {
                    // Wait until a deadline is armed.
                    libc::pthread_cond_wait(timer.wait.get(), timer.wait_lock.get());
                    continue;
                }
                TimerMode::OneShot { deadline } => deadline,
                TimerMode::Periodic { deadline, .. } => deadline,
            };

            if clock_ticks() >= deadline {
                timer.expire();
                continue;
            }

            let until = ticks_to_timespec(deadline);
            if libc::pthread_cond_timedwait(timer.wait.get(), timer.wait_lock.get(), &until)
                == libc::ETIMEDOUT
            {
                timer.expire();
            }
            // Any other wakeup means the mode changed; re-read it.
        }
    }
}

/// Notifications that arrived while the process was suspended in the idle
/// wait, to be replayed in fixed order: tick first, switch after.
struct SuspendedSet {
    tick: bool,
    switch: bool,
}

/// Consume every already-pending emulated tick signal without blocking.
/// Their only effect, advancing the virtual clock, is subsumed by the
/// elapsed-time report after the wait.
fn drain_pending_ticks() {
    unsafe {
        let mut tick_set = MaybeUninit::uninit();
        if libc::sigemptyset(tick_set.as_mut_ptr()) != 0
            || libc::sigaddset(tick_set.as_mut_ptr(), TICK_SIGNAL) != 0
        {
            fatal!("failed to build the tick signal set");
        }
        let tick_set = tick_set.assume_init();

        loop {
            let mut pending = MaybeUninit::uninit();
            if libc::sigpending(pending.as_mut_ptr()) != 0 {
                fatal!("failed to query pending signals");
            }
            if libc::sigismember(pending.as_ptr(), TICK_SIGNAL) != 1 {
                break;
            }
            let mut sig: libc::c_int = 0;
            if libc::sigwait(&tick_set, &mut sig) != 0 {
                fatal!("failed to consume a pending tick signal");
            }
        }
    }
}

/// Block until at least one emulated interrupt signal arrives, then collect
/// everything else already pending into the suspended set.
fn wait_any(set: &libc::sigset_t) -> SuspendedSet {
    let mut sig: libc::c_int = 0;
    if unsafe { libc::sigwait(set, &mut sig) } != 0 {
        fatal!("failed to wait for emulated interrupts while idle");
    }

    let mut fired = SuspendedSet {
        tick: sig == TICK_SIGNAL,
        switch: sig == SWITCH_SIGNAL,
    };

    unsafe {
        let mut pending = MaybeUninit::uninit();
        if libc::sigpending(pending.as_mut_ptr()) != 0 {
            fatal!("failed to query pending signals");
        }
        let pending = pending.assume_init();
        for (signo, seen) in [
            (TICK_SIGNAL, &mut fired.tick),
            (SWITCH_SIGNAL, &mut fired.switch),
        ] {
            if !*seen && libc::sigismember(&pending, signo) == 1 {
                let mut single = MaybeUninit::uninit();
                if libc::sigemptyset(single.as_mut_ptr()) != 0
                    || libc::sigaddset(single.as_mut_ptr(), signo) != 0
                    || libc::sigwait(single.as_ptr(), &mut sig) != 0
                {
                    fatal!("failed to consume pending signal {}", signo);
                }
                *seen = true;
            }
        }
    }

    fired
}

/// Idle driver: sleep for at most `ticks` ticks (0 = until something
/// happens), advance the virtual clock by the observed elapsed time, then
/// replay the other notifications that accumulated during the sleep.
pub(crate) fn idle_wait(port: &SimPort, ticks: u32) {
    let restore_state = irq::Active::acquire();

    // The awaited signals must be blocked at the host level for sigwait;
    // under the cooperative strategy acquire() does not touch the mask.
    let set = irq::emulated_signal_set();
    let mut old_mask = MaybeUninit::uninit();
    if unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, old_mask.as_mut_ptr()) } != 0 {
        fatal!("failed to block emulated interrupts for idle");
    }

    // Retire the periodic tick source and any tick it already produced, so
    // a stale tick cannot cut the sleep short; the suppressed clock advance
    // is folded into the elapsed-time report below.
    port.timer().disarm();
    drain_pending_ticks();

    if ticks > 0 {
        port.timer().arm_oneshot(ticks as Ticks);
    }

    let fired = wait_any(&set);

    // The clock advance is applied before any other replayed notification,
    // so nothing ever observes a stale virtual clock.
    report_elapsed(port.scheduler());

    // Tickless idle is over; restore the regular cadence.
    port.timer().arm_periodic(1);

    let old_mask = unsafe { old_mask.assume_init() };
    if unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &old_mask, core::ptr::null_mut()) } != 0 {
        fatal!("failed to restore the idle signal mask");
    }

    if fired.switch {
        irq::Active::replay_switch(port);
    }

    irq::Active::restore(restore_state);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_conversion_floors_partial_ticks() {
        let time = libc::timespec {
            tv_sec: 2,
            tv_nsec: 1_999_999,
        };
        // 2s = 2000 ticks at 1kHz; 1.999ms floors to 1 tick.
        assert_eq!(timespec_to_ticks(time), 2001);
    }

    #[test]
    fn deadline_lands_on_exact_tick_boundary() {
        let time = ticks_to_timespec(5_123);
        assert_eq!(time.tv_sec, 5);
        assert_eq!(time.tv_nsec, 123_000_000);
        assert_eq!(timespec_to_ticks(time), 5_123);
    }
}

//! Host stub port
//!
//! Mirrors the Cortex-M port surface so the kernel state machine runs
//! under host unit tests: execution is always privileged thread mode,
//! masking is a depth counter, and context-switch requests are recorded
//! for the test to act on by calling the switch entry points itself.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::kernel::config;
use crate::kernel::error::AlarmReason;

static TICK_RATE_HZ: AtomicU32 = AtomicU32::new(config::INIT_TICK_RATE_HZ);
static CPU_FREQ_HZ: AtomicU32 = AtomicU32::new(config::DEFAULT_CPU_FREQ_HZ);
static MASK_DEPTH: AtomicU32 = AtomicU32::new(0);
static SWITCH_REQUESTED: AtomicBool = AtomicBool::new(false);
static CYCLES: AtomicU32 = AtomicU32::new(0);

pub fn tick_rate() -> u32 {
    TICK_RATE_HZ.load(Ordering::Relaxed)
}

pub fn set_cpu_freq(hz: u32) {
    CPU_FREQ_HZ.store(hz, Ordering::Relaxed);
}

pub fn cpu_freq() -> u32 {
    CPU_FREQ_HZ.load(Ordering::Relaxed)
}

pub fn disable_irq() -> u32 {
    MASK_DEPTH.fetch_add(1, Ordering::SeqCst)
}

pub fn enable_irq(mask: u32) {
    MASK_DEPTH.store(mask, Ordering::SeqCst);
}

pub fn is_in_interrupt() -> bool {
    false
}

pub fn cur_irq_num() -> i32 {
    -16
}

pub fn is_in_syscall() -> bool {
    false
}

pub fn is_in_privileged() -> bool {
    true
}

#[inline]
pub fn is_in_priv_or_irq() -> bool {
    true
}

pub fn is_in_msp_mode() -> bool {
    true
}

pub fn is_syscall_allowed() -> bool {
    true
}

pub fn request_context_switch() {
    SWITCH_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn internal_switch_context() {
    SWITCH_REQUESTED.store(true, Ordering::SeqCst);
}

/// Whether a deferred switch was requested since the last call; clears the
/// flag. Host tests poll this and then drive `macs_switch_context`.
pub fn take_switch_request() -> bool {
    SWITCH_REQUESTED.swap(false, Ordering::SeqCst)
}

pub fn set_thread_privileged(_on: bool) {}

/// No-op on the host: `start` returns and the test drives the scheduler
/// through the switch entry points.
pub fn first_switch_to(_top: *mut u32, _privileged: bool) {}

pub fn init_scheduler() -> bool {
    set_tick_rate(TICK_RATE_HZ.load(Ordering::Relaxed))
}

pub fn set_tick_rate(rate_hz: u32) -> bool {
    if rate_hz == 0 || cpu_freq() / rate_hz <= 1 {
        return false;
    }
    if cpu_freq() / rate_hz - 1 > 0x00FF_FFFF {
        return false;
    }
    TICK_RATE_HZ.store(rate_hz, Ordering::Relaxed);
    true
}

/// Monotonic stand-in for the cycle counter.
pub fn cycle_count() -> u32 {
    CYCLES.fetch_add(21, Ordering::Relaxed)
}

pub fn crash(reason: AlarmReason) -> ! {
    panic!("kernel crash: {:?}", reason);
}

pub fn idle_wait() {}

pub fn irq_dispatch() {
    crate::kernel::sched::proceed_irq(cur_irq_num());
}

pub fn svc_call(op: usize, a0: usize, a1: usize, a2: usize) -> isize {
    crate::kernel::syscall::macs_svc_dispatch(op, a0, a1, a2)
}

#[cfg(feature = "mpu")]
pub fn mpu_init() {}

#[cfg(feature = "mpu")]
pub fn mpu_set_main_mine(_bottom: usize) {}

#[cfg(feature = "mpu")]
pub fn mpu_set_proc_mine(_margin: usize) {}

#[cfg(feature = "mpu")]
pub fn mpu_remove_proc_mine() {}

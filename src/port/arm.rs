//! Cortex-M port
//!
//! Context switching runs through the PendSV exception, privileged entry
//! through SVC, and kernel time through SysTick. On ARMv7-M the critical
//! section masks with BASEPRI at the syscall ceiling; ARMv6-M cores have no
//! BASEPRI and fall back to PRIMASK. The interrupt priority layout assumes
//! 4 implemented priority bits on ARMv7-M and 2 on ARMv6-M.

#![allow(named_asm_labels)]

use core::arch::{asm, naked_asm};
use core::sync::atomic::{AtomicU32, Ordering};

use cortex_m::peripheral::scb::SystemHandler;
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;

use crate::kernel::config;
use crate::kernel::error::AlarmReason;
use crate::kernel::stack::SW_FRAME_WORDS;

static TICK_RATE_HZ: AtomicU32 = AtomicU32::new(config::INIT_TICK_RATE_HZ);
static CPU_FREQ_HZ: AtomicU32 = AtomicU32::new(config::DEFAULT_CPU_FREQ_HZ);

/// Exceptions below this number cannot have their priority lowered and
/// never qualify for kernel calls.
const FIRST_USER_INTERRUPT: u32 = 16;

/// SVC exception number in IPSR.
const SVCALL_EXCEPTION: u32 = 11;

/// Current tick rate in Hz.
pub fn tick_rate() -> u32 {
    TICK_RATE_HZ.load(Ordering::Relaxed)
}

/// Report the real core clock, normally from board init.
pub fn set_cpu_freq(hz: u32) {
    CPU_FREQ_HZ.store(hz, Ordering::Relaxed);
}

pub fn cpu_freq() -> u32 {
    CPU_FREQ_HZ.load(Ordering::Relaxed)
}

// ---- interrupt masking ----

#[cfg(not(armv6m))]
const DISABLE_INTERRUPTS_MASK: u32 = (config::MAX_SYSCALL_INTERRUPT_PRIORITY as u32) << 4;

/// Mask interrupts at or below the syscall ceiling; returns the previous
/// mask for nesting.
#[cfg(not(armv6m))]
pub fn disable_irq() -> u32 {
    let prev: u32;
    unsafe {
        asm!("mrs {}, BASEPRI", out(reg) prev, options(nomem, nostack, preserves_flags));
        asm!("msr BASEPRI, {}", in(reg) DISABLE_INTERRUPTS_MASK, options(nomem, nostack, preserves_flags));
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
    prev
}

#[cfg(not(armv6m))]
pub fn enable_irq(mask: u32) {
    unsafe {
        asm!("msr BASEPRI, {}", in(reg) mask, options(nomem, nostack, preserves_flags));
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// ARMv6-M fallback: PRIMASK masks everything.
#[cfg(armv6m)]
pub fn disable_irq() -> u32 {
    let prev: u32;
    unsafe {
        asm!("mrs {}, PRIMASK", out(reg) prev, options(nomem, nostack, preserves_flags));
        asm!("cpsid i", options(nomem, nostack, preserves_flags));
    }
    prev
}

#[cfg(armv6m)]
pub fn enable_irq(mask: u32) {
    unsafe {
        asm!("msr PRIMASK, {}", in(reg) mask, options(nomem, nostack, preserves_flags));
    }
}

// ---- execution-context classification ----

#[inline]
fn ipsr() -> u32 {
    let ipsr: u32;
    unsafe {
        asm!("mrs {}, IPSR", out(reg) ipsr, options(nomem, nostack, preserves_flags));
    }
    ipsr & 0x1FF
}

/// Whether an exception handler is executing. An SVC in progress counts.
pub fn is_in_interrupt() -> bool {
    ipsr() != 0
}

/// Active IRQ number, CMSIS style: outside interrupts this is -16.
pub fn cur_irq_num() -> i32 {
    ipsr() as i32 - FIRST_USER_INTERRUPT as i32
}

pub fn is_in_syscall() -> bool {
    ipsr() == SVCALL_EXCEPTION
}

pub fn is_in_privileged() -> bool {
    cortex_m::register::control::read().npriv().is_privileged()
}

#[inline]
pub fn is_in_priv_or_irq() -> bool {
    is_in_privileged() || is_in_interrupt()
}

pub fn is_in_msp_mode() -> bool {
    cortex_m::register::control::read().spsel().is_msp()
}

/// Whether kernel calls are permitted right now: thread mode, the SVC
/// handler, or an IRQ whose priority lies at or below the syscall ceiling.
pub fn is_syscall_allowed() -> bool {
    let exc = ipsr();
    if exc == 0 || exc == SVCALL_EXCEPTION {
        return true;
    }
    // Reset, NMI and HardFault have fixed priorities above the ceiling.
    if exc <= 3 {
        return false;
    }
    exception_priority(exc) as u32 >= config::MAX_SYSCALL_INTERRUPT_PRIORITY as u32
}

#[cfg(not(armv6m))]
fn exception_priority(exc: u32) -> u8 {
    unsafe {
        if exc >= FIRST_USER_INTERRUPT {
            let irq = (exc - FIRST_USER_INTERRUPT) as usize;
            (*cortex_m::peripheral::NVIC::PTR).ipr[irq].read() >> 4
        } else {
            (*SCB::PTR).shpr[exc as usize - 4].read() >> 4
        }
    }
}

#[cfg(armv6m)]
fn exception_priority(exc: u32) -> u8 {
    unsafe {
        if exc >= FIRST_USER_INTERRUPT {
            let irq = (exc - FIRST_USER_INTERRUPT) as usize;
            let word = (*cortex_m::peripheral::NVIC::PTR).ipr[irq / 4].read();
            ((word >> ((irq % 4) * 8 + 6)) & 0x3) as u8
        } else if exc >= 8 {
            let idx = exc as usize - 8;
            let word = (*SCB::PTR).shpr[idx / 4].read();
            ((word >> ((idx % 4) * 8 + 6)) & 0x3) as u8
        } else {
            0
        }
    }
}

// ---- context switching ----

/// Arm the deferred context switch; it fires once every critical section
/// and exception above PendSV's priority unwinds.
pub fn request_context_switch() {
    SCB::set_pendsv();
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Switch used when the current task just deleted itself; its stack must
/// not be reused, so the switch goes out immediately after the enclosing
/// critical section.
pub fn internal_switch_context() {
    request_context_switch();
}

/// Set the privilege level thread mode returns to.
pub fn set_thread_privileged(on: bool) {
    unsafe {
        let mut ctrl: u32;
        asm!("mrs {}, CONTROL", out(reg) ctrl, options(nomem, nostack, preserves_flags));
        if on {
            ctrl &= !0x1;
        } else {
            ctrl |= 0x1;
        }
        asm!("msr CONTROL, {}", in(reg) ctrl, options(nomem, nostack, preserves_flags));
    }
    cortex_m::asm::isb();
}

/// One-shot entry from the main stack into the first task's frame: point
/// PSP at the hardware part of the prepared frame, drop privilege if asked
/// to, and return through SVC into the task.
pub fn first_switch_to(top: *mut u32, privileged: bool) {
    unsafe {
        let psp = top.add(SW_FRAME_WORDS);
        asm!("msr psp, {}", in(reg) psp, options(nomem, nostack, preserves_flags));
        set_thread_privileged(privileged);
        asm!("svc 0", options(noreturn));
    }
}

// ---- timers ----

/// PendSV and SysTick run at the minimum priority so a switch never nests
/// inside another kernel exception. Enables the cycle counter where the
/// core has one, then programs the tick.
pub fn init_scheduler() -> bool {
    unsafe {
        let mut p = cortex_m::Peripherals::steal();
        p.SCB.set_priority(SystemHandler::PendSV, 0xFF);
        p.SCB.set_priority(SystemHandler::SysTick, 0xFF);
        #[cfg(not(armv6m))]
        {
            p.DCB.enable_trace();
            p.DWT.enable_cycle_counter();
        }
    }
    set_tick_rate(TICK_RATE_HZ.load(Ordering::Relaxed))
}

/// Program the SysTick reload for `rate_hz`. False when the rate is not
/// representable in the 24-bit reload.
pub fn set_tick_rate(rate_hz: u32) -> bool {
    if rate_hz == 0 {
        return false;
    }
    let clk = cpu_freq();
    if clk / rate_hz <= 1 {
        return false;
    }
    let reload = clk / rate_hz - 1;
    if reload > 0x00FF_FFFF {
        return false;
    }

    let mut syst = unsafe { cortex_m::Peripherals::steal().SYST };
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_interrupt();
    syst.enable_counter();

    TICK_RATE_HZ.store(rate_hz, Ordering::Relaxed);
    true
}

/// Free-running cycle counter; 0 on cores without DWT.
pub fn cycle_count() -> u32 {
    #[cfg(not(armv6m))]
    unsafe {
        (*cortex_m::peripheral::DWT::PTR).cyccnt.read()
    }
    #[cfg(armv6m)]
    0
}

pub fn crash(_reason: AlarmReason) -> ! {
    loop {
        cortex_m::asm::udf();
    }
}

/// Low-power wait used by the idle task.
pub fn idle_wait() {
    cortex_m::asm::dsb();
    cortex_m::asm::wfi();
}

/// Forward the active interrupt to the scheduler's IRQ tasks. Board code
/// calls this from interrupt handlers served by IRQ tasks.
pub fn irq_dispatch() {
    crate::kernel::sched::proceed_irq(cur_irq_num());
}

// ---- supervisor call ----

/// Trap into the privileged dispatch with an operation selector and up to
/// three argument words.
pub fn svc_call(op: usize, a0: usize, a1: usize, a2: usize) -> isize {
    let ret: isize;
    unsafe {
        asm!(
            "svc 1",
            inlateout("r0") op => ret,
            in("r1") a0,
            in("r2") a1,
            in("r3") a2,
        );
    }
    ret
}

// ---- MPU stack mines ----

#[cfg(all(feature = "mpu", not(armv6m)))]
mod mpu {
    use cortex_m::peripheral::MPU;

    const REGION_ZERO_ADDR: u32 = 1;
    const REGION_PROC_STACK: u32 = 2;
    const REGION_MAIN_STACK: u32 = 3;

    const RASR_XN: u32 = 1 << 28;
    const RASR_AP_FULL: u32 = 0x3 << 24;
    const RASR_AP_NONE: u32 = 0x0 << 24;
    const RASR_SIZE_4G: u32 = 0x1F << 1;
    const RASR_SIZE_32B: u32 = 0x4 << 1;
    const RASR_ENABLE: u32 = 1;

    // Top of the main stack, provided by the runtime's linker script.
    extern "C" {
        static _stack_start: u32;
    }

    fn is_present() -> bool {
        unsafe { (*MPU::PTR)._type.read() >> 8 } & 0xFF != 0
    }

    unsafe fn set_region(rnum: u32, rbar: u32, rasr: u32) {
        unsafe {
            (*MPU::PTR).rnr.write(rnum);
            (*MPU::PTR).rbar.write(rbar);
            (*MPU::PTR).rasr.write(rasr);
        }
        cortex_m::asm::dsb();
    }

    /// Background full-access region, the null-page mine, the main-stack
    /// mine below the scheduler's own stack, MemManage fault enable and
    /// MPU enable.
    pub fn mpu_init() {
        if !is_present() {
            return;
        }
        unsafe {
            set_region(0, 0, RASR_AP_FULL | RASR_SIZE_4G | RASR_ENABLE);
            set_region(
                REGION_ZERO_ADDR,
                0,
                RASR_XN | RASR_AP_NONE | RASR_SIZE_32B | RASR_ENABLE,
            );
        }

        let main_top = unsafe { &raw const _stack_start } as usize;
        mpu_set_main_mine(main_top - crate::kernel::config::MAIN_STACK_SIZE * 4);

        unsafe {
            (*cortex_m::peripheral::SCB::PTR).shcsr.modify(|v| v | (1 << 16));
            (*MPU::PTR).ctrl.write(1);
        }
    }

    /// Minimum-size no-access region just below the scheduler's main
    /// stack. `bottom` is the lowest address of the main stack.
    pub fn mpu_set_main_mine(bottom: usize) {
        if !is_present() {
            return;
        }
        let adr = (bottom as u32 & !0x1F).wrapping_sub(0x20);
        unsafe {
            set_region(
                REGION_MAIN_STACK,
                adr,
                RASR_XN | RASR_AP_NONE | RASR_SIZE_32B | RASR_ENABLE,
            );
        }
    }

    /// Move the process-stack mine just below the incoming task's margin.
    /// Runs on every context switch.
    pub fn mpu_set_proc_mine(margin: usize) {
        if !is_present() {
            return;
        }
        let adr = (margin as u32 & !0x1F).wrapping_sub(0x20);
        unsafe {
            set_region(
                REGION_PROC_STACK,
                adr,
                RASR_XN | RASR_AP_NONE | RASR_SIZE_32B | RASR_ENABLE,
            );
        }
    }

    pub fn mpu_remove_proc_mine() {
        if !is_present() {
            return;
        }
        unsafe {
            set_region(REGION_PROC_STACK, 0, 0);
        }
    }
}

#[cfg(all(feature = "mpu", not(armv6m)))]
pub use mpu::{mpu_init, mpu_remove_proc_mine, mpu_set_main_mine, mpu_set_proc_mine};

#[cfg(all(feature = "mpu", armv6m))]
mod mpu {
    pub fn mpu_init() {}
    pub fn mpu_set_main_mine(_bottom: usize) {}
    pub fn mpu_set_proc_mine(_margin: usize) {}
    pub fn mpu_remove_proc_mine() {}
}

#[cfg(all(feature = "mpu", armv6m))]
pub use mpu::{mpu_init, mpu_remove_proc_mine, mpu_set_main_mine, mpu_set_proc_mine};

// ---- exception handlers ----

#[no_mangle]
pub extern "C" fn SysTick() {
    if crate::kernel::sched::macs_tick_handler() {
        request_context_switch();
    }
}

/// Context-switch trampoline: bank the outgoing task's callee-saved
/// registers and EXC_RETURN on its stack, let the scheduler pick the next
/// task, then restore from the incoming frame.
#[cfg(not(armv6m))]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11, lr}}",
        "bl {switch}",
        "ldmia r0!, {{r4-r11, lr}}",
        "msr psp, r0",
        "bx lr",
        switch = sym crate::kernel::sched::macs_switch_context,
    );
}

#[cfg(armv6m)]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "subs r0, r0, #36",
        "mov r2, r0",
        "stmia r0!, {{r4-r7}}",
        "mov r4, r8",
        "mov r5, r9",
        "mov r6, r10",
        "mov r7, r11",
        "stmia r0!, {{r4-r7}}",
        "mov r4, lr",
        "stmia r0!, {{r4}}",
        "mov r0, r2",
        "bl {switch}",
        "mov r2, r0",
        "adds r0, r0, #16",
        "ldmia r0!, {{r4-r7}}",
        "mov r8, r4",
        "mov r9, r5",
        "mov r10, r6",
        "mov r11, r7",
        "ldmia r0!, {{r4}}",
        "mov lr, r4",
        "msr psp, r0",
        "mov r0, r2",
        "ldmia r0!, {{r4-r7}}",
        "bx lr",
        switch = sym crate::kernel::sched::macs_switch_context,
    );
}

/// SVC entry. Number 0 is the scheduler's first dispatch: the prepared
/// task frame already sits at PSP, so a bare thread-mode return lands in
/// the task. Number 1 carries a privileged operation: the selector and
/// three arguments travel in the stacked r0-r3, the result goes back
/// through stacked r0.
#[cfg(not(armv6m))]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "tst lr, #4",
        "ite eq",
        "mrseq r0, msp",
        "mrsne r0, psp",
        "ldr r1, [r0, #24]",
        "ldrb r2, [r1, #-2]",
        "cbnz r2, 2f",
        "mvn lr, #2",
        "bx lr",
        "2:",
        "push {{r4, lr}}",
        "mov r4, r0",
        "ldm r4, {{r0-r3}}",
        "bl {dispatch}",
        "str r0, [r4]",
        "pop {{r4, pc}}",
        dispatch = sym crate::kernel::syscall::macs_svc_dispatch,
    );
}

#[cfg(armv6m)]
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn SVCall() {
    naked_asm!(
        "mov r0, lr",
        "movs r1, #4",
        "tst r0, r1",
        "bne 1f",
        "mrs r0, msp",
        "b 2f",
        "1:",
        "mrs r0, psp",
        "2:",
        "ldr r1, [r0, #24]",
        "subs r1, r1, #2",
        "ldrb r2, [r1]",
        "cmp r2, #0",
        "bne 3f",
        "movs r0, #2",
        "mvns r0, r0",
        "mov lr, r0",
        "bx lr",
        "3:",
        "push {{r4, lr}}",
        "mov r4, r0",
        "ldmia r4!, {{r0-r3}}",
        "subs r4, r4, #16",
        "bl {dispatch}",
        "str r0, [r4]",
        "pop {{r4, pc}}",
        dispatch = sym crate::kernel::syscall::macs_svc_dispatch,
    );
}

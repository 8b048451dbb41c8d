//! MACS real-time multitasking kernel
//!
//! A small kernel for ARM Cortex-M class microcontrollers providing:
//! - Preemptive and cooperative scheduling of fixed-priority tasks
//! - Mutexes with priority inheritance, counting semaphores,
//!   broadcast/unicast events and bounded message queues
//! - Tick-based time services and wall-clock accounting
//! - Interrupt dispatch through dedicated IRQ-handler tasks
//! - SVC-gated privileged entry and MPU-assisted stack protection

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

// ============ Critical Section ============

#[cfg(target_arch = "arm")]
mod cs_impl {
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct KernelCriticalSection;
    set_impl!(KernelCriticalSection);

    unsafe impl Impl for KernelCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = cortex_m::register::primask::read().is_active();
            cortex_m::interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { cortex_m::interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod kernel;
pub mod port;
pub mod sync;

// ============ Re-exports ============

pub use kernel::clock;
pub use kernel::config;
pub use kernel::critical::{critical_section, CriticalSection};
pub use kernel::error::{
    set_alarm_handler, AlarmAction, AlarmHandler, AlarmReason, Error, MacsResult,
};
pub use kernel::sched;
pub use kernel::sched::{initialize, start, PauseSection};
pub use kernel::stack::{ENOUGH_STACK_SIZE, MIN_STACK_SIZE, SMALL_STACK_SIZE};
pub use kernel::task;
pub use kernel::task::{Task, TaskFn, TaskIrq};
pub use kernel::types;
pub use kernel::types::{priority, Mode, Priority, State, Tick, UnblockReason, INFINITE_TIMEOUT};

pub use sync::{Event, MessageQueue, Mutex, MutexGuard, Semaphore};

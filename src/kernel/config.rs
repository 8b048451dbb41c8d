//! Compile-time configuration of the kernel
//!
//! These constants bound kernel resources and tune scheduling behavior.

/// Initial SysTick frequency in Hz. The system time quantum is
/// `1.0 / INIT_TICK_RATE_HZ` seconds.
pub const INIT_TICK_RATE_HZ: u32 = 1000;

/// CPU core frequency assumed until the board init reports the real one.
pub const DEFAULT_CPU_FREQ_HZ: u32 = 16_000_000;

/// Upper bound on a task stack, in words.
pub const MAX_STACK_SIZE: usize = 0x800;

/// Size of the scheduler's own (main) stack in words, used to place the
/// main-stack guard region.
pub const MAIN_STACK_SIZE: usize = 1000;

/// Highest interrupt priority (lowest numeric value) from which kernel
/// calls are permitted.
pub const MAX_SYSCALL_INTERRUPT_PRIORITY: u8 = 5;

/// Stack size of the built-in idle task, in words.
pub const IDLE_STACK_SIZE: usize = 160;

//! Platform abstraction
//!
//! Cortex-M facts the kernel relies on: interrupt masking at the syscall
//! ceiling, the PendSV-driven context switch, SVC-gated privileged entry,
//! SysTick programming, MPU region setup and cycle-counter access. The
//! contract is the same across M0/M1/M3/M4; cores without BASEPRI fall
//! back to a coarser PRIMASK mask.
//!
//! Non-ARM builds get a stub with the same surface so the kernel state
//! machine runs under host unit tests.

#[cfg(target_arch = "arm")]
mod arm;

#[cfg(target_arch = "arm")]
pub use arm::*;

#[cfg(not(target_arch = "arm"))]
mod stub;

#[cfg(not(target_arch = "arm"))]
pub use stub::*;

//! Critical sections
//!
//! A critical section masks interrupts at or above the syscall ceiling. The
//! previous mask is saved on entry and restored on exit, so sections nest.

use crate::kernel::error::{alarm, AlarmReason};
use crate::port;

/// RAII guard for a kernel critical section.
///
/// Creating the guard masks interrupts up to the configured ceiling;
/// dropping it restores the mask that was in effect before, so only the
/// outermost guard actually re-enables interrupts.
pub struct CriticalSection {
    prev_mask: u32,
}

impl CriticalSection {
    /// Enter a critical section.
    #[inline(always)]
    pub fn enter() -> Self {
        if !port::is_in_priv_or_irq() {
            alarm(AlarmReason::NotInPrivileged);
        }
        CriticalSection {
            prev_mask: port::disable_irq(),
        }
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        port::enable_irq(self.prev_mask);
    }
}

/// Execute a closure inside a critical section.
///
/// The closure receives the guard, which doubles as the access token for
/// [`CsCell`](crate::kernel::cs_cell::CsCell) protected data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

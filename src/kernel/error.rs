//! Error types and diagnostic alarms
//!
//! Recoverable conditions are surfaced through [`MacsResult`]. Programmer
//! errors and hardware faults go through the process-wide alarm hook, which
//! by default halts the system.

use crate::kernel::critical::critical_section;
use crate::kernel::cs_cell::CsCell;

/// Kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum Error {
    /// A wait exceeded the specified duration.
    Timeout = 1,
    /// The operation is forbidden from any interrupt handler.
    InterruptNotSupported = 2,
    /// The operation is allowed from an IRQ only when the IRQ priority lies
    /// at or below the syscall ceiling.
    SysCallNotAllowed = 3,
    /// The operation is unsupported on this build.
    NotSupported = 4,
    /// Null pointer, out-of-range priority, bad stack size.
    InvalidArgs = 5,
    /// Pre- or postcondition violated: scheduler not started, deleting an
    /// inactive task, unlocking a mutex not owned, signaling a full
    /// semaphore, recursively locking a non-recursive mutex.
    InvalidState = 6,
}

/// Result type alias for kernel operations.
pub type MacsResult<T = ()> = Result<T, Error>;

/// Encode a result for the SVC boundary: 0 is success, negative values
/// carry the error discriminant.
pub(crate) fn result_to_code(res: MacsResult) -> isize {
    match res {
        Ok(()) => 0,
        Err(e) => -(e as isize),
    }
}

/// Decode an SVC return value back into a result.
pub(crate) fn code_to_result(code: isize) -> MacsResult {
    match -code {
        0 => Ok(()),
        1 => Err(Error::Timeout),
        2 => Err(Error::InterruptNotSupported),
        3 => Err(Error::SysCallNotAllowed),
        4 => Err(Error::NotSupported),
        5 => Err(Error::InvalidArgs),
        _ => Err(Error::InvalidState),
    }
}

/// Causes of exceptional situations fed to the alarm hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmReason {
    /// Hard Fault exception raised.
    HardFault,
    /// Memory access fault (MemManage exception).
    MemoryFault,
    /// Privileged operation attempted in unprivileged mode.
    NotInPrivileged,
    /// SVC issued with an out-of-range service number.
    BadSvcNumber,
    /// A kernel counter overflowed.
    CounterOverflow,
    /// The marker at the stack margin was overwritten.
    StackCorrupted,
    /// A task stack overflowed.
    StackOverflow,
    /// The saved stack pointer left the bottom of the stack region.
    StackUnderflow,
    /// Resume requested while the scheduler was not paused.
    SchedNotOnPause,
    /// The memory manager re-entrancy flag was already set.
    MemLocked,
    /// An internal consistency check failed.
    AssertFailed,
    /// A task stack had to be enlarged (informational).
    StackEnlarged,
    /// The heap is exhausted.
    OutOfMemory,
    /// A non-recursive mutex was locked again by its owner.
    NestedMutexLock,
    /// A mutex owned by a task was destroyed.
    OwnedMutexDestroyed,
    /// A mutex with blocked waiters was destroyed.
    BlockingMutexDestroyed,
}

/// What to do after an alarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmAction {
    /// Keep executing the current task.
    Continue,
    /// Re-prepare the offending task's stack and run it from the start.
    RestartTask,
    /// Remove the offending task from the scheduler.
    KillTask,
    /// Halt the system.
    Crash,
}

/// Process-wide alarm handler signature.
pub type AlarmHandler = fn(AlarmReason) -> AlarmAction;

static ALARM_HANDLER: CsCell<Option<AlarmHandler>> = CsCell::new(None);

/// Install (or clear) the process-wide alarm handler.
pub fn set_alarm_handler(handler: Option<AlarmHandler>) {
    critical_section(|cs| {
        *ALARM_HANDLER.get(cs) = handler;
    });
}

/// Raise a diagnostic alarm.
///
/// Returns the action chosen by the installed handler. With no handler the
/// default policy applies: [`AlarmReason::StackEnlarged`] continues, every
/// other reason halts. A `Crash` action never returns.
pub(crate) fn alarm(reason: AlarmReason) -> AlarmAction {
    crate::error!("alarm: {}", reason as u8);

    let handler = unsafe { *ALARM_HANDLER.get_unchecked() };
    let action = match handler {
        Some(h) => h(reason),
        None => match reason {
            AlarmReason::StackEnlarged => AlarmAction::Continue,
            _ => AlarmAction::Crash,
        },
    };

    if action == AlarmAction::Crash {
        crate::port::crash(reason);
    }
    action
}

//! System-call gate
//!
//! Operations that must run privileged are routed through a supervisor trap
//! when the caller is unprivileged, and called directly when the caller is
//! already privileged or in an IRQ. The trap carries an operation selector
//! from the closed [`SvcOp`] set plus up to three argument words; the
//! handler indexes the dispatch table below.

use core::ptr::NonNull;

use crate::kernel::error::{
    alarm, code_to_result, result_to_code, AlarmReason, Error, MacsResult,
};
use crate::kernel::sched;
use crate::kernel::task::{Task, TaskIrq};
use crate::port;
use crate::sync::event::EventInner;
use crate::sync::mutex::MutexInner;
use crate::sync::semaphore::SemInner;

/// Operations reachable through the supervisor trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SvcOp {
    ReadCpuTick = 0,
    BlockCurrentTask,
    AddTask,
    AddTaskIrq,
    Yield,
    DeleteTask,
    UnblockTask,
    SetTaskPriority,
    EventRaise,
    EventWait,
    MutexLock,
    MutexUnlock,
    SemaphoreWait,
    SemaphoreSignal,
}

const SVC_OP_COUNT: usize = SvcOp::SemaphoreSignal as usize + 1;

type SvcFn = fn(usize, usize, usize) -> isize;

static SVC_TABLE: [SvcFn; SVC_OP_COUNT] = [
    svc_read_cpu_tick,
    svc_block_current_task,
    svc_add_task,
    svc_add_task_irq,
    svc_yield,
    svc_delete_task,
    svc_unblock_task,
    svc_set_task_priority,
    svc_event_raise,
    svc_event_wait,
    svc_mutex_lock,
    svc_mutex_unlock,
    svc_semaphore_wait,
    svc_semaphore_signal,
];

/// Privileged dispatch entry, reached from the SVC handler or directly
/// when the caller is already privileged.
#[no_mangle]
pub extern "C" fn macs_svc_dispatch(op: usize, a0: usize, a1: usize, a2: usize) -> isize {
    if op >= SVC_OP_COUNT {
        alarm(AlarmReason::BadSvcNumber);
        return result_to_code(Err(Error::NotSupported));
    }
    SVC_TABLE[op](a0, a1, a2)
}

#[inline]
pub(crate) fn invoke(op: SvcOp, a0: usize, a1: usize, a2: usize) -> isize {
    if port::is_in_priv_or_irq() {
        macs_svc_dispatch(op as usize, a0, a1, a2)
    } else {
        port::svc_call(op as usize, a0, a1, a2)
    }
}

#[inline]
pub(crate) fn invoke_result(op: SvcOp, a0: usize, a1: usize, a2: usize) -> MacsResult {
    code_to_result(invoke(op, a0, a1, a2))
}

pub(crate) fn read_cpu_tick() -> u32 {
    invoke(SvcOp::ReadCpuTick, 0, 0, 0) as u32
}

fn task_arg(a: usize) -> Result<NonNull<Task>, Error> {
    NonNull::new(a as *mut Task).ok_or(Error::InvalidArgs)
}

fn svc_read_cpu_tick(_: usize, _: usize, _: usize) -> isize {
    port::cycle_count() as isize
}

fn svc_block_current_task(timeout_ms: usize, _: usize, _: usize) -> isize {
    result_to_code(sched::block_current_task_priv(timeout_ms as u32, None))
}

fn svc_add_task(task: usize, _: usize, _: usize) -> isize {
    result_to_code(task_arg(task).and_then(sched::add_task_priv))
}

fn svc_add_task_irq(task: usize, _: usize, _: usize) -> isize {
    result_to_code(
        NonNull::new(task as *mut TaskIrq)
            .ok_or(Error::InvalidArgs)
            .and_then(sched::add_task_irq_priv),
    )
}

fn svc_yield(_: usize, _: usize, _: usize) -> isize {
    sched::yield_priv();
    0
}

fn svc_delete_task(task: usize, _: usize, _: usize) -> isize {
    result_to_code(task_arg(task).and_then(sched::delete_task_priv))
}

fn svc_unblock_task(task: usize, _: usize, _: usize) -> isize {
    result_to_code(task_arg(task).and_then(sched::unblock_task_priv))
}

fn svc_set_task_priority(task: usize, prio: usize, _: usize) -> isize {
    result_to_code(
        task_arg(task).and_then(|t| sched::set_task_priority_priv(t, prio as u8, false)),
    )
}

fn svc_event_raise(event: usize, _: usize, _: usize) -> isize {
    let event = unsafe { &mut *(event as *mut EventInner) };
    result_to_code(event.raise_priv())
}

fn svc_event_wait(event: usize, timeout_ms: usize, _: usize) -> isize {
    let event = unsafe { &mut *(event as *mut EventInner) };
    result_to_code(event.wait_priv(timeout_ms as u32))
}

fn svc_mutex_lock(mutex: usize, timeout_ms: usize, _: usize) -> isize {
    let mutex = unsafe { &mut *(mutex as *mut MutexInner) };
    result_to_code(mutex.lock_priv(timeout_ms as u32))
}

fn svc_mutex_unlock(mutex: usize, _: usize, _: usize) -> isize {
    let mutex = unsafe { &mut *(mutex as *mut MutexInner) };
    result_to_code(mutex.unlock_priv())
}

fn svc_semaphore_wait(sem: usize, timeout_ms: usize, _: usize) -> isize {
    let sem = unsafe { &mut *(sem as *mut SemInner) };
    result_to_code(sem.wait_priv(timeout_ms as u32))
}

fn svc_semaphore_signal(sem: usize, _: usize, _: usize) -> isize {
    let sem = unsafe { &mut *(sem as *mut SemInner) };
    result_to_code(sem.signal_priv())
}

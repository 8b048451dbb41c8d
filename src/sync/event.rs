//! Events
//!
//! An event blocks tasks until some condition is announced with `raise`.
//! Events carry no sticky state: a raise with nobody waiting is lost.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::kernel::critical::CriticalSection;
use crate::kernel::error::{Error, MacsResult};
use crate::kernel::sched;
use crate::kernel::syscall::{self, SvcOp};
use crate::kernel::task::Task;
use crate::kernel::types::UnblockReason;
use crate::port;
use crate::sync::{finish_blocking_op, UnblockFunctor, WaitQueue};

pub(crate) struct EventInner {
    broadcast: bool,
    waiters: WaitQueue,
}

impl EventInner {
    fn functor(&mut self) -> NonNull<dyn UnblockFunctor> {
        unsafe { NonNull::new_unchecked(self as *mut Self as *mut dyn UnblockFunctor) }
    }

    pub(crate) fn raise_priv(&mut self) -> MacsResult {
        let _cs = CriticalSection::enter();

        while self.waiters.is_holding() {
            self.waiters.unblock_one()?;
            if !self.broadcast {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn wait_priv(&mut self, timeout_ms: u32) -> MacsResult {
        let _cs = CriticalSection::enter();

        if timeout_ms == 0 {
            return Err(Error::Timeout);
        }
        let functor = self.functor();
        self.waiters.block_current(functor, timeout_ms)
    }
}

impl UnblockFunctor for EventInner {
    fn on_unblock_task(&mut self, task: NonNull<Task>, reason: UnblockReason) {
        if reason == UnblockReason::Timeout {
            self.waiters.remove(task);
        }
    }

    fn on_delete_task(&mut self, task: NonNull<Task>) {
        self.waiters.remove(task);
    }
}

/// Broadcast or unicast event.
pub struct Event {
    inner: UnsafeCell<EventInner>,
}

unsafe impl Send for Event {}
unsafe impl Sync for Event {}

impl Event {
    /// Create an event. A broadcast event wakes every waiter per raise, a
    /// unicast one only the highest-priority waiter.
    pub const fn new(broadcast: bool) -> Self {
        Self {
            inner: UnsafeCell::new(EventInner {
                broadcast,
                waiters: WaitQueue::new(),
            }),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        unsafe { (*self.inner.get()).broadcast }
    }

    /// Announce the event. Waiters wake in priority order; with nobody
    /// waiting the raise is lost.
    pub fn raise(&self) -> MacsResult {
        if !sched::is_initialized() || !sched::is_started() {
            return Err(Error::InvalidState);
        }
        if !port::is_syscall_allowed() {
            return Err(Error::SysCallNotAllowed);
        }

        syscall::invoke_result(SvcOp::EventRaise, self.inner.get() as usize, 0, 0)
    }

    /// Block until the event is raised or the timeout expires. A zero
    /// timeout returns [`Error::Timeout`] immediately.
    pub fn wait(&self, timeout_ms: u32) -> MacsResult {
        if !sched::is_initialized() || !sched::is_started() {
            return Err(Error::InvalidState);
        }
        if port::is_in_interrupt() {
            return Err(Error::InterruptNotSupported);
        }

        syscall::invoke_result(
            SvcOp::EventWait,
            self.inner.get() as usize,
            timeout_ms as usize,
            0,
        )?;
        finish_blocking_op()
    }
}

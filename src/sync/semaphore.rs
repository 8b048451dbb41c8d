//! Counting semaphores
//!
//! A semaphore tracks how many of a bounded set of resources are free,
//! without tying resources to tasks. `signal` prefers handing the token
//! straight to the highest-priority waiter over incrementing the counter,
//! so a waiting task cannot lose its turn to a later arrival.

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

pub(crate) struct SemInner {
    waiters: WaitQueue,
    count: usize,
    max_count: usize,
}

impl SemInner {
    const fn new(start_count: usize, max_count: usize) -> Self {
        Self {
            waiters: WaitQueue::new(),
            count: if start_count <= max_count {
                start_count
            } else {
                max_count
            },
            max_count,
        }
    }

    fn functor(&mut self) -> NonNull<dyn UnblockFunctor> {
        unsafe { NonNull::new_unchecked(self as *mut Self as *mut dyn UnblockFunctor) }
    }

    pub(crate) fn wait_priv(&mut self, timeout_ms: u32) -> MacsResult {
        let _cs = CriticalSection::enter();

        if self.count > 0 {
            self.count -= 1;
            // The caller judges the outcome by the unblock reason.
            if let Some(cur) = sched::current() {
                unsafe { (*cur.as_ptr()).clear_unblock_reason() };
            }
            return Ok(());
        }

        if timeout_ms == 0 {
            return Err(Error::Timeout);
        }

        let functor = self.functor();
        self.waiters.block_current(functor, timeout_ms)
    }

    pub(crate) fn signal_priv(&mut self) -> MacsResult {
        let _cs = CriticalSection::enter();

        if self.count == self.max_count {
            return Err(Error::InvalidState);
        }

        if self.waiters.is_holding() {
            // Token transfer: the woken waiter consumes the signal, the
            // counter stays put.
            return self.waiters.unblock_one();
        }

        self.count += 1;
        Ok(())
    }
}

impl UnblockFunctor for SemInner {
    fn on_unblock_task(&mut self, task: NonNull<Task>, reason: UnblockReason) {
        if reason == UnblockReason::Timeout {
            self.waiters.remove(task);
        }
    }

    fn on_delete_task(&mut self, task: NonNull<Task>) {
        self.waiters.remove(task);
    }
}

/// Counting semaphore with an upper bound.
pub struct Semaphore {
    inner: UnsafeCell<SemInner>,
}

unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a semaphore with `start_count` free resources out of
    /// `max_count`. A start count above the bound is clamped to it.
    pub const fn new(start_count: usize, max_count: usize) -> Self {
        Self {
            inner: UnsafeCell::new(SemInner::new(start_count, max_count)),
        }
    }

    /// Binary semaphore: `max_count` of 1, empty or full.
    pub const fn binary(is_empty: bool) -> Self {
        Self::new(if is_empty { 0 } else { 1 }, 1)
    }

    /// Current number of free resources.
    pub fn count(&self) -> usize {
        unsafe { (*self.inner.get()).count }
    }

    /// Bound given at construction.
    pub fn max_count(&self) -> usize {
        unsafe { (*self.inner.get()).max_count }
    }

    /// Wait until a resource is free, then take it.
    ///
    /// A zero timeout is a non-blocking probe; pass
    /// [`INFINITE_TIMEOUT`](crate::kernel::types::INFINITE_TIMEOUT) to wait
    /// without bound.
    pub fn wait(&self, timeout_ms: u32) -> MacsResult {
        if !sched::is_initialized() || !sched::is_started() {
            return Err(Error::InvalidState);
        }
        if timeout_ms == 0 {
            if !port::is_syscall_allowed() {
                return Err(Error::SysCallNotAllowed);
            }
        } else if port::is_in_interrupt() {
            return Err(Error::InterruptNotSupported);
        }

        syscall::invoke_result(
            SvcOp::SemaphoreWait,
            self.inner.get() as usize,
            timeout_ms as usize,
            0,
        )?;
        finish_blocking_op()
    }

    /// Release a resource, waking the highest-priority waiter if any.
    ///
    /// Signaling a full semaphore is an error.
    pub fn signal(&self) -> MacsResult {
        if !sched::is_initialized() || !sched::is_started() {
            return Err(Error::InvalidState);
        }
        if !port::is_syscall_allowed() {
            return Err(Error::SysCallNotAllowed);
        }

        syscall::invoke_result(SvcOp::SemaphoreSignal, self.inner.get() as usize, 0, 0)
    }
}

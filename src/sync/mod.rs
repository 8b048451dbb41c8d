//! Synchronization primitives
//!
//! Every primitive that can block owns a priority-ordered waiter list
//! ([`WaitQueue`]) threaded through the task's sync link. While a task is
//! parked, the primitive is registered as its unblock functor so the
//! timeout path can detach the task without scanning every object.

pub mod event;
pub mod mutex;
pub mod queue;
pub mod semaphore;

pub use event::Event;
pub use mutex::{Mutex, MutexGuard};
pub use queue::MessageQueue;
pub use semaphore::Semaphore;

use core::ptr::NonNull;

use crate::kernel::error::{Error, MacsResult};
use crate::kernel::list::RawList;
use crate::kernel::sched;
use crate::kernel::task::{prior_precedes, SyncLink, Task};
use crate::kernel::types::{Priority, UnblockReason};

/// Callbacks a sync object registers with a task it parked.
pub(crate) trait UnblockFunctor {
    /// The kernel is releasing `task`; a `Timeout` reason means the waiter
    /// list still holds it.
    fn on_unblock_task(&mut self, task: NonNull<Task>, reason: UnblockReason);

    /// `task` is being deleted while attached to this object.
    fn on_delete_task(&mut self, task: NonNull<Task>) {
        let _ = task;
    }
}

/// Priority-ordered list of tasks blocked on one sync object. Highest
/// priority at the front; equal priorities keep arrival order.
pub(crate) struct WaitQueue {
    waiters: RawList<Task, SyncLink>,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            waiters: RawList::new(),
        }
    }

    #[inline]
    pub fn is_holding(&self) -> bool {
        !self.waiters.is_empty()
    }

    pub fn front_priority(&self) -> Option<Priority> {
        self.waiters.head().map(|t| unsafe { t.as_ref() }.priority())
    }

    /// Park the current task here and block it. `functor` is the owning
    /// primitive, registered with the task for the timeout path.
    pub fn block_current(
        &mut self,
        functor: NonNull<dyn UnblockFunctor>,
        timeout_ms: u32,
    ) -> MacsResult {
        let cur = sched::current().ok_or(Error::InvalidState)?;
        self.waiters.insert_ordered(cur, prior_precedes);
        sched::block_current_task_priv(timeout_ms, Some(functor))
    }

    /// Release the highest-priority waiter.
    pub fn unblock_one(&mut self) -> MacsResult {
        debug_assert!(self.is_holding());
        let task = self.waiters.fetch().ok_or(Error::InvalidState)?;
        unsafe { (*task.as_ptr()).drop_block_sync() };
        sched::unblock_task_priv(task)
    }

    /// Take the highest-priority waiter without waking it yet.
    pub fn fetch(&mut self) -> Option<NonNull<Task>> {
        let task = self.waiters.fetch()?;
        unsafe { (*task.as_ptr()).drop_block_sync() };
        Some(task)
    }

    pub fn remove(&mut self, task: NonNull<Task>) {
        self.waiters.remove(task);
    }

    /// Forcibly detach every waiter, without waking them.
    pub fn drop_links(&mut self) {
        while self.fetch().is_some() {}
    }
}

/// Map the current task's unblock reason after a blocking call returned
/// successfully: the block itself reports `Ok`, the reason tells whether
/// the wait timed out.
pub(crate) fn finish_blocking_op() -> MacsResult {
    match sched::current() {
        Some(cur) if unsafe { cur.as_ref() }.unblock_reason() == UnblockReason::Timeout => {
            Err(Error::Timeout)
        }
        _ => Ok(()),
    }
}

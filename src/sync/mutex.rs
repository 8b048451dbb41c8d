//! Mutexes
//!
//! A mutex has at most one owner at a time; other lockers block until it is
//! released, and ownership passes directly to the highest-priority waiter
//! on unlock. With priority inheritance enabled, the owner of a contended
//! mutex temporarily runs at the highest priority among the tasks waiting
//! on any mutex it owns, bounding priority-inversion latency. Inheritance
//! is one hop: a blocked waiter's own mutexes cannot gain higher-priority
//! contenders while it is blocked, so chains are not chased.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::kernel::critical::CriticalSection;
use crate::kernel::error::{alarm, AlarmReason, Error, MacsResult};
use crate::kernel::sched;
use crate::kernel::syscall::{self, SvcOp};
use crate::kernel::task::Task;
use crate::kernel::types::{Priority, UnblockReason, INFINITE_TIMEOUT};
use crate::port;
use crate::sync::{finish_blocking_op, UnblockFunctor, WaitQueue};

pub(crate) struct MutexInner {
    waiters: WaitQueue,
    owner: Option<NonNull<Task>>,
    /// 0 means free; above 1 only for a recursive mutex.
    lock_cnt: u32,
    recursive: bool,
    /// The owner's priority before any inheritance boost.
    pub(crate) owner_original_priority: Priority,
    /// Link in the owner's owned-mutex list.
    pub(crate) next_owned: Option<NonNull<MutexInner>>,
}

impl MutexInner {
    const fn new(recursive: bool) -> Self {
        Self {
            waiters: WaitQueue::new(),
            owner: None,
            lock_cnt: 0,
            recursive,
            owner_original_priority: 0,
            next_owned: None,
        }
    }

    fn as_ptr(&mut self) -> NonNull<MutexInner> {
        unsafe { NonNull::new_unchecked(self as *mut MutexInner) }
    }

    fn functor(&mut self) -> NonNull<dyn UnblockFunctor> {
        unsafe { NonNull::new_unchecked(self as *mut Self as *mut dyn UnblockFunctor) }
    }

    pub(crate) fn lock_priv(&mut self, timeout_ms: u32) -> MacsResult {
        let _cs = CriticalSection::enter();

        let cur = sched::current().ok_or(Error::InvalidState)?;

        if self.owner == Some(cur) {
            if !self.recursive {
                alarm(AlarmReason::NestedMutexLock);
                return Err(Error::InvalidState);
            }
            debug_assert!(self.lock_cnt > 0);
            if self.lock_cnt == u32::MAX {
                alarm(AlarmReason::CounterOverflow);
                return Err(Error::InvalidState);
            }
            self.lock_cnt += 1;
            return Ok(());
        }

        if self.owner.is_none() {
            let me = self.as_ptr();
            self.owner = Some(cur);
            let cur_ref = unsafe { &mut *cur.as_ptr() };
            #[cfg(feature = "pi")]
            {
                // Inherit the recorded original from an already-owned mutex
                // so a boosted priority is never mistaken for the original.
                self.owner_original_priority = match cur_ref.owned.head() {
                    Some(h) => unsafe { h.as_ref() }.owner_original_priority,
                    None => cur_ref.priority(),
                };
            }
            cur_ref.add_owned_sync(me);

            debug_assert_eq!(self.lock_cnt, 0);
            self.lock_cnt = 1;
            cur_ref.clear_unblock_reason();
            return Ok(());
        }

        if timeout_ms == 0 {
            return Err(Error::Timeout);
        }

        self.block_cur_task(timeout_ms)
    }

    fn block_cur_task(&mut self, timeout_ms: u32) -> MacsResult {
        let functor = self.functor();
        let res = self.waiters.block_current(functor, timeout_ms);
        #[cfg(feature = "pi")]
        self.update_owner_priority();
        res
    }

    pub(crate) fn unlock_priv(&mut self) -> MacsResult {
        let _cs = CriticalSection::enter();

        let cur = sched::current().ok_or(Error::InvalidState)?;
        if self.owner != Some(cur) {
            return Err(Error::InvalidState);
        }

        debug_assert!(self.lock_cnt > 0);
        self.lock_cnt -= 1;
        if self.lock_cnt > 0 {
            return Ok(());
        }

        let inh = self.remove_from_owner();
        #[cfg(feature = "pi")]
        if let Some(owner) = self.owner {
            if unsafe { owner.as_ref() }.priority() != inh {
                let _ = sched::set_task_priority_internal(owner, inh);
            }
        }
        #[cfg(not(feature = "pi"))]
        let _ = inh;

        if self.waiters.is_holding() {
            return self.transfer_to_next_waiter();
        }
        self.owner = None;
        Ok(())
    }

    /// Unlink this mutex from its owner's owned list and recompute the
    /// priority the owner should fall back to: its original priority, or
    /// the highest front-waiter priority among the mutexes it still owns.
    fn remove_from_owner(&mut self) -> Priority {
        let me = self.as_ptr();
        let owner = self.owner.expect("mutex has no owner");
        unsafe { (*owner.as_ptr()).remove_owned_sync(me) };

        #[allow(unused_mut)]
        let mut inh = self.owner_original_priority;
        #[cfg(feature = "pi")]
        for m in unsafe { owner.as_ref() }.owned.iter() {
            if let Some(p) = unsafe { m.as_ref() }.waiters.front_priority() {
                if p > inh {
                    inh = p;
                }
            }
        }
        inh
    }

    /// Hand ownership to the highest-priority waiter and wake it.
    fn transfer_to_next_waiter(&mut self) -> MacsResult {
        let me = self.as_ptr();
        let next = self.waiters.fetch().ok_or(Error::InvalidState)?;

        self.owner = Some(next);
        debug_assert_eq!(self.lock_cnt, 0);
        self.lock_cnt = 1;
        unsafe { (*next.as_ptr()).add_owned_sync(me) };
        #[cfg(feature = "pi")]
        {
            self.owner_original_priority = unsafe { next.as_ref() }.priority();
        }

        sched::unblock_task_priv(next)
    }

    /// Release on behalf of an owner that is being deleted.
    fn unlock_internal(&mut self) -> MacsResult {
        let inh = self.remove_from_owner();
        #[cfg(feature = "pi")]
        if let Some(owner) = self.owner {
            if unsafe { owner.as_ref() }.priority() != inh {
                let _ = sched::set_task_priority_internal(owner, inh);
            }
        }
        #[cfg(not(feature = "pi"))]
        let _ = inh;

        if self.waiters.is_holding() {
            return self.transfer_to_next_waiter();
        }
        self.owner = None;
        Ok(())
    }

    /// Raise the owner to the front waiter's priority when it is higher
    /// than what the owner currently runs at.
    #[cfg(feature = "pi")]
    fn update_owner_priority(&mut self) {
        let Some(owner) = self.owner else {
            return;
        };
        let mut max = self.owner_original_priority;
        if let Some(p) = self.waiters.front_priority() {
            if p > max {
                max = p;
            }
        }
        if unsafe { owner.as_ref() }.priority() != max {
            let _ = sched::set_task_priority_internal(owner, max);
        }
    }
}

impl UnblockFunctor for MutexInner {
    fn on_unblock_task(&mut self, task: NonNull<Task>, reason: UnblockReason) {
        if reason == UnblockReason::Timeout {
            self.waiters.remove(task);
            #[cfg(feature = "pi")]
            self.update_owner_priority();
        }
    }

    fn on_delete_task(&mut self, task: NonNull<Task>) {
        if self.owner.is_none() {
            return;
        }

        if self.owner != Some(task) {
            self.waiters.remove(task);
            #[cfg(feature = "pi")]
            self.update_owner_priority();
        } else {
            let _ = self.unlock_internal();
            self.lock_cnt = 0;
        }
    }
}

/// Mutual-exclusion lock with optional recursion and priority inheritance.
pub struct Mutex {
    inner: UnsafeCell<MutexInner>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Mutex {
    /// Create a non-recursive mutex.
    pub const fn new() -> Self {
        Self {
            inner: UnsafeCell::new(MutexInner::new(false)),
        }
    }

    /// Create a recursive mutex: the owner may lock again, and needs as
    /// many unlocks to release.
    pub const fn recursive() -> Self {
        Self {
            inner: UnsafeCell::new(MutexInner::new(true)),
        }
    }

    pub fn is_recursive(&self) -> bool {
        unsafe { (*self.inner.get()).recursive }
    }

    /// Whether the mutex is currently owned, without blocking.
    pub fn is_locked(&self) -> bool {
        unsafe { (*self.inner.get()).owner.is_some() }
    }

    /// Current nesting depth; 0 when free.
    pub fn lock_count(&self) -> u32 {
        unsafe { (*self.inner.get()).lock_cnt }
    }

    /// The owner's live priority, if owned.
    pub fn owner_priority(&self) -> Option<Priority> {
        unsafe { (*self.inner.get()).owner }.map(|t| unsafe { t.as_ref() }.priority())
    }

    /// Acquire the mutex, waiting at most `timeout_ms`.
    ///
    /// A zero timeout probes without blocking and without altering any
    /// priority. Locking a non-recursive mutex twice from the same task is
    /// an error.
    pub fn lock(&self, timeout_ms: u32) -> MacsResult {
        if port::is_in_interrupt() {
            return Err(Error::InterruptNotSupported);
        }

        syscall::invoke_result(
            SvcOp::MutexLock,
            self.inner.get() as usize,
            timeout_ms as usize,
            0,
        )?;
        finish_blocking_op()
    }

    /// Release the mutex. Only the owner may unlock; when waiters exist,
    /// ownership transfers to the highest-priority one.
    pub fn unlock(&self) -> MacsResult {
        if port::is_in_interrupt() {
            return Err(Error::InterruptNotSupported);
        }

        syscall::invoke_result(SvcOp::MutexUnlock, self.inner.get() as usize, 0, 0)
    }

    /// Lock and return an RAII guard releasing on drop.
    pub fn guard(&self) -> MacsResult<MutexGuard<'_>> {
        self.lock(INFINITE_TIMEOUT)?;
        Ok(MutexGuard { mutex: self })
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if let Some(owner) = inner.owner {
            alarm(AlarmReason::OwnedMutexDestroyed);
            let me = inner.as_ptr();
            unsafe { (*owner.as_ptr()).remove_owned_sync(me) };
            inner.owner = None;
        }
        if inner.waiters.is_holding() {
            alarm(AlarmReason::BlockingMutexDestroyed);
            inner.waiters.drop_links();
        }
    }
}

/// Scope guard holding a [`Mutex`] for its lifetime.
pub struct MutexGuard<'a> {
    mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let _ = self.mutex.unlock();
    }
}

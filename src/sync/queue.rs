//! Bounded message queues
//!
//! A fixed-size FIFO over two semaphores: producers wait on free slots,
//! consumers on used slots, and the ring mutation itself runs under a
//! scheduler pause. The ring keeps one boundary slot so full and empty are
//! distinguishable without a size counter: a queue of `SLOTS` entries holds
//! at most `SLOTS - 1` messages.

use core::cell::UnsafeCell;

use crate::kernel::error::{Error, MacsResult};
use crate::kernel::sched::{self, PauseSection};
use crate::port;
use crate::sync::Semaphore;

struct Ring<T, const SLOTS: usize> {
    buf: [Option<T>; SLOTS],
    head: usize,
    tail: usize,
}

impl<T, const SLOTS: usize> Ring<T, SLOTS> {
    const fn new() -> Self {
        Self {
            buf: [const { None }; SLOTS],
            head: 0,
            tail: 0,
        }
    }

    fn count(&self) -> usize {
        (self.tail + SLOTS - self.head) % SLOTS
    }

    fn push_back(&mut self, msg: T) {
        debug_assert!(self.count() < SLOTS - 1);
        self.buf[self.tail] = Some(msg);
        self.tail = (self.tail + 1) % SLOTS;
    }

    fn push_front(&mut self, msg: T) {
        debug_assert!(self.count() < SLOTS - 1);
        self.head = (self.head + SLOTS - 1) % SLOTS;
        self.buf[self.head] = Some(msg);
    }

    fn pop(&mut self) -> T {
        debug_assert!(self.count() != 0);
        let msg = self.buf[self.head].take().expect("queue slot empty");
        self.head = (self.head + 1) % SLOTS;
        msg
    }
}

/// Bounded FIFO of `SLOTS - 1` messages of `T` between tasks.
///
/// `SLOTS` must be at least 2; the extra slot is the full/empty boundary
/// element.
pub struct MessageQueue<T, const SLOTS: usize> {
    ring: UnsafeCell<Ring<T, SLOTS>>,
    slots_free: Semaphore,
    slots_used: Semaphore,
}

unsafe impl<T: Send, const SLOTS: usize> Send for MessageQueue<T, SLOTS> {}
unsafe impl<T: Send, const SLOTS: usize> Sync for MessageQueue<T, SLOTS> {}

impl<T, const SLOTS: usize> MessageQueue<T, SLOTS> {
    pub const fn new() -> Self {
        assert!(SLOTS >= 2);
        Self {
            ring: UnsafeCell::new(Ring::new()),
            slots_free: Semaphore::new(SLOTS - 1, SLOTS - 1),
            slots_used: Semaphore::new(0, SLOTS - 1),
        }
    }

    /// Messages currently queued.
    pub fn count(&self) -> usize {
        unsafe { (*self.ring.get()).count() }
    }

    /// Maximum number of queued messages.
    pub fn max_size(&self) -> usize {
        SLOTS - 1
    }

    /// Append a message. Blocks while the queue is full, up to
    /// `timeout_ms`. On error the message is dropped.
    pub fn push(&self, msg: T, timeout_ms: u32) -> MacsResult {
        self.process(&self.slots_free, &self.slots_used, timeout_ms, |ring| {
            ring.push_back(msg);
        })
    }

    /// Prepend a message, jumping the FIFO order. Blocks while the queue
    /// is full, up to `timeout_ms`. On error the message is dropped.
    pub fn push_front(&self, msg: T, timeout_ms: u32) -> MacsResult {
        self.process(&self.slots_free, &self.slots_used, timeout_ms, |ring| {
            ring.push_front(msg);
        })
    }

    /// Take the front message. Blocks while the queue is empty, up to
    /// `timeout_ms`.
    pub fn pop(&self, timeout_ms: u32) -> MacsResult<T> {
        let mut msg = None;
        self.process(&self.slots_used, &self.slots_free, timeout_ms, |ring| {
            msg = Some(ring.pop());
        })?;
        msg.ok_or(Error::InvalidState)
    }

    fn process(
        &self,
        wait_sem: &Semaphore,
        sig_sem: &Semaphore,
        timeout_ms: u32,
        op: impl FnOnce(&mut Ring<T, SLOTS>),
    ) -> MacsResult {
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

        wait_sem.wait(if port::is_in_interrupt() { 0 } else { timeout_ms })?;

        {
            let _ps = PauseSection::new();
            op(unsafe { &mut *self.ring.get() });
        }

        sig_sem.signal()
    }
}

impl<T: Clone, const SLOTS: usize> MessageQueue<T, SLOTS> {
    /// Copy the front message without removing it. Blocks while the queue
    /// is empty, up to `timeout_ms`.
    pub fn peek(&self, timeout_ms: u32) -> MacsResult<T> {
        let mut msg = None;
        // The item stays queued, so the used-slot token is given back
        // rather than a free slot produced.
        self.process(&self.slots_used, &self.slots_used, timeout_ms, |ring| {
            debug_assert!(ring.count() != 0);
            msg = ring.buf[ring.head].clone();
        })?;
        msg.ok_or(Error::InvalidState)
    }
}

impl<T, const SLOTS: usize> Default for MessageQueue<T, SLOTS> {
    fn default() -> Self {
        Self::new()
    }
}

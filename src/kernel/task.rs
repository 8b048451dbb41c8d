//! Tasks
//!
//! A [`Task`] couples a body function with its stack region and the
//! bookkeeping the scheduler needs: queue links, priority, state, sleep
//! counter, the unblock functor of the sync object it is parked on, and the
//! list of mutexes it owns. [`TaskIrq`] is the variant whose body runs once
//! per occurrence of a named interrupt.

use core::ptr::NonNull;

use crate::kernel::error::{Error, MacsResult};
use crate::kernel::list::{Link, RawList};
use crate::kernel::sched;
use crate::kernel::stack::TaskStack;
use crate::kernel::syscall::{self, SvcOp};
use crate::kernel::types::{
    ms_to_ticks, priority, Mode, Priority, State, Tick, UnblockReason,
};
use crate::port;
use crate::sync::mutex::MutexInner;
use crate::sync::UnblockFunctor;

/// Task body function.
pub type TaskFn = fn(*mut ());

/// Task control block.
///
/// Construct with [`Task::new`], park in static (or otherwise pinned)
/// memory, then hand to [`add`] together with a stack region.
#[repr(C)]
pub struct Task {
    pub(crate) stack: TaskStack,

    /// Link for the scheduler queue currently holding the task (work or
    /// sleep — never both).
    pub(crate) next_sched: Option<NonNull<Task>>,
    /// Link for the waiter list of a sync object.
    pub(crate) next_sync: Option<NonNull<Task>>,

    pub(crate) priority: Priority,
    pub(crate) state: State,
    pub(crate) mode: Mode,

    /// Ticks until timed wakeup; [`crate::kernel::types::INFINITE_TICKS`]
    /// while blocked without timeout.
    pub(crate) dream_ticks: Tick,
    pub(crate) unblock_reason: UnblockReason,
    /// Sync object holding this task while blocked.
    pub(crate) unblock_func: Option<NonNull<dyn UnblockFunctor>>,
    /// Mutexes currently owned by this task.
    pub(crate) owned: RawList<MutexInner, OwnedLink>,

    /// Accumulated run time in CPU cycles.
    pub(crate) run_cycles: u64,
    pub(crate) switch_cpu_tick: u32,

    name: Option<&'static str>,
    entry: TaskFn,
    pub(crate) arg: *mut (),
}

impl Task {
    /// Create an inactive task that will run `entry` once added.
    pub const fn new(name: Option<&'static str>, entry: TaskFn) -> Self {
        Self {
            stack: TaskStack::empty(),
            next_sched: None,
            next_sync: None,
            priority: priority::NORMAL,
            state: State::Inactive,
            mode: Mode::Unprivileged,
            dream_ticks: 0,
            unblock_reason: UnblockReason::None,
            unblock_func: None,
            owned: RawList::new(),
            run_cycles: 0,
            switch_cpu_tick: 0,
            name,
            entry,
            arg: core::ptr::null_mut(),
        }
    }

    /// Like [`Task::new`] with an argument passed to the body.
    pub const fn with_arg(name: Option<&'static str>, entry: TaskFn, arg: *mut ()) -> Self {
        let mut t = Self::new(name, entry);
        t.arg = arg;
        t
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Why the task was last released from a blocked state.
    pub fn unblock_reason(&self) -> UnblockReason {
        self.unblock_reason
    }

    /// The task's stack region.
    pub fn stack(&self) -> &TaskStack {
        &self.stack
    }

    /// Stack length in words; 0 before the task is added.
    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Watermark stack usage in words (see [`instrument_stack`](Self::instrument_stack)).
    pub fn stack_usage(&self) -> usize {
        self.stack.usage()
    }

    /// Fill the currently free part of the stack with the guard pattern so
    /// [`stack_usage`](Self::stack_usage) measures from this point on.
    pub fn instrument_stack(&mut self) {
        self.stack.instrument(true);
    }

    /// Accumulated run time in CPU cycles.
    pub fn run_cycles(&self) -> u64 {
        self.run_cycles
    }

    #[inline]
    pub(crate) fn is_runnable(&self) -> bool {
        matches!(self.state, State::Running | State::Ready)
    }

    pub(crate) fn drop_block_sync(&mut self) {
        self.unblock_func = None;
    }

    pub(crate) fn clear_unblock_reason(&mut self) {
        self.unblock_reason = UnblockReason::None;
    }

    pub(crate) fn add_owned_sync(&mut self, obj: NonNull<MutexInner>) {
        self.owned.push(obj);
    }

    pub(crate) fn remove_owned_sync(&mut self, obj: NonNull<MutexInner>) {
        self.owned.remove(obj);
    }

    /// Detach from the blocking sync object and resolve every owned mutex.
    pub(crate) fn detach_from_sync(&mut self) {
        let me = NonNull::from(&mut *self);
        if let Some(mut f) = self.unblock_func.take() {
            unsafe { f.as_mut().on_delete_task(me) };
        }
        while let Some(mut m) = self.owned.head() {
            unsafe { m.as_mut().on_delete_task(me) };
        }
    }

    /// Lay a fresh first-dispatch frame over the existing stack region.
    pub(crate) fn reprepare_stack(&mut self) {
        let this = self as *mut Task as *mut ();
        self.stack.prepare(this, task_run, task_exit);
    }
}

/// Scheduler-queue link.
pub(crate) struct SchedLink;
impl Link<Task> for SchedLink {
    fn next(t: &Task) -> Option<NonNull<Task>> {
        t.next_sched
    }
    fn set_next(t: &mut Task, next: Option<NonNull<Task>>) {
        t.next_sched = next;
    }
}

/// Sync-waiter-list link.
pub(crate) struct SyncLink;
impl Link<Task> for SyncLink {
    fn next(t: &Task) -> Option<NonNull<Task>> {
        t.next_sync
    }
    fn set_next(t: &mut Task, next: Option<NonNull<Task>>) {
        t.next_sync = next;
    }
}

/// Owned-mutex-list link.
pub(crate) struct OwnedLink;
impl Link<MutexInner> for OwnedLink {
    fn next(m: &MutexInner) -> Option<NonNull<MutexInner>> {
        m.next_owned
    }
    fn set_next(m: &mut MutexInner, next: Option<NonNull<MutexInner>>) {
        m.next_owned = next;
    }
}

/// Higher priority goes first; equal priorities keep arrival order.
pub(crate) fn prior_precedes(a: &Task, b: &Task) -> bool {
    a.priority > b.priority
}

/// Sooner wakeup goes first.
pub(crate) fn wakeup_precedes(a: &Task, b: &Task) -> bool {
    a.dream_ticks <= b.dream_ticks
}

/// Body shim the first dispatch returns into. Runs the task body, then
/// removes the task when the body returns.
pub(crate) extern "C" fn task_run(this: *mut ()) {
    let task = this as *mut Task;
    unsafe { ((*task).entry)((*task).arg) };
    let _ = remove(unsafe { NonNull::new_unchecked(task) });
    loop {
        port::idle_wait();
    }
}

/// Exit trampoline reached through the synthetic frame's LR.
pub(crate) extern "C" fn task_exit() {
    if let Some(cur) = current() {
        let _ = remove(cur);
    }
    loop {
        port::idle_wait();
    }
}

/// Add a task to the scheduler.
///
/// The task transitions `Inactive -> Ready`. Under preemptive scheduling
/// the call may switch immediately if the new task outranks the current
/// one.
pub fn add(
    task: &'static mut Task,
    stack_mem: &'static mut [u32],
    prio: Priority,
    mode: Mode,
) -> MacsResult {
    if port::is_in_interrupt() && !port::is_in_syscall() {
        return Err(Error::InterruptNotSupported);
    }
    if prio > priority::MAX {
        return Err(Error::InvalidArgs);
    }
    if task.state != State::Inactive {
        return Err(Error::InvalidState);
    }

    task.stack.build(stack_mem).map_err(|_| Error::InvalidArgs)?;
    task.reprepare_stack();
    task.priority = prio;
    task.state = State::Ready;
    task.mode = if cfg!(feature = "profiling") {
        Mode::Privileged
    } else {
        mode
    };

    syscall::invoke_result(SvcOp::AddTask, task as *mut Task as usize, 0, 0)
}

/// Add an IRQ-handler task.
///
/// Unlike [`add`], the task starts `Blocked` and joins the IRQ-task list;
/// it becomes ready each time interrupt `irq_num` is forwarded to the
/// scheduler.
pub fn add_irq(
    task: &'static mut TaskIrq,
    irq_num: i32,
    stack_mem: &'static mut [u32],
    prio: Priority,
    mode: Mode,
) -> MacsResult {
    if port::is_in_interrupt() && !port::is_in_syscall() {
        return Err(Error::InterruptNotSupported);
    }
    if prio > priority::MAX {
        return Err(Error::InvalidArgs);
    }
    if task.task.state != State::Inactive {
        return Err(Error::InvalidState);
    }

    debug_assert!(task.irq_num == -1);
    task.irq_num = irq_num;
    task.task.arg = task as *mut TaskIrq as *mut ();
    task.task.stack.build(stack_mem).map_err(|_| Error::InvalidArgs)?;
    task.task.reprepare_stack();
    task.task.priority = prio;
    task.task.state = State::Blocked;
    task.task.mode = if cfg!(feature = "profiling") {
        Mode::Privileged
    } else {
        mode
    };

    syscall::invoke_result(SvcOp::AddTaskIrq, task as *mut TaskIrq as usize, 0, 0)
}

/// Remove a task from the scheduler without touching its memory.
///
/// Removing the current task triggers an immediate switch, since the
/// outgoing stack must not be used afterwards.
pub fn remove(task: NonNull<Task>) -> MacsResult {
    if port::is_in_interrupt() {
        return Err(Error::InterruptNotSupported);
    }
    syscall::invoke_result(SvcOp::DeleteTask, task.as_ptr() as usize, 0, 0)
}

/// Block the current task for `timeout_ms` milliseconds.
///
/// Returns once the delay elapses or the task is explicitly unblocked
/// early.
pub fn delay(timeout_ms: u32) -> MacsResult {
    match syscall::invoke_result(SvcOp::BlockCurrentTask, timeout_ms as usize, 0, 0) {
        Ok(()) | Err(Error::Timeout) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Burn CPU for `timeout_ms` milliseconds without blocking.
///
/// Usable where a context switch is unwanted or impossible, e.g. under
/// cooperative scheduling.
pub fn cpu_delay(timeout_ms: u32) {
    let ticks = ms_to_ticks(timeout_ms);
    let start = sched::tick_count();
    while sched::tick_count().wrapping_sub(start) < ticks {}
}

/// Set a task's priority.
///
/// Under preemptive scheduling the change may cause an immediate switch.
pub fn set_priority(task: NonNull<Task>, prio: Priority) -> MacsResult {
    if !sched::is_started() {
        return Err(Error::InvalidState);
    }
    if port::is_in_interrupt() {
        return Err(Error::InterruptNotSupported);
    }
    if prio > priority::MAX {
        return Err(Error::InvalidArgs);
    }
    syscall::invoke_result(
        SvcOp::SetTaskPriority,
        task.as_ptr() as usize,
        prio as usize,
        0,
    )
}

/// Release the remainder of the current quantum.
pub fn yield_now() {
    if !sched::is_started() {
        return;
    }
    let _ = syscall::invoke_result(SvcOp::Yield, 0, 0, 0);
}

/// The currently running task.
pub fn current() -> Option<NonNull<Task>> {
    sched::current()
}

/// Unblock a task waiting on a timeout or sync object.
pub fn unblock(task: NonNull<Task>) -> MacsResult {
    if !sched::is_started() {
        return Err(Error::InvalidState);
    }
    if !port::is_syscall_allowed() {
        return Err(Error::SysCallNotAllowed);
    }
    syscall::invoke_result(SvcOp::UnblockTask, task.as_ptr() as usize, 0, 0)
}

/// A task serving a named interrupt.
///
/// After [`add_irq`] the task stays blocked until its interrupt is
/// forwarded via [`sched::proceed_irq`]; the handler then runs once per
/// occurrence.
#[repr(C)]
pub struct TaskIrq {
    /// Base task. Must stay the first field so the scheduler can treat an
    /// IRQ task as a plain task by its base address.
    pub(crate) task: Task,
    pub(crate) next_irq: Option<NonNull<TaskIrq>>,
    pub(crate) irq_num: i32,
    pub(crate) irq_up: bool,
    handler: TaskFn,
    handler_arg: *mut (),
}

impl TaskIrq {
    /// Create an inactive IRQ task that will run `handler` once per
    /// interrupt occurrence.
    pub const fn new(name: Option<&'static str>, handler: TaskFn) -> Self {
        Self {
            task: Task::new(name, irq_task_body),
            next_irq: None,
            irq_num: -1,
            irq_up: false,
            handler,
            handler_arg: core::ptr::null_mut(),
        }
    }

    /// Like [`TaskIrq::new`] with an argument passed to the handler.
    pub const fn with_arg(name: Option<&'static str>, handler: TaskFn, arg: *mut ()) -> Self {
        let mut t = Self::new(name, handler);
        t.handler_arg = arg;
        t
    }

    pub fn irq_num(&self) -> i32 {
        self.irq_num
    }

    pub fn base(&self) -> &Task {
        &self.task
    }

    pub fn base_mut(&mut self) -> &mut Task {
        &mut self.task
    }
}

/// IRQ-task link.
pub(crate) struct IrqLink;
impl Link<TaskIrq> for IrqLink {
    fn next(t: &TaskIrq) -> Option<NonNull<TaskIrq>> {
        t.next_irq
    }
    fn set_next(t: &mut TaskIrq, next: Option<NonNull<TaskIrq>>) {
        t.next_irq = next;
    }
}

fn irq_task_body(arg: *mut ()) {
    let irq = arg as *mut TaskIrq;
    loop {
        unsafe { ((*irq).handler)((*irq).handler_arg) };
        let _ = delay(crate::kernel::types::INFINITE_TIMEOUT);
    }
}

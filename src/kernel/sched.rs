//! Scheduler
//!
//! Single process-wide instance with an init-then-start lifecycle: init may
//! run before start so the tick counter is usable during early driver
//! setup. Owns the work (ready) queue, the sleep queue and the IRQ-task
//! list, drives tick accounting, decides when to preempt and performs the
//! actual switch.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::clock;
use crate::kernel::config;
use crate::kernel::critical::{critical_section, CriticalSection};
use crate::kernel::cs_cell::CsCell;
use crate::kernel::error::{alarm, AlarmAction, AlarmReason, Error, MacsResult};
use crate::kernel::list::RawList;
use crate::kernel::stack::StackCheck;
use crate::kernel::syscall;
use crate::kernel::task::{
    self, prior_precedes, wakeup_precedes, IrqLink, SchedLink, Task, TaskIrq,
};
use crate::kernel::types::{
    ms_to_ticks, priority, Mode, State, Tick, UnblockReason, INFINITE_TICKS, INFINITE_TIMEOUT,
};
use crate::port;
use crate::sync::UnblockFunctor;

pub(crate) struct Scheduler {
    work: RawList<Task, SchedLink>,
    sleep: RawList<Task, SchedLink>,
    irq_list: RawList<TaskIrq, IrqLink>,
    /// An IRQ task is pending activation.
    irq_event: bool,
    /// The running task lives only here, never in a queue.
    cur: Option<NonNull<Task>>,
    initialized: bool,
    started: bool,
    pause_flg: bool,
    pause_cnt: u32,
    pending_swc: bool,
    use_preemption: bool,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            work: RawList::new(),
            sleep: RawList::new(),
            irq_list: RawList::new(),
            irq_event: false,
            cur: None,
            initialized: false,
            started: false,
            pause_flg: false,
            pause_cnt: 0,
            pending_swc: false,
            use_preemption: true,
        }
    }

    /// Only for use inside a critical section.
    fn try_context_switch(&mut self) {
        if !self.pause_flg && self.pause_cnt == 0 {
            port::request_context_switch();
        } else {
            self.pending_swc = true;
        }
    }

    fn is_context_switch_required(&self) -> bool {
        if self.pending_swc {
            return true;
        }
        let cur = match self.cur {
            Some(c) => unsafe { c.as_ref() },
            None => return true,
        };
        if cur.state != State::Running {
            return true;
        }
        match self.work.head() {
            Some(cand) => cur.priority <= unsafe { cand.as_ref() }.priority,
            None => false,
        }
    }

    fn yield_check(&mut self) {
        if !self.started {
            return;
        }
        if self.is_context_switch_required() {
            self.try_context_switch();
        }
    }

    /// Only for use inside a critical section.
    fn select_next_task(&mut self) {
        if let Some(cur) = self.cur {
            let cur = unsafe { &mut *cur.as_ptr() };
            if cur.state == State::Running {
                cur.state = State::Ready;
            }
            if cur.state == State::Ready {
                self.work.insert_ordered(NonNull::from(&mut *cur), prior_precedes);
            }
        }
        self.cur = self.work.fetch();
        if let Some(cur) = self.cur {
            unsafe { (*cur.as_ptr()).state = State::Running };
        }
    }

    fn unblock_internal(&mut self, task: NonNull<Task>, reason: UnblockReason) -> bool {
        let t = unsafe { &mut *task.as_ptr() };
        if t.state != State::Blocked {
            return false;
        }

        t.unblock_reason = reason;
        t.state = State::Ready;
        if Some(task) != self.cur {
            self.work.insert_ordered(task, prior_precedes);
        }

        if let Some(mut f) = t.unblock_func.take() {
            unsafe { f.as_mut().on_unblock_task(task, reason) };
        }
        true
    }

    fn irq_remove_by_task(&mut self, task: NonNull<Task>) {
        let mut found = None;
        for t in self.irq_list.iter() {
            // The base task is the first field of TaskIrq.
            if t.as_ptr() as *mut Task == task.as_ptr() {
                found = Some(t);
                break;
            }
        }
        if let Some(t) = found {
            self.irq_list.remove(t);
        }
    }

    fn proceed_irq_inner(&mut self, irq_num: i32) {
        for t in self.irq_list.iter() {
            let t = unsafe { &mut *t.as_ptr() };
            if t.irq_num == irq_num {
                if t.task.state == State::Blocked && t.task.unblock_func.is_none() {
                    self.irq_event = true;
                }
                t.irq_up = true;
            }
        }
        #[cfg(feature = "irq-fast-switch")]
        if self.irq_event && self.started {
            self.pending_swc = true;
            self.try_context_switch();
        }
    }

    fn activate_irq_tasks(&mut self) {
        let mut cur = self.irq_list.head();
        while let Some(t) = cur {
            cur = unsafe { t.as_ref() }.next_irq;
            let t = unsafe { &mut *t.as_ptr() };
            if t.irq_up && t.task.state == State::Blocked && t.task.unblock_func.is_none() {
                let base = NonNull::from(&mut t.task);
                self.sleep.remove(base);
                self.unblock_internal(base, UnblockReason::Irq);
                t.irq_up = false;
            }
        }
        self.irq_event = false;
    }
}

static SCHED: CsCell<Scheduler> = CsCell::new(Scheduler::new());
static TICK_COUNT: AtomicU32 = AtomicU32::new(0);

fn idle_body(_: *mut ()) {
    loop {
        #[cfg(feature = "sleep-on-idle")]
        port::idle_wait();
        #[cfg(debug_assertions)]
        IDLE_LOOPS.fetch_add(1, Ordering::Relaxed);
    }
}

/// Loop counter of the idle task, for debugging starvation.
#[cfg(debug_assertions)]
pub static IDLE_LOOPS: AtomicU32 = AtomicU32::new(0);

static mut IDLE_TASK: Task = Task::new(Some("IDLE"), idle_body);
static mut IDLE_STACK: [u32; config::IDLE_STACK_SIZE] = [0; config::IDLE_STACK_SIZE];

/// Initialize the scheduler and the tick timer.
///
/// Separate from [`start`] so [`tick_count`] is usable before multitasking
/// begins, e.g. for driver init. Creates the idle task, the safety net
/// guaranteeing the ready queue is never empty. A previously stopped or
/// stale kernel state is reset.
pub fn initialize() -> MacsResult {
    if port::is_in_interrupt() {
        return Err(Error::InterruptNotSupported);
    }

    critical_section(|cs| {
        *SCHED.get(cs) = Scheduler::new();
    });
    TICK_COUNT.store(0, Ordering::SeqCst);
    clock::reset();

    #[cfg(feature = "mpu")]
    port::mpu_init();

    if !port::init_scheduler() {
        return Err(Error::InvalidState);
    }

    unsafe {
        IDLE_TASK = Task::new(Some("IDLE"), idle_body);
        task::add(
            &mut *(&raw mut IDLE_TASK),
            &mut *(&raw mut IDLE_STACK),
            priority::IDLE,
            Mode::Privileged,
        )?;
    }

    critical_section(|cs| {
        SCHED.get(cs).initialized = true;
    });
    crate::info!("scheduler initialized");
    Ok(())
}

/// Start multitasking and dispatch the highest-priority ready task.
///
/// With `use_preemption` false the tick handler never forces a switch; all
/// other mechanics are identical.
///
/// On hardware this call does not return. The host stub's first switch is a
/// no-op so tests drive the scheduler through the switch entry points.
pub fn start(use_preemption: bool) -> MacsResult {
    if port::is_in_interrupt() {
        return Err(Error::InterruptNotSupported);
    }
    {
        let s = unsafe { SCHED.get_unchecked() };
        if !s.initialized || s.started {
            return Err(Error::InvalidState);
        }
    }
    if !port::is_in_privileged() || !port::is_in_msp_mode() {
        return Err(Error::InvalidState);
    }

    let (top, privileged) = critical_section(|cs| {
        let s = SCHED.get(cs);
        s.use_preemption = use_preemption;
        s.select_next_task();

        let cur = s.cur.expect("no task to start");
        let cur = unsafe { &mut *cur.as_ptr() };
        #[cfg(feature = "mpu")]
        port::mpu_set_proc_mine(cur.stack.margin() as usize);
        s.started = true;
        cur.switch_cpu_tick = port::cycle_count();
        (cur.stack.top, cur.mode == Mode::Privileged)
    });

    crate::info!("scheduler started");
    port::first_switch_to(top, privileged);
    Ok(())
}

pub fn is_initialized() -> bool {
    unsafe { SCHED.get_unchecked() }.initialized
}

pub fn is_started() -> bool {
    unsafe { SCHED.get_unchecked() }.started
}

/// Ticks elapsed since [`initialize`].
pub fn tick_count() -> Tick {
    TICK_COUNT.load(Ordering::Relaxed)
}

/// Free-running CPU cycle counter, usable from unprivileged code.
pub fn cpu_tick() -> u32 {
    syscall::read_cpu_tick()
}

/// C-linkage tick accessor for driver glue.
#[no_mangle]
pub extern "C" fn macs_get_tick_count() -> u32 {
    tick_count()
}

/// The currently running task.
pub(crate) fn current() -> Option<NonNull<Task>> {
    unsafe { SCHED.get_unchecked() }.cur
}

/// Number of tasks known to the scheduler, ready plus blocked.
pub fn tasks_qty() -> usize {
    critical_section(|cs| {
        let s = SCHED.get(cs);
        s.work.qty() + s.sleep.qty() + usize::from(s.cur.is_some())
    })
}

/// Suspend (`set_on`) or resume task switching. Calls nest; preemption
/// resumes when the counter returns to zero, performing any switch that
/// became pending meanwhile. The tick counter keeps running while paused.
pub fn pause(set_on: bool) -> MacsResult {
    // Counter updates are safe without masking: this path only runs from
    // the task that holds the pause.
    let s = unsafe { SCHED.get_unchecked() };
    if !s.started {
        return Err(Error::InvalidState);
    }

    if set_on {
        s.pause_flg = true;
        s.pause_cnt += 1;
        if s.pause_cnt == 0 {
            alarm(AlarmReason::CounterOverflow);
        }
        s.pause_flg = false;
    } else {
        if s.pause_cnt == 0 {
            alarm(AlarmReason::SchedNotOnPause);
            return Err(Error::InvalidState);
        }
        s.pause_cnt -= 1;
        let resume_switch = s.pause_cnt == 0 && s.pending_swc;
        if resume_switch {
            task::yield_now();
        }
    }
    Ok(())
}

/// RAII scheduler pause, held across sections where preemption must not
/// occur but interrupt latency matters more than atomicity against ISRs.
pub struct PauseSection(());

impl PauseSection {
    pub fn new() -> Self {
        let _ = pause(true);
        PauseSection(())
    }
}

impl Default for PauseSection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PauseSection {
    fn drop(&mut self) {
        let _ = pause(false);
    }
}

/// Forward interrupt `irq_num` to the IRQ tasks serving it. Called by the
/// port's IRQ dispatch for real interrupts and by users for virtual ones.
pub fn proceed_irq(irq_num: i32) {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };
    s.proceed_irq_inner(irq_num);
}

// ---- privileged operations, reached directly or through the SVC gate ----

pub(crate) fn add_task_priv(task: NonNull<Task>) -> MacsResult {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };

    s.work.insert_ordered(task, prior_precedes);
    if let Some(name) = unsafe { task.as_ref() }.name() {
        crate::debug!("task added: {=str}", name);
    }

    // A new entrant preempts only when it strictly outranks the running
    // task; equals wait for the tick boundary.
    if s.use_preemption && s.started {
        let preempt = match s.cur {
            None => true,
            Some(c) => {
                let c = unsafe { c.as_ref() };
                c.state != State::Running
                    || c.priority < unsafe { task.as_ref() }.priority
            }
        };
        if preempt {
            s.try_context_switch();
        }
    }
    Ok(())
}

pub(crate) fn add_task_irq_priv(task: NonNull<TaskIrq>) -> MacsResult {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };
    s.irq_list.push(task);
    Ok(())
}

pub(crate) fn delete_task_priv(task: NonNull<Task>) -> MacsResult {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };

    let t = unsafe { &mut *task.as_ptr() };
    if t.state == State::Inactive {
        return Err(Error::InvalidState);
    }

    let is_suicide = Some(task) == s.cur;
    if !is_suicide {
        s.sleep.remove(task);
        if t.is_runnable() {
            s.work.remove(task);
        }
    }

    t.detach_from_sync();
    s.irq_remove_by_task(task);

    #[cfg(feature = "mpu")]
    if is_suicide {
        port::mpu_remove_proc_mine();
    }

    t.state = State::Inactive;
    if let Some(name) = t.name() {
        crate::debug!("task removed: {=str}", name);
    }

    if is_suicide {
        // The outgoing stack is about to be reused; switch right away
        // instead of waiting for a tick.
        s.cur = None;
        port::internal_switch_context();
    }
    Ok(())
}

pub(crate) fn block_current_task_priv(
    timeout_ms: u32,
    functor: Option<NonNull<dyn UnblockFunctor>>,
) -> MacsResult {
    if !is_started() {
        return Err(Error::InvalidState);
    }
    if port::is_in_interrupt() && !port::is_in_syscall() {
        return Err(Error::InterruptNotSupported);
    }

    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };

    let cur = s.cur.ok_or(Error::InvalidState)?;
    let cur_ref = unsafe { &mut *cur.as_ptr() };
    if !cur_ref.is_runnable() {
        return Err(Error::InvalidState);
    }

    // The zero-timeout probe still runs the functor's timeout path so a
    // waiter list the caller already joined is left clean.
    if timeout_ms == 0 {
        if let Some(mut f) = functor {
            unsafe { f.as_mut().on_unblock_task(cur, UnblockReason::Timeout) };
            cur_ref.unblock_func = None;
        }
        return Err(Error::Timeout);
    }

    cur_ref.state = State::Blocked;
    cur_ref.unblock_reason = UnblockReason::None;
    cur_ref.unblock_func = functor;
    cur_ref.dream_ticks = if timeout_ms == INFINITE_TIMEOUT {
        INFINITE_TICKS
    } else {
        ms_to_ticks(timeout_ms).max(1)
    };
    s.sleep.insert_ordered(cur, wakeup_precedes);

    s.try_context_switch();
    Ok(())
}

pub(crate) fn unblock_task_priv(task: NonNull<Task>) -> MacsResult {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };

    // A task blocked with a timeout may still sit in the sleep queue.
    s.sleep.remove(task);

    if !s.unblock_internal(task, UnblockReason::Request) {
        return Err(Error::InvalidState);
    }

    if !s.use_preemption {
        return Ok(());
    }
    if let Some(cur) = s.cur {
        if unsafe { cur.as_ref() }.priority < unsafe { task.as_ref() }.priority {
            s.try_context_switch();
        }
    }
    Ok(())
}

pub(crate) fn set_task_priority_priv(
    task: NonNull<Task>,
    prio: u8,
    internal: bool,
) -> MacsResult {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };

    let t = unsafe { &mut *task.as_ptr() };
    if t.state == State::Inactive {
        return Err(Error::InvalidState);
    }
    if t.priority == prio {
        return Ok(());
    }

    t.priority = prio;
    if t.state == State::Ready && Some(task) != s.cur {
        // Reinsertion puts the task at its new place in the order.
        s.work.remove(task);
        s.work.insert_ordered(task, prior_precedes);
    }

    #[cfg(feature = "pi")]
    if !internal {
        for m in t.owned.iter() {
            unsafe { (*m.as_ptr()).owner_original_priority = prio };
        }
    }
    #[cfg(not(feature = "pi"))]
    let _ = internal;

    if s.use_preemption {
        s.yield_check();
    }
    Ok(())
}

/// Priority update that leaves the recorded original priorities of owned
/// mutexes alone; the path priority inheritance uses.
#[cfg(feature = "pi")]
pub(crate) fn set_task_priority_internal(task: NonNull<Task>, prio: u8) -> MacsResult {
    set_task_priority_priv(task, prio, true)
}

pub(crate) fn yield_priv() {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };
    if s.is_context_switch_required() {
        s.try_context_switch();
    }
}

// ---- tick and switch entry points, called from the port layer ----

/// Advance kernel time by one tick. Returns whether a context switch is
/// needed. Called from the SysTick handler.
#[no_mangle]
pub extern "C" fn macs_tick_handler() -> bool {
    let _cs = CriticalSection::enter();
    TICK_COUNT.fetch_add(1, Ordering::Relaxed);

    let s = unsafe { SCHED.get_unchecked() };
    if s.pause_cnt == 0 {
        clock::on_tick();
    }
    if !s.started {
        return false;
    }

    for t in s.sleep.iter() {
        let t = unsafe { &mut *t.as_ptr() };
        debug_assert!(t.dream_ticks != 0);
        if t.dream_ticks != INFINITE_TICKS {
            t.dream_ticks -= 1;
        }
    }
    while let Some(head) = s.sleep.head() {
        if unsafe { head.as_ref() }.dream_ticks != 0 {
            break;
        }
        if let Some(t) = s.sleep.fetch() {
            s.unblock_internal(t, UnblockReason::Timeout);
        }
    }

    #[cfg(not(feature = "irq-fast-switch"))]
    if s.irq_event {
        s.activate_irq_tasks();
    }

    if s.pause_flg || s.pause_cnt != 0 {
        s.pending_swc = true;
        return false;
    }
    if !s.use_preemption {
        return false;
    }
    s.is_context_switch_required()
}

/// Perform the bookkeeping half of a context switch: bank the outgoing
/// task's SP and verify its stack, pick the next task, arm the MPU mine and
/// processor mode for it, and hand back the SP to restore. Called from the
/// switch trampoline with the outgoing task's SP after register save.
#[no_mangle]
pub unsafe extern "C" fn macs_switch_context(new_sp: *mut u32) -> *mut u32 {
    let _cs = CriticalSection::enter();
    let s = unsafe { SCHED.get_unchecked() };
    debug_assert!(!s.pause_flg && s.pause_cnt == 0);

    s.pending_swc = false;

    if let Some(cur) = s.cur {
        let cur_ref = unsafe { &mut *cur.as_ptr() };
        let now = port::cycle_count();
        cur_ref.run_cycles += now.wrapping_sub(cur_ref.switch_cpu_tick) as u64;
        cur_ref.stack.top = new_sp;

        let check = cur_ref.stack.check();
        if check != StackCheck::Ok {
            let reason = match check {
                StackCheck::Overflow => AlarmReason::StackOverflow,
                StackCheck::Underflow => AlarmReason::StackUnderflow,
                _ => AlarmReason::StackCorrupted,
            };
            match alarm(reason) {
                AlarmAction::KillTask => {
                    cur_ref.detach_from_sync();
                    s.irq_remove_by_task(cur);
                    cur_ref.state = State::Inactive;
                    s.cur = None;
                }
                AlarmAction::RestartTask => {
                    cur_ref.stack.instrument(cfg!(feature = "watch-stack"));
                    cur_ref.reprepare_stack();
                }
                AlarmAction::Continue | AlarmAction::Crash => {}
            }
        }
    }

    #[cfg(feature = "irq-fast-switch")]
    if s.irq_event {
        s.activate_irq_tasks();
    }

    s.select_next_task();

    match s.cur {
        Some(cur) => {
            let cur_ref = unsafe { &mut *cur.as_ptr() };
            #[cfg(feature = "mpu")]
            port::mpu_set_proc_mine(cur_ref.stack.margin() as usize);
            port::set_thread_privileged(cur_ref.mode == Mode::Privileged);
            cur_ref.switch_cpu_tick = port::cycle_count();
            cur_ref.stack.top
        }
        None => new_sp,
    }
}

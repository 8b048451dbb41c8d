//! Host-side kernel tests
//!
//! These run on the host through the stub port: execution is always
//! privileged thread mode, a requested context switch only sets a flag,
//! and the test drives the tick and switch entry points itself, playing
//! the role of whichever task is current.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex as StdMutex, MutexGuard as StdGuard};

use macs::kernel::sched::{macs_switch_context, macs_tick_handler};
use macs::port::take_switch_request;
use macs::{
    priority, sched, task, AlarmAction, AlarmReason, Error, Event, MessageQueue, Mode, Mutex,
    Semaphore, State, Task, TaskIrq, UnblockReason, INFINITE_TIMEOUT,
};

// The kernel is process-wide state; tests take this lock and re-initialize.
static KERNEL_LOCK: StdMutex<()> = StdMutex::new(());

static LAST_ALARM: AtomicU32 = AtomicU32::new(u32::MAX);
static ALARM_ACTION: AtomicU32 = AtomicU32::new(0);

fn recording_alarm_handler(reason: AlarmReason) -> AlarmAction {
    LAST_ALARM.store(reason as u32, Ordering::SeqCst);
    match ALARM_ACTION.load(Ordering::SeqCst) {
        2 => AlarmAction::KillTask,
        1 => AlarmAction::RestartTask,
        _ => AlarmAction::Continue,
    }
}

fn last_alarm() -> Option<AlarmReason> {
    match LAST_ALARM.load(Ordering::SeqCst) {
        x if x == AlarmReason::StackCorrupted as u32 => Some(AlarmReason::StackCorrupted),
        x if x == AlarmReason::StackOverflow as u32 => Some(AlarmReason::StackOverflow),
        x if x == AlarmReason::StackUnderflow as u32 => Some(AlarmReason::StackUnderflow),
        x if x == AlarmReason::SchedNotOnPause as u32 => Some(AlarmReason::SchedNotOnPause),
        x if x == AlarmReason::NestedMutexLock as u32 => Some(AlarmReason::NestedMutexLock),
        x if x == AlarmReason::OwnedMutexDestroyed as u32 => {
            Some(AlarmReason::OwnedMutexDestroyed)
        }
        u32::MAX => None,
        _ => Some(AlarmReason::AssertFailed),
    }
}

fn setup() -> StdGuard<'static, ()> {
    let guard = KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    LAST_ALARM.store(u32::MAX, Ordering::SeqCst);
    ALARM_ACTION.store(0, Ordering::SeqCst);
    macs::set_alarm_handler(Some(recording_alarm_handler));
    macs::initialize().expect("kernel init");
    take_switch_request();
    guard
}

fn noop_body(_: *mut ()) {}

/// Leak a task with a 256-word stack and add it at `prio`.
fn spawn(name: &'static str, prio: u8) -> NonNull<Task> {
    let t: &'static mut Task = Box::leak(Box::new(Task::new(Some(name), noop_body)));
    let stack: &'static mut [u32] = Box::leak(vec![0u32; 256].into_boxed_slice());
    let ptr = NonNull::from(&mut *t);
    task::add(t, stack, prio, Mode::Privileged).expect("task add");
    ptr
}

/// Drive the deferred context switch the way PendSV would.
fn switch() {
    let sp = match task::current() {
        Some(cur) => unsafe { cur.as_ref() }.stack().saved_sp(),
        None => core::ptr::null_mut(),
    };
    unsafe { macs_switch_context(sp) };
}

/// One SysTick: advance time, switch if the handler asks for it.
fn tick() {
    if macs_tick_handler() {
        switch();
    }
}

fn current_priority() -> u8 {
    unsafe { task::current().expect("no current task").as_ref() }.priority()
}

fn state_of(t: NonNull<Task>) -> State {
    unsafe { t.as_ref() }.state()
}

fn reason_of(t: NonNull<Task>) -> UnblockReason {
    unsafe { t.as_ref() }.unblock_reason()
}

#[test]
fn init_and_start_lifecycle() {
    let _g = setup();

    assert!(sched::is_initialized());
    assert!(!sched::is_started());
    // The idle task is the safety net present from init.
    assert_eq!(sched::tasks_qty(), 1);

    sched::start(true).expect("start");
    assert!(sched::is_started());
    assert_eq!(current_priority(), priority::IDLE);

    assert_eq!(sched::start(true), Err(Error::InvalidState));
}

#[test]
fn add_preempts_lower_priority_current() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));
    assert_eq!(state_of(a), State::Running);

    let b = spawn("b", priority::HIGH);
    assert!(take_switch_request());
    switch();
    assert_eq!(task::current(), Some(b));
    assert_eq!(state_of(a), State::Ready);
}

#[test]
fn equal_priority_add_goes_after_current() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    // An equal-priority entrant does not preempt...
    let b = spawn("b", priority::NORMAL);
    assert!(!take_switch_request());
    // ...but the tick boundary rotates between equals.
    tick();
    assert_eq!(task::current(), Some(b));
    tick();
    assert_eq!(task::current(), Some(a));
}

#[test]
fn yield_rotates_equal_priorities() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    let b = spawn("b", priority::NORMAL);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    task::yield_now();
    assert!(take_switch_request());
    switch();
    assert_eq!(task::current(), Some(b));

    task::yield_now();
    switch();
    assert_eq!(task::current(), Some(a));
}

#[test]
fn timed_wakes_fire_in_wakeup_order() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    let b = spawn("b", priority::NORMAL);
    let c = spawn("c", priority::NORMAL);
    sched::start(true).expect("start");

    // Issue delays in the order 100, 50, 75 from the respective tasks.
    assert_eq!(task::current(), Some(a));
    task::delay(100).expect("delay");
    switch();
    assert_eq!(task::current(), Some(b));
    task::delay(50).expect("delay");
    switch();
    assert_eq!(task::current(), Some(c));
    task::delay(75).expect("delay");
    switch();
    assert_eq!(current_priority(), priority::IDLE);

    for _ in 0..49 {
        tick();
    }
    assert_eq!(state_of(b), State::Blocked);

    // t = 50: the second sleeper wakes and, outranking idle, runs.
    tick();
    assert_eq!(task::current(), Some(b));
    assert_eq!(reason_of(b), UnblockReason::Timeout);
    assert_eq!(state_of(c), State::Blocked);
    assert_eq!(state_of(a), State::Blocked);

    // t = 75: the third sleeper.
    for _ in 0..25 {
        tick();
    }
    assert_eq!(task::current(), Some(c));
    assert_eq!(reason_of(c), UnblockReason::Timeout);
    assert_eq!(state_of(a), State::Blocked);

    // t = 100: the first sleeper.
    for _ in 0..25 {
        tick();
    }
    assert_eq!(reason_of(a), UnblockReason::Timeout);
    assert_ne!(state_of(a), State::Blocked);
}

#[test]
fn early_unblock_leaves_no_stale_timeout() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    assert_eq!(task::current(), Some(a));
    task::delay(1000).expect("delay");
    switch();
    assert_eq!(state_of(a), State::Blocked);

    task::unblock(a).expect("unblock");
    assert_eq!(state_of(a), State::Ready);
    assert_eq!(reason_of(a), UnblockReason::Request);

    // The sleep queue no longer holds it: no timeout fires later.
    for _ in 0..1100 {
        tick();
    }
    assert_eq!(reason_of(a), UnblockReason::Request);
}

#[test]
fn pause_defers_preemption_until_resume() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    sched::pause(true).expect("pause");
    let h = spawn("h", priority::HIGH);
    assert!(!take_switch_request());

    // Ticks keep counting but do not switch while paused.
    let before = sched::tick_count();
    assert!(!macs_tick_handler());
    assert_eq!(sched::tick_count(), before + 1);

    sched::pause(false).expect("resume");
    assert!(take_switch_request());
    switch();
    assert_eq!(task::current(), Some(h));

    // Resuming a scheduler that is not paused is a diagnostic.
    assert_eq!(sched::pause(false), Err(Error::InvalidState));
    assert_eq!(last_alarm(), Some(AlarmReason::SchedNotOnPause));
}

#[test]
fn cooperative_mode_switches_only_on_yield() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(false).expect("start");
    assert_eq!(task::current(), Some(a));

    let h = spawn("h", priority::HIGH);
    assert!(!take_switch_request());
    assert!(!macs_tick_handler());
    assert_eq!(task::current(), Some(a));

    task::yield_now();
    assert!(take_switch_request());
    switch();
    assert_eq!(task::current(), Some(h));
}

#[test]
fn set_priority_reorders_and_preempts() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    let b = spawn("b", priority::LOW);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    // Same value is a no-op.
    task::set_priority(b, priority::LOW).expect("set");
    assert!(!take_switch_request());

    task::set_priority(b, priority::HIGH).expect("set");
    assert!(take_switch_request());
    switch();
    assert_eq!(task::current(), Some(b));
    assert_eq!(unsafe { b.as_ref() }.priority(), priority::HIGH);
}

#[test]
fn remove_detaches_task() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    let b = spawn("b", priority::LOW);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));
    assert_eq!(sched::tasks_qty(), 3);

    task::remove(b).expect("remove");
    assert_eq!(state_of(b), State::Inactive);
    assert_eq!(sched::tasks_qty(), 2);

    // Removing again is an error.
    assert_eq!(task::remove(b), Err(Error::InvalidState));

    // Self-removal requests the immediate switch.
    task::remove(a).expect("remove self");
    assert!(take_switch_request());
    switch();
    assert_eq!(current_priority(), priority::IDLE);
    assert_eq!(sched::tasks_qty(), 1);
}

#[test]
fn semaphore_counting_and_bounds() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    let sem = Semaphore::new(0, 2);
    assert_eq!(sem.wait(0), Err(Error::Timeout));

    sem.signal().expect("signal");
    sem.signal().expect("signal");
    assert_eq!(sem.count(), 2);
    // Signaling a full semaphore is a state error.
    assert_eq!(sem.signal(), Err(Error::InvalidState));

    sem.wait(INFINITE_TIMEOUT).expect("wait");
    assert_eq!(sem.count(), 1);

    // signal-then-wait round trip leaves the count unchanged.
    let before = sem.count();
    sem.signal().expect("signal");
    sem.wait(INFINITE_TIMEOUT).expect("wait");
    assert_eq!(sem.count(), before);
}

#[test]
fn semaphore_signal_transfers_token_to_waiter() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    let _b = spawn("b", priority::LOW);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    let sem = Semaphore::binary(true);
    sem.wait(INFINITE_TIMEOUT).expect("wait blocks");
    switch();
    assert_eq!(state_of(a), State::Blocked);
    assert_ne!(task::current(), Some(a));

    sem.signal().expect("signal");
    // The waiter got the token directly: the count never moved.
    assert_eq!(sem.count(), 0);
    assert_eq!(state_of(a), State::Ready);
    assert_eq!(reason_of(a), UnblockReason::Request);
}

#[test]
fn semaphore_wait_times_out() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    let sem = Semaphore::binary(true);
    sem.wait(10).expect("wait blocks");
    switch();
    assert_eq!(state_of(a), State::Blocked);

    for _ in 0..10 {
        tick();
    }
    assert_eq!(state_of(a), State::Running);
    assert_eq!(task::current(), Some(a));
    assert_eq!(reason_of(a), UnblockReason::Timeout);
    // No waiter left behind: a later signal banks a token.
    sem.signal().expect("signal");
    assert_eq!(sem.count(), 1);
}

#[test]
fn broadcast_event_wakes_all_in_priority_order() {
    let _g = setup();
    let tasks: Vec<NonNull<Task>> = [10u8, 20, 30, 40, 50]
        .iter()
        .map(|&p| spawn("w", p))
        .collect();
    sched::start(true).expect("start");

    let event = Event::new(true);

    // Each task becomes current in descending priority order and waits.
    for _ in 0..5 {
        event.wait(INFINITE_TIMEOUT).expect("wait");
        switch();
    }
    assert_eq!(current_priority(), priority::IDLE);
    for &t in &tasks {
        assert_eq!(state_of(t), State::Blocked);
    }

    event.raise().expect("raise");
    for &t in &tasks {
        assert_eq!(state_of(t), State::Ready);
        assert_eq!(reason_of(t), UnblockReason::Request);
    }

    // The ready queue drains highest-priority first.
    let mut woken = Vec::new();
    for _ in 0..5 {
        switch();
        woken.push(current_priority());
        task::delay(INFINITE_TIMEOUT).expect("park");
    }
    assert_eq!(woken, [50, 40, 30, 20, 10]);

    // Non-sticky: with nobody waiting the raise was consumed.
    switch();
    assert_eq!(event.wait(0), Err(Error::Timeout));
}

#[test]
fn unicast_event_wakes_only_front_waiter() {
    let _g = setup();
    let lo = spawn("lo", priority::LOW);
    let hi = spawn("hi", priority::HIGH);
    sched::start(true).expect("start");

    let event = Event::new(false);
    assert_eq!(task::current(), Some(hi));
    event.wait(INFINITE_TIMEOUT).expect("wait");
    switch();
    assert_eq!(task::current(), Some(lo));
    event.wait(INFINITE_TIMEOUT).expect("wait");
    switch();

    event.raise().expect("raise");
    assert_eq!(state_of(hi), State::Ready);
    assert_eq!(state_of(lo), State::Blocked);
}

#[test]
fn event_wait_zero_times_out_immediately() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    let event = Event::new(true);
    assert_eq!(event.wait(0), Err(Error::Timeout));
}

#[test]
fn recursive_mutex_nests() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    let m = Mutex::recursive();
    m.lock(INFINITE_TIMEOUT).expect("lock");
    m.lock(INFINITE_TIMEOUT).expect("relock");
    m.lock(INFINITE_TIMEOUT).expect("relock");
    assert_eq!(m.lock_count(), 3);

    m.unlock().expect("unlock");
    m.unlock().expect("unlock");
    assert!(m.is_locked());
    m.unlock().expect("unlock");
    assert!(!m.is_locked());
    assert_eq!(m.lock_count(), 0);
}

#[test]
fn nonrecursive_mutex_rejects_nested_lock() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    let m = Mutex::new();
    m.lock(INFINITE_TIMEOUT).expect("lock");
    assert_eq!(m.lock(INFINITE_TIMEOUT), Err(Error::InvalidState));
    assert_eq!(last_alarm(), Some(AlarmReason::NestedMutexLock));
    m.unlock().expect("unlock");
}

#[test]
fn mutex_unlock_requires_ownership() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    let _b = spawn("b", priority::LOW);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(a));

    let m = Mutex::new();
    assert_eq!(m.unlock(), Err(Error::InvalidState));

    m.lock(INFINITE_TIMEOUT).expect("lock");
    task::delay(INFINITE_TIMEOUT).expect("park owner");
    switch();
    // The other task is current now and does not own the mutex.
    assert_ne!(task::current(), Some(a));
    assert_eq!(m.unlock(), Err(Error::InvalidState));
}

#[test]
fn contended_lock_with_zero_timeout_keeps_priorities() {
    let _g = setup();
    let lo = spawn("lo", priority::LOW);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(lo));

    let m = Mutex::new();
    m.lock(INFINITE_TIMEOUT).expect("lock");

    let hi = spawn("hi", priority::HIGH);
    switch();
    assert_eq!(task::current(), Some(hi));

    assert_eq!(m.lock(0), Err(Error::Timeout));
    assert_eq!(unsafe { lo.as_ref() }.priority(), priority::LOW);
    assert_eq!(unsafe { hi.as_ref() }.priority(), priority::HIGH);
}

#[cfg(feature = "pi")]
#[test]
fn priority_inheritance_boosts_and_reverts() {
    let _g = setup();
    let l = spawn("l", 10);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(l));

    let x = Mutex::new();
    x.lock(INFINITE_TIMEOUT).expect("lock");

    let m = spawn("m", 20);
    let h = spawn("h", 50);
    switch();
    assert_eq!(task::current(), Some(h));

    // H contends: L inherits priority 50.
    x.lock(INFINITE_TIMEOUT).expect("lock blocks");
    assert_eq!(state_of(h), State::Blocked);
    assert_eq!(unsafe { l.as_ref() }.priority(), 50);
    assert_eq!(x.owner_priority(), Some(50));

    // The boosted owner outranks M and runs next.
    switch();
    assert_eq!(task::current(), Some(l));

    // Unlock hands the mutex to H and reverts L.
    x.unlock().expect("unlock");
    assert_eq!(unsafe { l.as_ref() }.priority(), 10);
    assert_eq!(state_of(h), State::Ready);
    assert_eq!(reason_of(h), UnblockReason::Request);
    assert_eq!(x.owner_priority(), Some(50));

    switch();
    assert_eq!(task::current(), Some(h));
    x.unlock().expect("unlock");
    assert!(!x.is_locked());
    let _ = m;
}

#[cfg(feature = "pi")]
#[test]
fn waiter_timeout_recomputes_inherited_priority() {
    let _g = setup();
    let l = spawn("l", 10);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(l));

    let x = Mutex::new();
    x.lock(INFINITE_TIMEOUT).expect("lock");

    let h = spawn("h", 50);
    switch();
    assert_eq!(task::current(), Some(h));
    x.lock(20).expect("lock blocks");
    assert_eq!(unsafe { l.as_ref() }.priority(), 50);

    // The waiter gives up: the boost ends with it.
    for _ in 0..20 {
        tick();
    }
    assert_eq!(reason_of(h), UnblockReason::Timeout);
    assert_eq!(unsafe { l.as_ref() }.priority(), 10);
    assert!(x.is_locked());
}

#[test]
fn mutex_transfers_to_highest_priority_waiter() {
    let _g = setup();
    let owner = spawn("owner", priority::NORMAL);
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(owner));

    let m = Mutex::new();
    m.lock(INFINITE_TIMEOUT).expect("lock");

    // Each contender blocks in turn; inheritance keeps handing the CPU
    // back to the owner.
    let w1 = spawn("w1", priority::ABOVE_NORMAL);
    switch();
    assert_eq!(task::current(), Some(w1));
    m.lock(INFINITE_TIMEOUT).expect("block");
    switch();
    assert_eq!(task::current(), Some(owner));

    let w2 = spawn("w2", priority::HIGH);
    switch();
    assert_eq!(task::current(), Some(w2));
    m.lock(INFINITE_TIMEOUT).expect("block");
    switch();
    assert_eq!(task::current(), Some(owner));

    m.unlock().expect("unlock");
    // Ownership goes to the highest-priority waiter, not FIFO arrival.
    assert_eq!(state_of(w2), State::Ready);
    assert_eq!(state_of(w1), State::Blocked);
    assert_eq!(m.owner_priority(), Some(priority::HIGH));
}

#[test]
fn dropping_owned_mutex_raises_alarm() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    {
        let m = Mutex::new();
        m.lock(INFINITE_TIMEOUT).expect("lock");
    }
    assert_eq!(last_alarm(), Some(AlarmReason::OwnedMutexDestroyed));
}

#[test]
fn bounded_queue_fills_drains_and_peeks() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    // 4 ring slots: capacity 3.
    let q: MessageQueue<u32, 4> = MessageQueue::new();
    assert_eq!(q.max_size(), 3);

    q.push(1, 0).expect("push");
    q.push(2, 0).expect("push");
    q.push(3, 0).expect("push");
    assert_eq!(q.count(), 3);
    assert_eq!(q.push(4, 0), Err(Error::Timeout));

    assert_eq!(q.pop(0), Ok(1));
    q.push(4, 0).expect("push");

    assert_eq!(q.peek(0), Ok(2));
    assert_eq!(q.count(), 3);

    assert_eq!(q.pop(0), Ok(2));
    assert_eq!(q.pop(0), Ok(3));
    assert_eq!(q.pop(0), Ok(4));
    assert_eq!(q.pop(0), Err(Error::Timeout));
}

#[test]
fn queue_push_front_jumps_the_line() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    let q: MessageQueue<u32, 4> = MessageQueue::new();
    q.push(1, 0).expect("push");
    q.push_front(2, 0).expect("push front");
    assert_eq!(q.pop(0), Ok(2));
    assert_eq!(q.pop(0), Ok(1));
}

#[test]
fn queue_capacity_one_alternates() {
    let _g = setup();
    let _a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    let q: MessageQueue<u32, 2> = MessageQueue::new();
    for i in 0..32 {
        q.push(i, 0).expect("push");
        assert_eq!(q.push(i, 0), Err(Error::Timeout));
        assert_eq!(q.pop(0), Ok(i));
    }
    assert_eq!(q.pop(0), Err(Error::Timeout));
}

#[test]
fn stack_overflow_kills_task_when_asked_to() {
    let _g = setup();
    ALARM_ACTION.store(2, Ordering::SeqCst); // KillTask

    let t: &'static mut Task = Box::leak(Box::new(Task::new(Some("victim"), noop_body)));
    let stack: &'static mut [u32] = Box::leak(vec![0u32; 256].into_boxed_slice());
    let stack_base = stack.as_mut_ptr();
    let victim = NonNull::from(&mut *t);
    task::add(t, stack, priority::NORMAL, Mode::Privileged).expect("add");
    sched::start(true).expect("start");
    assert_eq!(task::current(), Some(victim));

    // Bank an SP inside the guard zone, as an overflowing task would.
    unsafe { macs_switch_context(stack_base.add(3)) };

    assert_eq!(last_alarm(), Some(AlarmReason::StackOverflow));
    assert_eq!(state_of(victim), State::Inactive);
    assert_eq!(current_priority(), priority::IDLE);
    assert_eq!(sched::tasks_qty(), 1);
}

#[test]
fn clobbered_guard_word_reports_corruption() {
    let _g = setup();
    ALARM_ACTION.store(2, Ordering::SeqCst);

    let t: &'static mut Task = Box::leak(Box::new(Task::new(Some("victim"), noop_body)));
    let stack: &'static mut [u32] = Box::leak(vec![0u32; 256].into_boxed_slice());
    let stack_base = stack.as_mut_ptr();
    let victim = NonNull::from(&mut *t);
    task::add(t, stack, priority::NORMAL, Mode::Privileged).expect("add");
    sched::start(true).expect("start");

    // Scribble over the guard marker at the margin.
    unsafe { stack_base.add(16).write(0) };
    switch();

    assert_eq!(last_alarm(), Some(AlarmReason::StackCorrupted));
    assert_eq!(state_of(victim), State::Inactive);
}

#[test]
fn irq_task_wakes_on_proceed_irq() {
    let _g = setup();

    fn irq_handler(_: *mut ()) {}
    let t: &'static mut TaskIrq =
        Box::leak(Box::new(TaskIrq::new(Some("uart"), irq_handler)));
    let stack: &'static mut [u32] = Box::leak(vec![0u32; 256].into_boxed_slice());
    let base = NonNull::from(&mut *t.base_mut());
    task::add_irq(t, 5, stack, priority::HIGH, Mode::Privileged).expect("add irq");
    sched::start(true).expect("start");

    // Added blocked, waiting for its interrupt.
    assert_eq!(state_of(base), State::Blocked);
    assert_eq!(current_priority(), priority::IDLE);

    sched::proceed_irq(5);
    if take_switch_request() {
        switch();
    } else {
        tick();
    }

    assert_eq!(state_of(base), State::Running);
    assert_eq!(reason_of(base), UnblockReason::Irq);
    assert_eq!(task::current(), Some(base));
}

#[test]
fn ticks_advance_time_and_wall_clock() {
    let _g = setup();

    let before_ms = macs::clock::uptime_ms();
    let before_ticks = sched::tick_count();
    for _ in 0..5 {
        tick();
    }
    assert_eq!(sched::tick_count(), before_ticks + 5);
    assert_eq!(macs::clock::uptime_ms(), before_ms + 5);
}

#[test]
fn preconditions_are_enforced() {
    let _g = setup();

    // Before start, sync primitives refuse to operate.
    let sem = Semaphore::binary(true);
    assert_eq!(sem.wait(0), Err(Error::InvalidState));
    assert_eq!(sem.signal(), Err(Error::InvalidState));
    let ev = Event::new(true);
    assert_eq!(ev.raise(), Err(Error::InvalidState));

    // Out-of-range priority is rejected.
    let t: &'static mut Task = Box::leak(Box::new(Task::new(None, noop_body)));
    let stack: &'static mut [u32] = Box::leak(vec![0u32; 256].into_boxed_slice());
    assert_eq!(
        task::add(t, stack, priority::MAX + 1, Mode::Privileged),
        Err(Error::InvalidArgs)
    );

    // An undersized stack is rejected.
    let t2: &'static mut Task = Box::leak(Box::new(Task::new(None, noop_body)));
    let small: &'static mut [u32] = Box::leak(vec![0u32; 8].into_boxed_slice());
    assert_eq!(
        task::add(t2, small, priority::NORMAL, Mode::Privileged),
        Err(Error::InvalidArgs)
    );
}

#[test]
fn stack_usage_reports_watermark_after_instrument() {
    let _g = setup();
    let a = spawn("a", priority::NORMAL);
    sched::start(true).expect("start");

    let t = unsafe { &mut *a.as_ptr() };
    t.instrument_stack();
    // Only the prepared first-dispatch frame sits above the banked SP.
    assert!(t.stack_usage() <= 18);
    assert_eq!(t.stack_len(), 256 - 16);
}

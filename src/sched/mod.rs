//! Thread scheduling
//!
//! Public surface of the scheduler: thread creation and lifecycle
//! ([`create`], [`wakeup`], [`sleep`], [`exit`]), the preemption machinery
//! ([`reschedule`], the preemption counter), the timer hook ([`tick`]) and
//! per-CPU bring-up ([`bootstrap`], [`ap_bootstrap`], [`setup`], [`run`]).
//!
//! Scheduling classes are dispatched in priority order: real-time
//! ([`rt`]), time-sharing ([`ts`]), idle ([`idle`]). The time-sharing class
//! merges proportional-share local scheduling with distributed weighted
//! round-robin balancing ([`balance`]); both work on the same per-CPU run
//! queues ([`runq`]).

mod balance;
mod idle;
mod runq;
mod rt;
mod thread;
mod ts;

pub use rt::{RR_TIME_SLICE, RT_PRIO_MAX, RT_PRIO_MIN};
pub use thread::{
    SchedClass, SchedPolicy, Thread, ThreadAttr, ThreadFlags, ThreadId, ThreadRef, ThreadState,
    THREAD_NAME_LEN,
};
pub use ts::{
    prio_to_weight, TS_INITIAL_ROUND, TS_PRIO_DEFAULT, TS_PRIO_MAX, TS_ROUND_SLICE_BASE,
};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch;
use crate::mem::CachePadded;
use crate::sync::{Condition, Mutex, SpinGuard};
use crate::task;
use crate::Error;

/// Timer frequency, in ticks per second. The timer calls [`tick`] on every
/// CPU at this rate.
pub const HZ: u32 = 100;

/// System-wide value of the current highest round.
///
/// Accessed without synchronization beyond the relaxed atomic: a slightly
/// stale value degrades balancing fairness, never correctness. Padded to a
/// full cache line since every balancer touches it.
static TS_HIGHEST_ROUND: CachePadded<AtomicU32> =
    CachePadded::new(AtomicU32::new(ts::TS_INITIAL_ROUND));

pub(crate) fn highest_round() -> u32 {
    TS_HIGHEST_ROUND.load(Ordering::Relaxed)
}

pub(crate) fn publish_highest_round(round: u32) {
    TS_HIGHEST_ROUND.store(round, Ordering::Relaxed);
}

/// Threads pending destruction by the reaper.
static REAP_LIST: Mutex<Vec<ThreadRef>> = Mutex::new(Vec::new());
static REAP_CONDITION: Condition = Condition::new();

fn current_thread_ptr() -> *const Thread {
    arch::current_thread() as *const Thread
}

/// The currently running thread.
///
/// The raw per-CPU pointer always designates the thread executing on this
/// CPU; a running thread cannot be destroyed (the reaper synchronizes on
/// its run-queue lock first), so reconstructing a reference is sound.
pub fn current() -> ThreadRef {
    let ptr = current_thread_ptr();
    assert!(!ptr.is_null(), "thread: scheduler not bootstrapped");

    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

/// Disable preemption for the current thread. Nestable; a no-op before the
/// CPU has a thread context.
pub fn preempt_disable() {
    let ptr = current_thread_ptr();
    if !ptr.is_null() {
        unsafe { &*ptr }.preempt_add();
    }
}

/// Re-enable preemption, servicing a pending reschedule if the counter
/// drops to zero.
pub fn preempt_enable() {
    let ptr = current_thread_ptr();
    if !ptr.is_null() && unsafe { &*ptr }.preempt_sub() == 0 {
        reschedule();
    }
}

/// Re-enable preemption without checking for a pending reschedule. Used on
/// paths that just came out of the scheduler.
pub fn preempt_enable_no_resched() {
    let ptr = current_thread_ptr();
    if !ptr.is_null() {
        unsafe { &*ptr }.preempt_sub();
    }
}

/// Whether preemption is enabled for the current context.
pub fn preempt_enabled() -> bool {
    let ptr = current_thread_ptr();
    !ptr.is_null() && unsafe { &*ptr }.preempt_level() == 0
}

/// Forbid migrating the current thread to another processor. Nestable.
pub fn pin() {
    current().pin_add();
}

/// Allow migration again.
pub fn unpin() {
    current().pin_sub();
}

pub(crate) fn current_pinned() -> bool {
    let ptr = current_thread_ptr();
    !ptr.is_null() && unsafe { &*ptr }.pinned() != 0
}

/// Common entry trampoline for every thread.
///
/// First dispatch runs with interrupts disabled, preemption disabled and
/// the local run-queue lock held (the preemption counter is 2); this is
/// where that state is unwound.
extern "C" fn thread_main() -> ! {
    debug_assert!(!arch::intr_enabled());
    debug_assert!(!preempt_enabled());

    drop(unsafe { runq::local_runq().lock.adopt() });
    arch::intr_enable();
    preempt_enable();

    let thread = current();
    let (entry, arg) = match thread.entry() {
        Some(entry) => entry,
        None => panic!("thread: dispatched a thread without an entry point"),
    };
    drop(thread);

    entry(arg);
    exit();
}

/// Create a thread and make it runnable.
///
/// The only runtime error is allocation failure; every other misuse is a
/// programming error and panics.
pub fn create(attr: &ThreadAttr, entry: fn(usize), arg: usize) -> Result<ThreadRef, Error> {
    let thread = Thread::new(attr, entry, arg)?;
    wakeup(&thread);
    Ok(thread)
}

/// Make a thread runnable.
///
/// Safe against concurrent wakeups; only the one that observes the thread
/// sleeping enqueues it. The target run queue is chosen by the thread's
/// scheduling class.
pub fn wakeup(thread: &ThreadRef) {
    if thread.runq_cpu().is_none() {
        // Never dispatched: there is at most one reference to the thread,
        // nothing to lock.
        debug_assert_ne!(thread.state(), ThreadState::Running);
        thread.set_state(ThreadState::Running);
    } else {
        let (_rq, guard, flags) = runq::lock_thread_runq(thread);

        if thread.state() == ThreadState::Running {
            guard.unlock_intr_restore(flags);
            return;
        }

        thread.set_state(ThreadState::Running);
        guard.unlock_intr_restore(flags);
    }

    preempt_disable();
    let flags = arch::intr_save();

    // The returned run queue is locked
    let (rq, mut guard) = match thread.class() {
        SchedClass::RealTime => {
            let rq = runq::local_runq();
            (rq, rq.lock.lock())
        }
        SchedClass::TimeSharing => ts::select_runq(),
        SchedClass::Idle => idle::select_runq(),
    };

    runq::runq_wakeup(rq, &mut *guard, thread);
    drop(guard);
    arch::intr_restore(flags);
    preempt_enable();
}

/// Put the current thread to sleep, atomically releasing `interlock`.
///
/// The interlock is released under the run-queue lock (the monitor
/// hand-off): a waker that acquires the interlock and then calls
/// [`wakeup`] cannot slip between the release and the sleep. It is
/// re-acquired before returning.
///
/// The caller must guarantee that a reference to the current thread is
/// held by whatever object will wake it (a wait queue, typically) for the
/// whole sleep.
pub fn sleep<'a, T>(interlock: SpinGuard<'a, T>) -> SpinGuard<'a, T> {
    preempt_disable();
    let flags = arch::intr_save();

    let rq = runq::local_runq();
    let guard = rq.lock.lock();

    let interlock = interlock.into_lock();

    guard.current.set_state(ThreadState::Sleeping);

    let (_rq, guard) = runq::schedule(rq, guard);
    debug_assert_eq!(guard.current.state(), ThreadState::Running);

    drop(guard);
    arch::intr_restore(flags);
    preempt_enable();

    interlock.lock()
}

/// Terminate the current thread. Never returns.
///
/// Destruction is handed to the reaper so it happens off this thread's
/// critical path; preemption is disabled before the reap list is unlocked
/// so the thread becomes dead as soon as possible, since the reaper
/// actively polls the state.
pub fn exit() -> ! {
    let thread = current();

    {
        let mut reap_list = REAP_LIST.lock();
        reap_list.push(thread.clone());
        REAP_CONDITION.signal();

        preempt_disable();
    }

    drop(thread);

    let _flags = arch::intr_save();
    let rq = runq::local_runq();
    let guard = rq.lock.lock();

    guard.current.set_state(ThreadState::Dead);

    let (_rq, _guard) = runq::schedule(rq, guard);
    panic!("thread: dead thread running");
}

/// Service a pending reschedule request, if preemption allows it.
///
/// Called whenever the preemption counter drops to zero, and from the
/// return path of the reschedule IPI.
pub fn reschedule() {
    let ptr = current_thread_ptr();
    if ptr.is_null() {
        return;
    }

    let thread = unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    };

    if !thread.test_flag(ThreadFlags::RESCHEDULE) || !preempt_enabled() {
        return;
    }

    loop {
        preempt_disable();
        let flags = arch::intr_save();

        let rq = runq::local_runq();
        let guard = rq.lock.lock();
        let (_rq, guard) = runq::schedule(rq, guard);
        drop(guard);

        arch::intr_restore(flags);
        preempt_enable_no_resched();

        if !thread.test_flag(ThreadFlags::RESCHEDULE) {
            break;
        }
    }
}

/// Reschedule IPI handler: mark the running thread for rescheduling. The
/// interrupt return path services it.
pub fn reschedule_intr() {
    let ptr = current_thread_ptr();
    if !ptr.is_null() {
        unsafe { &*ptr }.set_flag(ThreadFlags::RESCHEDULE);
    }
}

/// Timer tick, called at `HZ` on every CPU with interrupts and preemption
/// disabled by the interrupt entry path.
pub fn tick() {
    debug_assert!(!arch::intr_enabled());
    debug_assert!(!preempt_enabled());

    let rq = runq::local_runq();
    let mut guard = rq.lock.lock();

    if guard.nr_threads == 0 {
        balance::idle_tick(rq, &mut *guard);
    } else {
        let current = guard.current.clone();
        match current.class() {
            SchedClass::RealTime => rt::tick(&current),
            SchedClass::TimeSharing => ts::tick(&mut *guard, &current),
            SchedClass::Idle => (),
        }
    }
}

/// First dispatch on this CPU. Enters the scheduler and never returns; the
/// booter context is abandoned.
pub fn run() -> ! {
    assert!(arch::intr_enabled());

    let thread = current();
    debug_assert_eq!(thread.preempt_level(), 1);
    drop(thread);

    arch::intr_disable();

    let rq = runq::local_runq();
    let mut guard = rq.lock.lock();
    let next = runq::runq_get_next(&mut *guard);

    if !Arc::ptr_eq(next.task(), task::kernel_task()) {
        task::load_address_space(next.task());
    }

    let tcb = next.tcb_ptr();
    drop(next);
    guard.leak();

    unsafe { arch::tcb::load(tcb) }
}

/// Poll a dying thread off-CPU, then release its resources.
///
/// Acquiring the owning run-queue lock is the synchronization point: the
/// dead state is set under that lock right before the final switch, and
/// the lock is only released once the switch has completed, so observing
/// `Dead` under the lock proves the thread's stack is no longer in use.
fn destroy(thread: ThreadRef) {
    loop {
        let (_rq, guard, flags) = runq::lock_thread_runq(&thread);
        let state = thread.state();
        guard.unlock_intr_restore(flags);

        if state == ThreadState::Dead {
            break;
        }

        core::hint::spin_loop();
    }

    task::remove_thread(thread.task(), &thread);
    log::trace!("thread: reaped {:?}", thread.id());

    // Last reference: stack and thread structure are freed here
    drop(thread);
}

fn reaper_main(_arg: usize) {
    loop {
        let mut reap_list = REAP_LIST.lock();

        while reap_list.is_empty() {
            reap_list = REAP_CONDITION.wait(reap_list);
        }

        let dying = core::mem::take(&mut *reap_list);
        drop(reap_list);

        for thread in dying {
            destroy(thread);
        }
    }
}

fn setup_reaper() {
    let attr = ThreadAttr {
        task: Some(task::kernel_task().clone()),
        name: Some("reaper"),
        policy: SchedPolicy::TimeSharing,
        priority: ts::TS_PRIO_DEFAULT,
    };

    if create(&attr, reaper_main, 0).is_err() {
        panic!("thread: unable to create reaper thread");
    }
}

fn bootstrap_common() {
    let cpu = arch::cpu_id();
    let rq = runq::runq(cpu);

    // Read the bootstrap shim's address with the CPU's thread context still
    // unset, then install it, so preemption accounting stays symmetric: the
    // booter keeps the counter at 1 until the first dispatch.
    let booter = {
        let flags = arch::intr_save();
        let guard = rq.lock.lock();
        let ptr = Arc::as_ptr(&guard.current);
        guard.unlock_intr_restore(flags);
        ptr
    };

    arch::set_current_thread(booter as *mut u8);

    log::debug!("thread: cpu {} bootstrapped", cpu);
}

/// Give the boot processor a thread context. Must run before anything that
/// may touch the scheduler.
pub fn bootstrap() {
    bootstrap_common();
}

/// Give an application processor a thread context.
pub fn ap_bootstrap() {
    bootstrap_common();
}

/// Create the system threads: the reaper, then one balancer and one idler
/// per CPU. Called once on the boot processor, after the allocator is up
/// and before [`run`].
pub fn setup() {
    setup_reaper();

    for cpu in 0..arch::cpu_count() {
        let rq = runq::runq(cpu);
        balance::setup(rq);
        idle::setup(rq);
    }

    log::info!("thread: scheduler ready, {} cpus", arch::cpu_count());
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Mutex as StdMutex, MutexGuard as StdMutexGuard};

    static GLOBAL: StdMutex<()> = StdMutex::new(());

    /// Serialize tests that touch process-wide scheduler state (the highest
    /// round, the active-runqs bitmap, the static run queues), and enter
    /// them with interrupts disabled the way real run-queue users do.
    pub(crate) fn global_guard() -> StdMutexGuard<'static, ()> {
        crate::arch::intr_disable();
        // A previous test on this thread may have installed (and since
        // dropped) a current thread; start from a clean context.
        crate::arch::set_current_thread(core::ptr::null_mut());
        GLOBAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_highest_round(round: u32) {
        publish_highest_round(round);
    }

    pub(crate) fn kernel_thread(name: &str, policy: SchedPolicy, priority: u16) -> ThreadRef {
        let attr = ThreadAttr {
            task: Some(task::kernel_task().clone()),
            name: Some(name),
            policy,
            priority,
        };
        Thread::new(&attr, |_| {}, 0).expect("thread allocation failed")
    }

    pub(crate) fn ts_thread(name: &str, priority: u16) -> ThreadRef {
        kernel_thread(name, SchedPolicy::TimeSharing, priority)
    }

    // =========================================================================
    // Round Publication Tests
    // =========================================================================

    #[test]
    fn test_highest_round_publication() {
        let _serial = global_guard();

        set_highest_round(77);
        assert_eq!(highest_round(), 77);

        publish_highest_round(78);
        assert_eq!(highest_round(), 78);
    }

    // =========================================================================
    // Reaper Tests
    // =========================================================================

    #[test]
    fn test_destroy_releases_dead_thread() {
        let _serial = global_guard();

        let task = crate::task::Task::new("reap_test", None);
        let attr = ThreadAttr {
            task: Some(task.clone()),
            name: Some("dying"),
            policy: SchedPolicy::TimeSharing,
            priority: 0,
        };
        let thread = Thread::new(&attr, |_| {}, 0).unwrap();
        thread.set_state(ThreadState::Running);

        // Run the thread's lifecycle on a real run queue: enqueue, then
        // take it off as the exit path would.
        let rq = runq::runq(15);
        {
            let mut guard = rq.lock.lock();
            runq::runq_add(rq, &mut *guard, &thread);
            assert!(runq::active_runqs() & (1 << 15) != 0);

            thread.set_state(ThreadState::Dead);
            runq::runq_remove(rq, &mut *guard, &thread);
            assert!(runq::active_runqs() & (1 << 15) == 0);
        }

        assert_eq!(task.nr_threads(), 1);
        destroy(thread);
        assert_eq!(task.nr_threads(), 0);
    }

    #[test]
    fn test_signal_without_waiters_is_noop() {
        REAP_CONDITION.signal();
    }
}

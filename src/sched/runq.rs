//! Per-CPU run queues
//!
//! One run queue per processor, cache-line aligned, protected by a raw
//! spinlock that is only ever taken with local interrupts disabled.
//! Locking multiple run queues is done in ascending CPU index order,
//! even from remote processors, so the balancer's double-locking cannot
//! deadlock against wakeups.
//!
//! The run queue dispatches to the scheduling classes in priority order:
//! real-time, time-sharing, idle. The idle class is never empty, so
//! selection cannot fail.

use alloc::sync::Arc;
use core::sync::atomic::{fence, AtomicU32, Ordering};

use spin::Lazy;

use super::idle;
use super::rt::RtRunq;
use super::thread::{SchedClass, Thread, ThreadFlags, ThreadRef, ThreadState};
use super::ts::{self, TsRunq};
use crate::arch::{self, MAX_CPUS};
use crate::sync::{SpinGuard, SpinLock};
use crate::task;

/// Scheduler state of one processor.
///
/// The time-sharing round is set when the active sub-queue becomes
/// non-empty. It's not reset when both sub-queues drain, so it has a
/// meaningful value only while the total weight isn't zero.
pub(crate) struct RunqState {
    pub(crate) current: ThreadRef,
    pub(crate) nr_threads: u32,

    /// Real-time sub-queue.
    pub(crate) rt: RtRunq,

    /// Local round of the time-sharing class.
    pub(crate) ts_round: u32,
    /// Sum of both time-sharing sub-queues' weights.
    pub(crate) ts_weight: u32,
    pub(crate) ts_runqs: [TsRunq; 2],
    /// Index of the active sub-queue; the other one is expired.
    pub(crate) ts_active: usize,

    pub(crate) balancer: Option<ThreadRef>,
    pub(crate) idler: Option<ThreadRef>,

    /// Ticks before the next balancing attempt when the run queue is idle.
    pub(crate) idle_balance_ticks: u32,
}

impl RunqState {
    fn new(cpu: usize) -> Self {
        Self {
            current: Thread::new_booter(cpu),
            nr_threads: 0,
            rt: RtRunq::new(),
            ts_round: 0,
            ts_weight: 0,
            ts_runqs: [TsRunq::new(), TsRunq::new()],
            ts_active: 0,
            balancer: None,
            idler: None,
            idle_balance_ticks: u32::MAX,
        }
    }
}

/// A per-CPU run queue.
#[repr(align(64))]
pub(crate) struct RunQueue {
    pub(crate) id: usize,
    pub(crate) lock: SpinLock<RunqState>,
}

impl RunQueue {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            lock: SpinLock::new(RunqState::new(id)),
        }
    }
}

static RUNQS: Lazy<[RunQueue; MAX_CPUS]> = Lazy::new(|| core::array::from_fn(RunQueue::new));

/// Bitmap of run queues with at least one schedulable thread.
static ACTIVE_RUNQS: AtomicU32 = AtomicU32::new(0);

pub(crate) fn runq(cpu: usize) -> &'static RunQueue {
    &Lazy::force(&RUNQS)[cpu]
}

pub(crate) fn local_runq() -> &'static RunQueue {
    debug_assert!(!super::preempt_enabled() || super::current_pinned());
    runq(arch::cpu_id())
}

pub(crate) fn active_runqs() -> u32 {
    ACTIVE_RUNQS.load(Ordering::Relaxed)
}

/// Insert a thread through its class and account for it. Sets the
/// reschedule flag on the running thread if the newcomer's class outranks
/// it.
pub(crate) fn runq_add(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    debug_assert!(!arch::intr_enabled());

    match thread.class() {
        SchedClass::RealTime => {
            let current = state.current.clone();
            state.rt.add(&current, thread);
        }
        SchedClass::TimeSharing => ts::add(state, thread),
        SchedClass::Idle => idle::add(state, thread),
    }

    if state.nr_threads == 0 {
        ACTIVE_RUNQS.fetch_or(1 << rq.id, Ordering::Relaxed);
    }

    state.nr_threads += 1;

    if thread.class() < state.current.class() {
        state.current.set_flag(ThreadFlags::RESCHEDULE);
    }

    thread.set_runq_cpu(rq.id);
}

pub(crate) fn runq_remove(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    debug_assert!(!arch::intr_enabled());

    state.nr_threads -= 1;

    if state.nr_threads == 0 {
        ACTIVE_RUNQS.fetch_and(!(1 << rq.id), Ordering::Relaxed);
    }

    match thread.class() {
        SchedClass::RealTime => state.rt.remove(thread),
        SchedClass::TimeSharing => ts::remove(rq, state, thread),
        SchedClass::Idle => idle::remove(state, thread),
    }
}

pub(crate) fn runq_put_prev(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    match thread.class() {
        SchedClass::RealTime => {
            let current = state.current.clone();
            state.rt.put_prev(&current, thread);
        }
        SchedClass::TimeSharing => ts::put_prev(rq, state, thread),
        SchedClass::Idle => (),
    }
}

/// Pick the next thread to run, trying each class in priority order. The
/// idle class always yields the idler, so this only fails before the idler
/// is installed.
pub(crate) fn runq_get_next(state: &mut RunqState) -> ThreadRef {
    let next = if let Some(thread) = state.rt.get_next() {
        thread
    } else if let Some(thread) = ts::get_next(state) {
        thread
    } else if let Some(thread) = idle::get_next(state) {
        thread
    } else {
        panic!("thread: unable to find next thread");
    };

    debug_assert!(
        state.nr_threads == 0
            || state
                .idler
                .as_ref()
                .is_none_or(|idler| !Arc::ptr_eq(idler, &next)),
        "thread: idler picked over runnable threads"
    );

    state.current = next.clone();
    arch::set_current_thread(Arc::as_ptr(&next) as *mut u8);
    next
}

/// Insert a woken thread. If the target run queue belongs to another
/// processor whose running thread now has a pending reschedule, kick it
/// with an IPI.
pub(crate) fn runq_wakeup(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    debug_assert!(!arch::intr_enabled());
    debug_assert_eq!(thread.state(), ThreadState::Running);

    runq_add(rq, state, thread);

    if rq.id != arch::cpu_id() && state.current.test_flag(ThreadFlags::RESCHEDULE) {
        // Make the new flags globally visible before sending the
        // rescheduling request. This fence pairs with the one implied by
        // the rescheduling IPI.
        fence(Ordering::Release);

        arch::send_reschedule(rq.id);
    }
}

/// Wake a run queue's balancer thread, if it exists and is sleeping.
pub(crate) fn wakeup_balancer(rq: &RunQueue, state: &mut RunqState) {
    // Nothing to kick before the balancer is created; rollover happens on
    // the next opportunity
    let Some(balancer) = state.balancer.clone() else {
        return;
    };

    if balancer.state() == ThreadState::Running {
        return;
    }

    balancer.set_state(ThreadState::Running);
    runq_wakeup(rq, state, &balancer);
}

/// The scheduling decision point.
///
/// Called with the run-queue lock held, interrupts disabled and the
/// preemption counter at 2. Re-queues the running thread (or removes it if
/// it stopped running), picks the next thread and context-switches to it.
/// By contract the switched-to thread releases the run-queue lock and
/// re-enables preemption on its own path out; when this function returns,
/// the thread may be running on a different processor, and the returned
/// run queue and guard are the local ones.
pub(crate) fn schedule(
    rq: &'static RunQueue,
    mut guard: SpinGuard<'static, RunqState>,
) -> (&'static RunQueue, SpinGuard<'static, RunqState>) {
    let prev = guard.current.clone();

    assert_eq!(prev.preempt_level(), 2, "thread: invalid dispatch state");
    assert!(!arch::intr_enabled(), "thread: invalid dispatch state");

    prev.clear_flag(ThreadFlags::RESCHEDULE);
    runq_put_prev(rq, &mut guard, &prev);

    if prev.state() != ThreadState::Running {
        runq_remove(rq, &mut guard, &prev);

        let is_balancer = guard
            .balancer
            .as_ref()
            .is_some_and(|balancer| Arc::ptr_eq(balancer, &prev));
        if guard.nr_threads == 0 && !is_balancer {
            wakeup_balancer(rq, &mut guard);
        }
    }

    let next = runq_get_next(&mut guard);

    if !Arc::ptr_eq(&prev, &next) {
        if !Arc::ptr_eq(prev.task(), next.task()) && !Arc::ptr_eq(next.task(), task::kernel_task())
        {
            task::load_address_space(next.task());
        }

        // Keep raw handles only: a dead prev must not be kept alive by this
        // frame, and both threads are owned elsewhere (task registry, run
        // queue structures) until the switch completes.
        let prev_tcb = prev.tcb_ptr();
        let next_tcb = next.tcb_ptr();
        drop(prev);
        drop(next);

        // That's where the true context switch occurs. The next thread must
        // unlock the run queue and reenable preemption.
        guard.leak();
        unsafe { arch::tcb::switch(prev_tcb, next_tcb) };

        // When dispatched again, the thread might have been moved to
        // another processor.
        let rq = local_runq();
        let guard = unsafe { rq.lock.adopt() };
        (rq, guard)
    } else {
        (rq, guard)
    }
}

/// Lock two run queues in ascending index order.
pub(crate) fn double_lock(
    a: &'static RunQueue,
    b: &'static RunQueue,
) -> (SpinGuard<'static, RunqState>, SpinGuard<'static, RunqState>) {
    debug_assert!(!arch::intr_enabled());
    debug_assert!(a.id != b.id);

    if a.id < b.id {
        let guard_a = a.lock.lock();
        let guard_b = b.lock.lock();
        (guard_a, guard_b)
    } else {
        let guard_b = b.lock.lock();
        let guard_a = a.lock.lock();
        (guard_a, guard_b)
    }
}

/// Lock the run queue owning a thread, re-checking the binding after the
/// acquisition since the thread may migrate concurrently.
pub(crate) fn lock_thread_runq(
    thread: &Thread,
) -> (&'static RunQueue, SpinGuard<'static, RunqState>, bool) {
    loop {
        let cpu = thread
            .runq_cpu()
            .expect("thread: locking the run queue of a never-dispatched thread");
        let rq = runq(cpu);

        let (guard, flags) = rq.lock.lock_intr_save();

        if thread.runq_cpu() == Some(cpu) {
            return (rq, guard, flags);
        }

        guard.unlock_intr_restore(flags);
    }
}

/// Structural invariant checks, run by the test suite after mutations.
#[cfg(test)]
pub(crate) fn check_invariants(rq: &RunQueue, state: &RunqState) {
    // Active bitmap tracks occupancy exactly
    let bit = active_runqs() & (1 << rq.id) != 0;
    assert_eq!(bit, state.nr_threads > 0, "active bitmap out of sync");

    // Thread accounting: every enqueued thread is in exactly one class
    // structure; a running real-time thread is checked out of its bucket, a
    // running time-sharing thread stays counted by its sub-queue.
    let rt_count = state.rt.nr_threads() as u32;
    let ts_count = state.ts_runqs[0].nr_threads + state.ts_runqs[1].nr_threads;
    let mut expected = rt_count + ts_count;
    if state.current.class() == SchedClass::RealTime {
        expected += 1;
    }
    assert_eq!(state.nr_threads, expected, "nr_threads out of sync");

    assert_eq!(
        state.ts_weight,
        state.ts_runqs[0].weight + state.ts_runqs[1].weight,
        "ts weight out of sync"
    );

    for tsq in &state.ts_runqs {
        // Totals match the members (the flat list includes a checked-out
        // running thread, group lists don't)
        let weight_sum: u32 = tsq.threads.iter().map(|t| t.ts_weight()).sum();
        let work_sum: u32 = tsq
            .threads
            .iter()
            .map(|t| t.ts.work.load(Ordering::Relaxed))
            .sum();
        assert_eq!(tsq.weight, weight_sum, "sub-queue weight out of sync");
        assert_eq!(tsq.work, work_sum, "sub-queue work out of sync");

        let group_weight_sum: u32 = tsq.order.iter().map(|&p| tsq.groups[p].weight).sum();
        let group_work_sum: u32 = tsq.order.iter().map(|&p| tsq.groups[p].work).sum();
        assert_eq!(tsq.weight, group_weight_sum, "group weights out of sync");
        assert_eq!(tsq.work, group_work_sum, "group works out of sync");

        // Group list ordered by descending weight, empty groups unlinked
        let weights: alloc::vec::Vec<u32> = tsq.order.iter().map(|&p| tsq.groups[p].weight).collect();
        assert!(
            weights.windows(2).all(|w| w[0] >= w[1]),
            "group list not sorted"
        );
        for (prio, group) in tsq.groups.iter().enumerate() {
            if group.weight == 0 {
                assert!(!tsq.order.contains(&prio), "empty group linked");
                assert!(group.threads.is_empty(), "empty group holds threads");
            } else {
                assert!(tsq.order.contains(&prio), "non-empty group unlinked");
            }
        }

        // The current group is valid whenever the sub-queue is occupied
        if tsq.nr_threads > 0 {
            assert!(!tsq.order.is_empty());
        }
    }
}

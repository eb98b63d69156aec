//! Distributed weighted round-robin load balancing
//!
//! Each run queue owns a balancer thread (real-time, lowest priority) that
//! pulls time-sharing threads from other run queues. A remote run queue is
//! eligible when it carries time-sharing weight and its round is the
//! highest round or the one before it; pulls preserve accounted work by
//! re-tagging the migrated thread with the local round.
//!
//! The balancer is woken when its run queue runs out of active threads
//! (round rollover doubles as the balancing opportunity) and periodically
//! while the run queue sits idle.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::runq::{self, RunQueue, RunqState};
use super::thread::{SchedClass, ThreadAttr, ThreadRef, ThreadState};
use super::{ts, SchedPolicy, HZ};
use crate::arch;
use crate::sync::SpinGuard;
use crate::task;

/// Maximum number of threads pulled from a remote run queue while
/// interrupts are disabled.
pub const MAX_MIGRATIONS: u32 = 16;

/// Delay, in ticks, between two balance attempts while a run queue is
/// idle.
pub const IDLE_BALANCE_TICKS: u32 = HZ / 2;

/// Minimum migration requirements for a remote run queue.
fn balance_eligible(state: &RunqState, highest_round: u32) -> bool {
    if state.ts_weight == 0 {
        return false;
    }

    let delta = state.ts_round.wrapping_sub(highest_round) as i32;
    if delta != 0 && delta != -1 {
        return false;
    }

    let nr_threads = state.ts_runqs[0].nr_threads + state.ts_runqs[1].nr_threads;

    if nr_threads == 0
        || (nr_threads == 1 && state.current.class() == SchedClass::TimeSharing)
    {
        return false;
    }

    true
}

/// Find the most loaded eligible remote run queue. Runs with the local
/// run queue unlocked; candidates are locked only briefly, so the result
/// is a hint that migration re-validates.
fn balance_scan(local: &RunQueue, highest_round: u32) -> Option<&'static RunQueue> {
    let mut best: Option<(&'static RunQueue, u32)> = None;

    super::preempt_disable();
    let flags = arch::intr_save();

    let active = runq::active_runqs();

    for cpu in 0..arch::cpu_count() {
        if active & (1 << cpu) == 0 {
            continue;
        }

        let rq = runq::runq(cpu);
        if rq.id == local.id {
            continue;
        }

        let state = rq.lock.lock();

        if !balance_eligible(&state, highest_round) {
            continue;
        }

        match best {
            Some((_, weight)) if state.ts_weight <= weight => (),
            _ => best = Some((rq, state.ts_weight)),
        }
    }

    arch::intr_restore(flags);
    super::preempt_enable();

    best.map(|(rq, _)| rq)
}

/// Pull up to `MAX_MIGRATIONS` threads out of one remote sub-queue. Both
/// run queues are locked.
fn balance_pull(
    local_rq: &RunQueue,
    local: &mut RunqState,
    remote_rq: &RunQueue,
    remote: &mut RunqState,
    queue: usize,
    mut nr_pulls: u32,
) -> u32 {
    let candidates: Vec<ThreadRef> = remote.ts_runqs[queue].threads.iter().cloned().collect();

    for thread in &candidates {
        if Arc::ptr_eq(thread, &remote.current) {
            continue;
        }

        // The pinned counter is written without the remote lock, but only
        // by its owning thread, and a running thread is never considered
        // for migration: the thread went through the scheduler after its
        // last update, and the acquire load pairs with that release.
        if thread.pinned() != 0 {
            continue;
        }

        // Make sure at least one thread is pulled if possible. Once one
        // has been, stop before inverting the imbalance.
        if nr_pulls != 0
            && local.ts_weight + thread.ts_weight() > remote.ts_weight - thread.ts_weight()
        {
            break;
        }

        runq::runq_remove(remote_rq, remote, thread);

        // Don't discard the work already accounted for
        thread.ts.round.store(local.ts_round, Ordering::Relaxed);

        runq::runq_add(local_rq, local, thread);
        nr_pulls += 1;

        if nr_pulls == MAX_MIGRATIONS {
            break;
        }
    }

    nr_pulls
}

/// Migrate from a remote run queue: its active sub-queue first, then its
/// expired one when the remote round lags the highest round (those threads
/// are conceptually already in the next round).
fn balance_migrate(
    local_rq: &RunQueue,
    local: &mut RunqState,
    remote_rq: &RunQueue,
    remote: &mut RunqState,
    highest_round: u32,
) -> u32 {
    if !balance_eligible(remote, highest_round) {
        return 0;
    }

    let active = remote.ts_active;
    let mut nr_pulls = balance_pull(local_rq, local, remote_rq, remote, active, 0);

    if nr_pulls == MAX_MIGRATIONS {
        return nr_pulls;
    }

    if remote.ts_round != highest_round {
        nr_pulls = balance_pull(local_rq, local, remote_rq, remote, active ^ 1, nr_pulls);
    }

    nr_pulls
}

/// One balancing pass.
///
/// Entered with preemption disabled and the local run queue locked, the
/// interrupt state saved in `flags`. The lock is dropped and re-taken (and
/// `flags` re-saved) around the scan; on return the local lock is held
/// again so the next scheduling decision happens before any remote
/// balancer can steal the threads this pass produced.
fn balance(
    rq: &'static RunQueue,
    mut guard: SpinGuard<'static, RunqState>,
    flags: &mut bool,
) -> SpinGuard<'static, RunqState> {
    // Use one copy of the highest round so the value is stable for the
    // whole pass.
    let highest_round = super::highest_round();

    // A lagging round with expired threads means the rollover is overdue;
    // don't go looking for remote work first.
    if guard.ts_round != highest_round && guard.ts_runqs[guard.ts_active ^ 1].nr_threads != 0 {
        if guard.ts_runqs[guard.ts_active].nr_threads == 0 {
            ts::start_next_round(&mut guard);
        }
        return guard;
    }

    drop(guard);
    arch::intr_restore(*flags);
    super::preempt_enable();

    if let Some(remote_rq) = balance_scan(rq, highest_round) {
        super::preempt_disable();
        *flags = arch::intr_save();

        let (mut local_guard, mut remote_guard) = runq::double_lock(rq, remote_rq);
        let nr_migrations = balance_migrate(
            rq,
            &mut local_guard,
            remote_rq,
            &mut remote_guard,
            highest_round,
        );
        drop(remote_guard);

        if nr_migrations != 0 {
            log::trace!(
                "thread: pulled {} threads from cpu {} to cpu {}",
                nr_migrations,
                remote_rq.id,
                rq.id
            );
            return local_guard;
        }

        drop(local_guard);
        arch::intr_restore(*flags);
        super::preempt_enable();
    }

    // The scan or the migration failed. As a fallback, make a simpler pass
    // over every run queue and stop at the first successful pull.
    for cpu in 0..arch::cpu_count() {
        let remote_rq = runq::runq(cpu);
        if remote_rq.id == rq.id {
            continue;
        }

        super::preempt_disable();
        *flags = arch::intr_save();

        let (mut local_guard, mut remote_guard) = runq::double_lock(rq, remote_rq);
        let nr_migrations = balance_migrate(
            rq,
            &mut local_guard,
            remote_rq,
            &mut remote_guard,
            highest_round,
        );
        drop(remote_guard);

        if nr_migrations != 0 {
            log::trace!(
                "thread: pulled {} threads from cpu {} to cpu {}",
                nr_migrations,
                remote_rq.id,
                rq.id
            );
            return local_guard;
        }

        drop(local_guard);
        arch::intr_restore(*flags);
        super::preempt_enable();
    }

    super::preempt_disable();
    *flags = arch::intr_save();
    let mut guard = rq.lock.lock();

    // Nothing could be migrated. Another processor may have added threads
    // while the lock was released; if the active queue is still empty,
    // switch to the next round.
    if guard.ts_runqs[guard.ts_active].nr_threads == 0 {
        ts::start_next_round(&mut guard);
    }

    guard
}

/// Idle-time balancing: count down while the run queue has nothing to do
/// and kick the balancer when the delay elapses.
pub(super) fn idle_tick(rq: &RunQueue, state: &mut RunqState) {
    debug_assert!(state.idle_balance_ticks != 0);

    // Ticks can arrive before the balancer thread exists
    if state.balancer.is_none() {
        return;
    }

    state.idle_balance_ticks -= 1;

    if state.idle_balance_ticks == 0 {
        runq::wakeup_balancer(rq, state);
    }
}

fn balancer_main(arg: usize) {
    let rq = runq::runq(arg);

    super::preempt_disable();
    let mut flags = arch::intr_save();
    let mut guard = rq.lock.lock();

    debug_assert!(guard
        .balancer
        .as_ref()
        .is_some_and(|balancer| Arc::ptr_eq(balancer, &guard.current)));

    loop {
        guard.idle_balance_ticks = IDLE_BALANCE_TICKS;
        guard.current.set_state(ThreadState::Sleeping);

        let (new_rq, new_guard) = runq::schedule(rq, guard);
        debug_assert!(core::ptr::eq(new_rq, rq));

        // May release the lock, enable preemption and migrate threads; the
        // lock is held again on return.
        guard = balance(rq, new_guard, &mut flags);
    }
}

/// Create a run queue's balancer thread and move it to the CPU it serves.
pub(super) fn setup(rq: &'static RunQueue) {
    let mut name = heapless::String::<{ super::thread::THREAD_NAME_LEN }>::new();
    let _ = core::fmt::Write::write_fmt(&mut name, format_args!("balancer/{}", rq.id));

    let attr = ThreadAttr {
        task: Some(task::kernel_task().clone()),
        name: Some(&name),
        policy: SchedPolicy::Fifo,
        priority: super::rt::RT_PRIO_MIN,
    };

    let balancer = match super::create(&attr, balancer_main, rq.id) {
        Ok(balancer) => balancer,
        Err(_) => panic!("thread: unable to create balancer thread"),
    };

    {
        let (mut state, flags) = rq.lock.lock_intr_save();
        state.balancer = Some(balancer.clone());
        state.unlock_intr_restore(flags);
    }

    // Real-time threads are dispatched on the creator's run queue; move
    // the balancer to the one it serves.
    // TODO: give real-time threads processor affinity so new balancers
    // start out on their own run queue.
    let local = runq::local_runq();
    if local.id != rq.id {
        super::preempt_disable();
        let flags = arch::intr_save();

        let (mut local_state, mut target_state) = runq::double_lock(local, rq);
        runq::runq_remove(local, &mut local_state, &balancer);
        runq::runq_add(rq, &mut target_state, &balancer);
        drop(target_state);
        drop(local_state);

        arch::intr_restore(flags);
        super::preempt_enable();
    }

    log::debug!("thread: balancer installed on cpu {}", rq.id);
}

//! Time-sharing scheduling class (group ratio round-robin)
//!
//! Threads of equal priority share one group whose weight is the sum of its
//! members' weights. Non-empty groups are kept ordered by descending weight,
//! and selection walks that order with a ratio test, so each group receives
//! processor time proportional to its weight while selection stays O(1).
//!
//! Each run queue holds two sub-queues, `active` and `expired`. A thread
//! whose work reaches its weight is deactivated into the expired queue for
//! the next round; when the active queue drains, the queues are swapped and
//! the round counter advances. Round tracking keeps work accounting stable
//! across sleeps and migrations: re-joining in the same round restores the
//! preserved work, joining in a new round rescales it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::Ordering;

use super::runq::{self, RunQueue, RunqState};
use super::thread::{SchedClass, Thread, ThreadFlags, ThreadRef, TS_QUEUE_NONE};
use super::HZ;
use crate::arch;
use crate::sync::SpinGuard;

/// Highest time-sharing priority. Priorities map to Unix-style nice levels,
/// one group per priority.
pub const TS_PRIO_MAX: u16 = 39;

/// Default time-sharing priority.
pub const TS_PRIO_DEFAULT: u16 = 19;

/// Round slice base unit, in ticks. A thread's weight is its priority plus
/// one, in base units.
pub const TS_ROUND_SLICE_BASE: u32 = HZ / 10;

/// Initial value of the highest round.
///
/// Set to a high value to make sure overflows are correctly handled.
pub const TS_INITIAL_ROUND: u32 = 0u32.wrapping_sub(10);

const NR_GROUPS: usize = TS_PRIO_MAX as usize + 1;

/// Execution-time allocation per round for a priority.
pub fn prio_to_weight(priority: u16) -> u32 {
    (priority as u32 + 1) * TS_ROUND_SLICE_BASE
}

fn scale(work: u32, old_weight: u32, new_weight: u32) -> u32 {
    debug_assert!(old_weight != 0);
    ((work as u64 * new_weight as u64) / old_weight as u64) as u32
}

/// Group of threads sharing the same weight.
pub(super) struct TsGroup {
    pub(super) weight: u32,
    pub(super) work: u32,
    pub(super) threads: VecDeque<ThreadRef>,
}

/// One time-sharing sub-queue (active or expired).
///
/// `current` has a meaningful value only when the sub-queue isn't empty.
pub(super) struct TsRunq {
    pub(super) groups: [TsGroup; NR_GROUPS],
    /// Priorities of non-empty groups, ordered by descending weight.
    pub(super) order: VecDeque<usize>,
    /// Every enqueued thread, in insertion order, for the balancer to walk.
    pub(super) threads: VecDeque<ThreadRef>,
    /// Priority of the group selection last served.
    pub(super) current: usize,
    pub(super) nr_threads: u32,
    pub(super) weight: u32,
    pub(super) work: u32,
}

fn ratio_exceeded(current: &TsGroup, next: &TsGroup) -> bool {
    let a = (current.work as u64 + 1) * next.weight as u64;
    let b = (next.work as u64 + 1) * current.weight as u64;
    a > b
}

impl TsRunq {
    pub(super) fn new() -> Self {
        Self {
            groups: core::array::from_fn(|_| TsGroup {
                weight: 0,
                work: 0,
                threads: VecDeque::new(),
            }),
            order: VecDeque::new(),
            threads: VecDeque::new(),
            current: 0,
            nr_threads: 0,
            weight: 0,
            work: 0,
        }
    }

    /// Insert a thread, keeping the group list ordered and scaling work
    /// accounting against `round`.
    pub(super) fn enqueue(&mut self, queue_index: u8, round: u32, thread: &ThreadRef) {
        debug_assert_eq!(thread.ts.queue.load(Ordering::Relaxed), TS_QUEUE_NONE);

        let prio = thread.ts_priority() as usize;
        let thread_weight = thread.ts.weight;
        let group_weight = self.groups[prio].weight + thread_weight;
        let total_weight = self.weight + thread_weight;

        // Reposition the group: walk left from its current slot (or the
        // tail for a new group) to just after the last group at least as
        // heavy.
        let in_order = self.groups[prio].weight != 0;
        let start = if in_order {
            self.order
                .iter()
                .position(|&p| p == prio)
                .expect("thread: group missing from order list")
        } else {
            self.order.len()
        };

        let mut insert_at = 0;
        for j in (0..start).rev() {
            if self.groups[self.order[j]].weight >= group_weight {
                insert_at = j + 1;
                break;
            }
        }

        if !in_order {
            self.order.insert(insert_at, prio);
        } else if insert_at != start {
            let _ = self.order.remove(start);
            self.order.insert(insert_at, prio);
        }

        // XXX Unfairness can occur if the run queue round wraps around and
        // the thread is "lucky" enough to have the same round value. This
        // should be rare and harmless otherwise.
        if thread.ts.round.load(Ordering::Relaxed) == round {
            let work = thread.ts.work.load(Ordering::Relaxed);
            self.work += work;
            self.groups[prio].work += work;
        } else {
            let thread_work;

            if self.weight == 0 {
                thread_work = 0;
            } else {
                let group = &self.groups[prio];
                let group_work = if group.weight == 0 {
                    scale(self.work, self.weight, thread_weight)
                } else {
                    scale(group.work, group.weight, group_weight)
                };

                thread_work = group_work - group.work;
                self.work += thread_work;
                self.groups[prio].work = group_work;
            }

            thread.ts.round.store(round, Ordering::Relaxed);
            thread.ts.work.store(thread_work, Ordering::Relaxed);
        }

        self.nr_threads += 1;
        self.weight = total_weight;
        self.groups[prio].weight = group_weight;

        // Insert at the front of the group to improve interactivity
        self.groups[prio].threads.push_front(thread.clone());
        self.threads.push_back(thread.clone());
        thread.ts.queue.store(queue_index, Ordering::Relaxed);
    }

    /// Remove a thread, restoring the group ordering. The mirror of
    /// [`TsRunq::enqueue`].
    pub(super) fn dequeue(&mut self, thread: &ThreadRef) {
        debug_assert_ne!(thread.ts.queue.load(Ordering::Relaxed), TS_QUEUE_NONE);

        let prio = thread.ts_priority() as usize;
        let thread_weight = thread.ts.weight;
        let work = thread.ts.work.load(Ordering::Relaxed);

        thread.ts.queue.store(TS_QUEUE_NONE, Ordering::Relaxed);

        let pos = self
            .threads
            .iter()
            .position(|t| Arc::ptr_eq(t, thread))
            .expect("thread: not on time-sharing run queue");
        let _ = self.threads.remove(pos);

        let group = &mut self.groups[prio];
        let pos = group
            .threads
            .iter()
            .position(|t| Arc::ptr_eq(t, thread))
            .expect("thread: not on its group queue");
        let _ = group.threads.remove(pos);

        group.work -= work;
        group.weight -= thread_weight;
        self.work -= work;
        self.weight -= thread_weight;
        self.nr_threads -= 1;

        let group_weight = self.groups[prio].weight;
        let pos = self
            .order
            .iter()
            .position(|&p| p == prio)
            .expect("thread: group missing from order list");

        if group_weight == 0 {
            let _ = self.order.remove(pos);
        } else {
            // Walk right to just before the first group no heavier
            let mut target = self.order.len();
            for j in pos + 1..self.order.len() {
                if self.groups[self.order[j]].weight <= group_weight {
                    target = j;
                    break;
                }
            }

            if target != pos + 1 {
                let _ = self.order.remove(pos);
                self.order.insert(target - 1, prio);
            }
        }
    }

    /// Proportional-share selection: serve the current group's successor if
    /// the ratio test allows it, otherwise restart from the heaviest group.
    /// The chosen thread is unlinked from its group queue; `put_prev`
    /// relinks it.
    pub(super) fn get_next(&mut self) -> Option<ThreadRef> {
        if self.nr_threads == 0 {
            return None;
        }

        // The current group may have been emptied and unlinked since the
        // last selection (deactivation doesn't reset it); restart from the
        // heaviest group in that case.
        let chosen = match self.order.iter().position(|&p| p == self.current) {
            None => self.order[0],
            Some(pos) if pos + 1 == self.order.len() => self.order[0],
            Some(pos) => {
                let next = self.order[pos + 1];

                if ratio_exceeded(&self.groups[self.current], &self.groups[next]) {
                    next
                } else {
                    self.order[0]
                }
            }
        };

        self.current = chosen;
        let thread = self.groups[chosen]
            .threads
            .pop_front()
            .expect("thread: selected group has no threads");
        Some(thread)
    }
}

/// Reset group selection to the heaviest group, and make the running thread
/// re-enter selection if it's in this class.
pub(super) fn restart(state: &mut RunqState) {
    let active = state.ts_active;
    let first = *state.ts_runqs[active]
        .order
        .front()
        .expect("thread: active queue has no groups");
    state.ts_runqs[active].current = first;

    if state.current.class() == SchedClass::TimeSharing {
        state.current.set_flag(ThreadFlags::RESCHEDULE);
    }
}

pub(super) fn add(state: &mut RunqState, thread: &ThreadRef) {
    if state.ts_weight == 0 {
        state.ts_round = super::highest_round();
    }

    // TODO: cap the number of threads per run queue so the weight sum
    // cannot overflow.
    let total_weight = match state.ts_weight.checked_add(thread.ts.weight) {
        Some(total) => total,
        None => panic!("thread: weight overflow"),
    };

    state.ts_weight = total_weight;
    let round = state.ts_round;
    let active = state.ts_active;
    state.ts_runqs[active].enqueue(active as u8, round, thread);
    restart(state);
}

pub(super) fn remove(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    state.ts_weight -= thread.ts.weight;

    let queue = thread.ts.queue.load(Ordering::Relaxed) as usize;
    state.ts_runqs[queue].dequeue(thread);

    if queue == state.ts_active {
        if state.ts_runqs[queue].nr_threads == 0 {
            runq::wakeup_balancer(rq, state);
        } else {
            restart(state);
        }
    }
}

/// Move a thread whose round allocation is consumed into the expired queue,
/// carrying excess work over into the next round.
fn deactivate(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    let active = state.ts_active;
    let expired = active ^ 1;

    debug_assert_eq!(thread.ts.queue.load(Ordering::Relaxed) as usize, active);
    debug_assert_eq!(thread.ts.round.load(Ordering::Relaxed), state.ts_round);

    state.ts_runqs[active].dequeue(thread);

    let round = thread.ts.round.load(Ordering::Relaxed).wrapping_add(1);
    let work = thread
        .ts
        .work
        .load(Ordering::Relaxed)
        .wrapping_sub(thread.ts.weight);
    thread.ts.round.store(round, Ordering::Relaxed);
    thread.ts.work.store(work, Ordering::Relaxed);

    let next_round = state.ts_round.wrapping_add(1);
    state.ts_runqs[expired].enqueue(expired as u8, next_round, thread);

    if state.ts_runqs[active].nr_threads == 0 {
        runq::wakeup_balancer(rq, state);
    }
}

pub(super) fn put_prev(rq: &RunQueue, state: &mut RunqState, thread: &ThreadRef) {
    let active = state.ts_active;
    let prio = thread.ts_priority() as usize;
    state.ts_runqs[active].groups[prio]
        .threads
        .push_back(thread.clone());

    if thread.ts.work.load(Ordering::Relaxed) >= thread.ts.weight {
        deactivate(rq, state, thread);
    }
}

pub(super) fn get_next(state: &mut RunqState) -> Option<ThreadRef> {
    let active = state.ts_active;
    state.ts_runqs[active].get_next()
}

pub(super) fn tick(state: &mut RunqState, thread: &Thread) {
    let active = state.ts_active;
    let tsq = &mut state.ts_runqs[active];

    tsq.work += 1;
    tsq.groups[thread.ts_priority() as usize].work += 1;
    thread.set_flag(ThreadFlags::RESCHEDULE);
    thread.ts.work.fetch_add(1, Ordering::Relaxed);
}

/// Swap the active and expired queues. If the new active queue has threads,
/// advance the local round and publish it if it became the highest.
pub(super) fn start_next_round(state: &mut RunqState) {
    state.ts_active ^= 1;

    if state.ts_runqs[state.ts_active].nr_threads != 0 {
        state.ts_round = state.ts_round.wrapping_add(1);

        let delta = state.ts_round.wrapping_sub(super::highest_round()) as i32;
        if delta > 0 {
            super::publish_highest_round(state.ts_round);
        }

        restart(state);
    }
}

/// Choose the run queue a waking time-sharing thread should join, and
/// return it locked.
///
/// Prefer a truly idle run queue; otherwise the least loaded of the run
/// queues in the highest round. Run queues whose weight is zero but whose
/// current thread isn't the idler carry pure real-time load and are
/// skipped.
pub(super) fn select_runq() -> (&'static RunQueue, SpinGuard<'static, RunqState>) {
    let nr_runqs = arch::cpu_count();
    let active_bits = runq::active_runqs();

    for cpu in 0..nr_runqs {
        if active_bits & (1 << cpu) != 0 {
            continue;
        }

        let rq = runq::runq(cpu);
        let state = rq.lock.lock();

        // The run queue really is idle, return it
        if state
            .idler
            .as_ref()
            .is_some_and(|idler| Arc::ptr_eq(idler, &state.current))
        {
            return (rq, state);
        }

        drop(state);
    }

    let mut best = runq::runq(0);
    let mut best_state = best.lock.lock();

    for cpu in 1..nr_runqs {
        let rq = runq::runq(cpu);
        let state = rq.lock.lock();

        // A run queue may have become idle
        if state
            .idler
            .as_ref()
            .is_some_and(|idler| Arc::ptr_eq(idler, &state.current))
        {
            return (rq, state);
        }

        // Not idle and no time-sharing threads: real-time load only
        if state.ts_weight == 0 {
            continue;
        }

        let delta = state.ts_round.wrapping_sub(best_state.ts_round) as i32;

        // Look for the least loaded of the run queues in the highest round
        if delta > 0 || (delta == 0 && state.ts_weight < best_state.ts_weight) {
            best = rq;
            best_state = state;
        }
    }

    (best, best_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::{global_guard, kernel_thread, ts_thread};
    use crate::sched::SchedPolicy;

    fn order_weights(tsq: &TsRunq) -> Vec<u32> {
        tsq.order.iter().map(|&p| tsq.groups[p].weight).collect()
    }

    // =========================================================================
    // Group Ordering Tests
    // =========================================================================

    #[test]
    fn test_enqueue_orders_groups_by_weight() {
        let mut tsq = TsRunq::new();

        let t0 = ts_thread("ts_w1", 0); // weight 1 * base
        let t3 = ts_thread("ts_w4", 3); // weight 4 * base
        let t1 = ts_thread("ts_w2", 1); // weight 2 * base

        tsq.enqueue(0, 0, &t0);
        tsq.enqueue(0, 0, &t3);
        tsq.enqueue(0, 0, &t1);

        assert_eq!(tsq.order.iter().copied().collect::<Vec<_>>(), vec![3, 1, 0]);
        let weights = order_weights(&tsq);
        assert!(weights.windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(tsq.weight, prio_to_weight(0) + prio_to_weight(1) + prio_to_weight(3));
    }

    #[test]
    fn test_enqueue_repositions_growing_group() {
        let mut tsq = TsRunq::new();

        // Group 1 holds one thread (weight 2b); group 0 grows past it with
        // three weight-1b threads.
        tsq.enqueue(0, 0, &ts_thread("ts_g1", 1));
        tsq.enqueue(0, 0, &ts_thread("ts_g0_a", 0));
        assert_eq!(tsq.order.iter().copied().collect::<Vec<_>>(), vec![1, 0]);

        tsq.enqueue(0, 0, &ts_thread("ts_g0_b", 0));
        // Equal weights: the existing group keeps its slot
        assert_eq!(tsq.order.iter().copied().collect::<Vec<_>>(), vec![1, 0]);

        tsq.enqueue(0, 0, &ts_thread("ts_g0_c", 0));
        assert_eq!(tsq.order.iter().copied().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_dequeue_restores_order_and_unlinks_empty_groups() {
        let mut tsq = TsRunq::new();

        let a = ts_thread("ts_deq_a", 2);
        let b = ts_thread("ts_deq_b", 5);

        tsq.enqueue(0, 0, &a);
        tsq.enqueue(0, 0, &b);
        assert_eq!(tsq.order.len(), 2);

        tsq.dequeue(&b);
        assert_eq!(tsq.order.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(tsq.weight, prio_to_weight(2));

        tsq.dequeue(&a);
        assert!(tsq.order.is_empty());
        assert_eq!(tsq.nr_threads, 0);
        assert_eq!(tsq.weight, 0);
        assert_eq!(tsq.work, 0);
    }

    #[test]
    fn test_enqueue_dequeue_is_noop() {
        let mut tsq = TsRunq::new();
        tsq.enqueue(0, 7, &ts_thread("ts_base", 1));

        let thread = ts_thread("ts_noop", 4);
        let (weight, work, nr) = (tsq.weight, tsq.work, tsq.nr_threads);
        let order: Vec<_> = tsq.order.iter().copied().collect();

        tsq.enqueue(0, 7, &thread);
        tsq.dequeue(&thread);

        assert_eq!(tsq.weight, weight);
        assert_eq!(tsq.work, work);
        assert_eq!(tsq.nr_threads, nr);
        assert_eq!(tsq.order.iter().copied().collect::<Vec<_>>(), order);
    }

    // =========================================================================
    // Work Accounting Tests
    // =========================================================================

    #[test]
    fn test_first_thread_gets_zero_work() {
        let mut tsq = TsRunq::new();
        let thread = ts_thread("ts_zero", 3);

        tsq.enqueue(0, 42, &thread);

        assert_eq!(thread.ts.work.load(Ordering::Relaxed), 0);
        assert_eq!(thread.ts.round.load(Ordering::Relaxed), 42);
        assert_eq!(tsq.work, 0);
    }

    #[test]
    fn test_same_round_rejoin_preserves_work() {
        let mut tsq = TsRunq::new();
        tsq.enqueue(0, 3, &ts_thread("ts_keep_base", 1));

        let thread = ts_thread("ts_keep", 1);
        thread.ts.round.store(3, Ordering::Relaxed);
        thread.ts.work.store(9, Ordering::Relaxed);

        tsq.enqueue(0, 3, &thread);

        assert_eq!(thread.ts.work.load(Ordering::Relaxed), 9);
        assert_eq!(tsq.work, 9);
        assert_eq!(tsq.groups[1].work, 9);
    }

    #[test]
    fn test_new_round_scales_group_work() {
        let mut tsq = TsRunq::new();

        // One thread at priority 1 (weight 2b = 20) with 10 ticks of work
        let first = ts_thread("ts_scale_a", 1);
        tsq.enqueue(0, 0, &first);
        first.ts.work.store(10, Ordering::Relaxed);
        tsq.work = 10;
        tsq.groups[1].work = 10;

        // A stale-round thread joining the group: group weight doubles, so
        // group work scales 10 -> 20 and the newcomer owns the difference.
        let second = ts_thread("ts_scale_b", 1);
        second.ts.round.store(99, Ordering::Relaxed);
        tsq.enqueue(0, 0, &second);

        assert_eq!(tsq.groups[1].work, 20);
        assert_eq!(second.ts.work.load(Ordering::Relaxed), 10);
        assert_eq!(second.ts.round.load(Ordering::Relaxed), 0);
        assert_eq!(tsq.work, 20);
    }

    #[test]
    fn test_new_round_empty_group_takes_weight_share() {
        let mut tsq = TsRunq::new();

        // Queue-wide: weight 40, work 20
        let heavy = ts_thread("ts_share_a", 3);
        tsq.enqueue(0, 0, &heavy);
        heavy.ts.work.store(20, Ordering::Relaxed);
        tsq.work = 20;
        tsq.groups[3].work = 20;

        // New group of weight 10 gets a proportional share: 20 * 10/40 = 5
        let light = ts_thread("ts_share_b", 0);
        light.ts.round.store(5, Ordering::Relaxed);
        tsq.enqueue(0, 0, &light);

        assert_eq!(light.ts.work.load(Ordering::Relaxed), 5);
        assert_eq!(tsq.groups[0].work, 5);
        assert_eq!(tsq.work, 25);
    }

    // =========================================================================
    // Run Queue Level Tests
    // =========================================================================

    #[test]
    fn test_add_snaps_round_to_highest() {
        let _serial = global_guard();
        let rq = RunQueue::new(8);
        let mut state = rq.lock.lock();

        crate::sched::tests::set_highest_round(1234);
        add(&mut state, &ts_thread("ts_snap", 0));

        assert_eq!(state.ts_round, 1234);
    }

    #[test]
    fn test_deactivation_carries_excess_work() {
        let _serial = global_guard();
        let rq = RunQueue::new(9);
        let mut state = rq.lock.lock();

        let thread = ts_thread("ts_deact", 0);
        let weight = thread.ts_weight();
        add(&mut state, &thread);
        let round = state.ts_round;

        // Run a full allocation plus one tick
        let running = get_next(&mut state).unwrap();
        for _ in 0..weight + 1 {
            tick(&mut state, &running);
        }
        put_prev(&rq, &mut state, &running);

        let expired = state.ts_active ^ 1;
        assert_eq!(
            thread.ts.queue.load(Ordering::Relaxed) as usize,
            expired,
            "thread should be on the expired queue"
        );
        assert_eq!(thread.ts.round.load(Ordering::Relaxed), round.wrapping_add(1));
        assert_eq!(thread.ts.work.load(Ordering::Relaxed), 1);
        assert_eq!(state.ts_runqs[state.ts_active].nr_threads, 0);
        assert_eq!(state.ts_weight, weight, "deactivation must not change runq weight");
    }

    #[test]
    fn test_round_swap_is_involutive_when_idle() {
        let _serial = global_guard();
        let rq = RunQueue::new(10);
        let mut state = rq.lock.lock();

        let round = state.ts_round;
        let active = state.ts_active;

        start_next_round(&mut state);
        start_next_round(&mut state);

        assert_eq!(state.ts_round, round);
        assert_eq!(state.ts_active, active);
    }

    #[test]
    fn test_start_next_round_publishes_highest() {
        let _serial = global_guard();
        let rq = RunQueue::new(11);
        let mut state = rq.lock.lock();

        crate::sched::tests::set_highest_round(TS_INITIAL_ROUND);
        state.ts_round = TS_INITIAL_ROUND;

        let thread = ts_thread("ts_pub", 0);
        add(&mut state, &thread);

        // Deactivate the only thread so the expired queue is populated
        let running = get_next(&mut state).unwrap();
        for _ in 0..thread.ts_weight() {
            tick(&mut state, &running);
        }
        put_prev(&rq, &mut state, &running);

        start_next_round(&mut state);

        let expected = TS_INITIAL_ROUND.wrapping_add(1);
        assert_eq!(state.ts_round, expected);
        assert_eq!(crate::sched::highest_round(), expected);
    }

    #[test]
    fn test_highest_round_wraps_through_zero() {
        let _serial = global_guard();
        let rq = RunQueue::new(12);
        let mut state = rq.lock.lock();

        crate::sched::tests::set_highest_round(TS_INITIAL_ROUND);
        state.ts_round = TS_INITIAL_ROUND;

        let thread = ts_thread("ts_wrap", 0);
        add(&mut state, &thread);

        // Twenty synthetic rounds walk the counter across the wrap point
        for _ in 0..20 {
            let running = get_next(&mut state).unwrap();
            for _ in 0..thread.ts_weight() {
                tick(&mut state, &running);
            }
            put_prev(&rq, &mut state, &running);
            start_next_round(&mut state);

            let delta = crate::sched::highest_round().wrapping_sub(state.ts_round) as i32;
            assert!(delta >= 0, "local round must never lead the published one");
            assert!(delta <= 1, "no round may be judged ahead by more than one");
        }

        assert_eq!(state.ts_round, TS_INITIAL_ROUND.wrapping_add(20));
        assert!((state.ts_round as i32) > 0, "counter should have wrapped");
    }

    // =========================================================================
    // Proportional Share Tests
    // =========================================================================

    #[test]
    fn test_proportional_share_over_one_round() {
        let _serial = global_guard();
        let rq = RunQueue::new(13);
        let mut state = rq.lock.lock();

        let light = ts_thread("ts_prop_light", 0); // weight b
        let heavy = ts_thread("ts_prop_heavy", 3); // weight 4b
        add(&mut state, &light);
        add(&mut state, &heavy);

        let mut light_ticks = 0u32;
        let mut heavy_ticks = 0u32;

        // Drive tick-sized quanta until the round ends
        while state.ts_runqs[state.ts_active].nr_threads > 0 {
            let running = get_next(&mut state).unwrap();
            tick(&mut state, &running);
            if Arc::ptr_eq(&running, &light) {
                light_ticks += 1;
            } else {
                heavy_ticks += 1;
            }
            put_prev(&rq, &mut state, &running);
        }

        assert_eq!(light_ticks, light.ts_weight());
        assert_eq!(heavy_ticks, heavy.ts_weight());
        // Ratio of allocations is 1:4 within a tick
        assert!(heavy_ticks / light_ticks == 4);
    }

    #[test]
    fn test_ratio_test_interleaves_groups() {
        let _serial = global_guard();
        let rq = RunQueue::new(14);
        let mut state = rq.lock.lock();

        let light = ts_thread("ts_ratio_light", 0);
        let heavy = ts_thread("ts_ratio_heavy", 3);
        add(&mut state, &light);
        add(&mut state, &heavy);

        // The first selections must not starve the light group for the
        // whole heavy allocation: within the first five quanta both groups
        // must have run.
        let mut seen_light = false;
        let mut seen_heavy = false;
        for _ in 0..5 {
            let running = get_next(&mut state).unwrap();
            tick(&mut state, &running);
            seen_light |= Arc::ptr_eq(&running, &light);
            seen_heavy |= Arc::ptr_eq(&running, &heavy);
            put_prev(&rq, &mut state, &running);
        }

        assert!(seen_light && seen_heavy);
    }

    // =========================================================================
    // Restart Tests
    // =========================================================================

    #[test]
    fn test_restart_selects_heaviest_and_flags_ts_current() {
        let _serial = global_guard();
        let rq = RunQueue::new(15);
        let mut state = rq.lock.lock();

        // Make the running thread a time-sharing one
        let current = kernel_thread("ts_restart_cur", SchedPolicy::TimeSharing, 0);
        current.clear_flag(ThreadFlags::RESCHEDULE);
        state.current = current.clone();

        add(&mut state, &ts_thread("ts_restart_light", 0));
        add(&mut state, &ts_thread("ts_restart_heavy", 5));

        let active = state.ts_active;
        assert_eq!(state.ts_runqs[active].current, 5);
        assert!(current.test_flag(ThreadFlags::RESCHEDULE));
    }
}

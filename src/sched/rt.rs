//! Real-time scheduling class
//!
//! Strict priorities with one FIFO bucket per priority and a bitmap of
//! non-empty buckets; the highest set bit is the next bucket to serve.
//! FIFO threads run until they block; round-robin threads are preempted
//! when their time slice expires and requeue at the tail of their bucket.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use super::thread::{Thread, ThreadFlags, ThreadRef};
use super::HZ;

/// Highest real-time priority. Priorities fit a 32-bit bucket bitmap.
pub const RT_PRIO_MAX: u16 = 31;

/// Lowest real-time priority.
pub const RT_PRIO_MIN: u16 = 0;

/// Round-robin quantum, in ticks.
pub const RR_TIME_SLICE: u32 = HZ / 10;

const NR_PRIORITIES: usize = RT_PRIO_MAX as usize + 1;

/// Per-CPU real-time sub-queue.
pub(super) struct RtRunq {
    bitmap: u32,
    queues: [VecDeque<ThreadRef>; NR_PRIORITIES],
}

impl RtRunq {
    pub(super) fn new() -> Self {
        Self {
            bitmap: 0,
            queues: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    pub(super) fn nr_threads(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    /// Insert at the tail of the thread's priority bucket. Requests a
    /// reschedule if the thread outranks the running thread within the
    /// real-time class.
    pub(super) fn add(&mut self, current: &Thread, thread: &ThreadRef) {
        let priority = thread.rt_priority();
        let queue = &mut self.queues[priority as usize];

        queue.push_back(thread.clone());

        if queue.len() == 1 {
            self.bitmap |= 1 << priority;
        }

        if thread.class() == current.class() && priority > current.rt_priority() {
            current.set_flag(ThreadFlags::RESCHEDULE);
        }
    }

    pub(super) fn remove(&mut self, thread: &ThreadRef) {
        let priority = thread.rt_priority();
        let queue = &mut self.queues[priority as usize];

        let pos = queue
            .iter()
            .position(|t| Arc::ptr_eq(t, thread))
            .expect("thread: not on real-time run queue");
        let _ = queue.remove(pos);

        if queue.is_empty() {
            self.bitmap &= !(1 << priority);
        }
    }

    /// Tail re-insertion: FIFO within a priority, and round-robin once the
    /// tick handler expires a slice.
    pub(super) fn put_prev(&mut self, current: &Thread, thread: &ThreadRef) {
        self.add(current, thread);
    }

    pub(super) fn get_next(&mut self) -> Option<ThreadRef> {
        if self.bitmap == 0 {
            return None;
        }

        let priority = 31 - self.bitmap.leading_zeros();
        let queue = &mut self.queues[priority as usize];
        let thread = queue.pop_front().expect("thread: stale run queue bitmap");

        if queue.is_empty() {
            self.bitmap &= !(1 << priority);
        }

        Some(thread)
    }
}

/// Timer tick for the running real-time thread. FIFO threads never yield on
/// tick; round-robin threads request a reschedule when the slice expires.
pub(super) fn tick(thread: &Thread) {
    if thread.policy() != super::SchedPolicy::RoundRobin {
        return;
    }

    use core::sync::atomic::Ordering;

    let left = thread.rt.time_slice.fetch_sub(1, Ordering::Relaxed) - 1;

    if left > 0 {
        return;
    }

    thread.rt.time_slice.store(RR_TIME_SLICE, Ordering::Relaxed);
    thread.set_flag(ThreadFlags::RESCHEDULE);
}

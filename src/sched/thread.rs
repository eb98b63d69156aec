//! Thread objects
//!
//! A thread carries its identity, its architectural context, its kernel
//! stack and its scheduling state. Fields that are read without the owning
//! run-queue lock (`state`, `flags`, `preempt`, `pinned`, the run-queue
//! back-reference and the per-class counters) are atomics; the structural
//! invariants tying them together are maintained by `sched::runq` under the
//! run-queue lock.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::fmt::Write as _;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::arch;
use crate::mem::ThreadStack;
use crate::task::{self, TaskRef};
use crate::Error;

use super::rt::{RR_TIME_SLICE, RT_PRIO_MAX};
use super::ts::{self, TS_PRIO_MAX};

/// Maximum thread name length.
pub const THREAD_NAME_LEN: usize = 32;

/// Marker for a thread that was never dispatched on any run queue.
const RUNQ_NONE: u32 = u32::MAX;

/// Marker for a time-sharing thread not enqueued on either sub-queue.
pub(super) const TS_QUEUE_NONE: u8 = u8::MAX;

pub type ThreadRef = Arc<Thread>;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Thread identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId {
    fn new() -> Self {
        Self(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Thread state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Running or runnable on some run queue
    Running = 0,
    /// Waiting for a wakeup
    Sleeping = 1,
    /// Exited, awaiting destruction by the reaper
    Dead = 2,
}

impl ThreadState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ThreadState::Running,
            1 => ThreadState::Sleeping,
            2 => ThreadState::Dead,
            _ => unreachable!("invalid thread state"),
        }
    }
}

bitflags::bitflags! {
    /// Asynchronous per-thread flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// The thread must call the scheduler at the next safe point.
        const RESCHEDULE = 1 << 0;
    }
}

/// Scheduling policy, chosen at creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Real-time, first-in first-out within a priority
    Fifo,
    /// Real-time, round-robin within a priority
    RoundRobin,
    /// Proportional-share time sharing
    TimeSharing,
    /// Idle; reserved for per-CPU idler threads
    Idle,
}

impl SchedPolicy {
    /// Map a policy to its scheduling class.
    pub fn class(self) -> SchedClass {
        match self {
            SchedPolicy::Fifo | SchedPolicy::RoundRobin => SchedClass::RealTime,
            SchedPolicy::TimeSharing => SchedClass::TimeSharing,
            SchedPolicy::Idle => SchedClass::Idle,
        }
    }
}

/// Scheduling class. The discriminant order is the dispatch order: a lower
/// value outranks a higher one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SchedClass {
    RealTime = 0,
    TimeSharing = 1,
    Idle = 2,
}

/// Real-time scheduling context.
pub(super) struct RtCtx {
    pub(super) priority: u16,
    /// Remaining round-robin quantum, in ticks. Unused under FIFO.
    pub(super) time_slice: AtomicU32,
}

/// Time-sharing scheduling context.
pub(super) struct TsCtx {
    pub(super) priority: u16,
    /// Allocated execution time per round, in ticks.
    pub(super) weight: u32,
    /// Round the work counter belongs to.
    pub(super) round: AtomicU32,
    /// Execution time consumed in the current round, in ticks.
    pub(super) work: AtomicU32,
    /// Index of the sub-queue holding the thread, or `TS_QUEUE_NONE`.
    pub(super) queue: AtomicU8,
}

/// Creation attributes for a thread.
pub struct ThreadAttr<'a> {
    /// Owning task; defaults to the creator's task.
    pub task: Option<TaskRef>,
    /// Thread name; defaults to the task name.
    pub name: Option<&'a str>,
    pub policy: SchedPolicy,
    pub priority: u16,
}

impl Default for ThreadAttr<'_> {
    fn default() -> Self {
        Self {
            task: None,
            name: None,
            policy: SchedPolicy::TimeSharing,
            priority: ts::TS_PRIO_DEFAULT,
        }
    }
}

/// A schedulable entity.
pub struct Thread {
    id: ThreadId,
    name: heapless::String<THREAD_NAME_LEN>,
    task: TaskRef,

    /// Architectural context, mutated only by the context-switch trampoline.
    tcb: UnsafeCell<arch::tcb::Tcb>,
    /// Kernel stack; `None` only for bootstrap shims.
    stack: Option<ThreadStack>,
    /// Entry function and argument; `None` only for bootstrap shims.
    entry: Option<(fn(usize), usize)>,

    state: AtomicU8,
    flags: AtomicU32,
    /// Preemption is enabled when zero. Manipulated only by the thread
    /// itself while it runs; the context-switch contract pins it at 2
    /// across a switch.
    preempt: AtomicU32,
    /// Migration is forbidden when non-zero. Written by the owning thread,
    /// read by remote balancers (acquire pairs with the owner's release).
    pinned: AtomicU32,
    /// Index of the run queue that owns the thread, or `RUNQ_NONE` before
    /// the first dispatch.
    runq: AtomicU32,

    policy: SchedPolicy,
    class: SchedClass,
    pub(super) rt: RtCtx,
    pub(super) ts: TsCtx,
}

// The TCB cell is only touched by the switching CPU under the run-queue
// lock; every other field is atomic or immutable after construction.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

fn bounded_name(name: &str) -> heapless::String<THREAD_NAME_LEN> {
    let mut bounded = heapless::String::new();
    for c in name.chars().take(THREAD_NAME_LEN) {
        let _ = bounded.push(c);
    }
    bounded
}

impl Thread {
    /// Create a thread in the `Sleeping` state, registered with its task but
    /// not yet on any run queue. `sched::wakeup` makes it runnable.
    ///
    /// The preemption counter starts at 2: the expected state when the
    /// thread is first dispatched is interrupts disabled, preemption
    /// disabled and the run-queue lock held, and holding the lock accounts
    /// for the second increment.
    pub fn new(attr: &ThreadAttr, entry: fn(usize), arg: usize) -> Result<ThreadRef, Error> {
        let stack = ThreadStack::new()?;

        let mut tcb = arch::tcb::Tcb::new();
        unsafe { arch::tcb::init(&mut tcb, stack.top(), super::thread_main) };

        let task = attr
            .task
            .clone()
            .unwrap_or_else(|| super::current().task().clone());
        let name = match attr.name {
            Some(name) => bounded_name(name),
            None => bounded_name(task.name()),
        };

        let class = attr.policy.class();

        match class {
            SchedClass::RealTime => {
                assert!(attr.priority <= RT_PRIO_MAX, "thread: invalid priority");
            }
            SchedClass::TimeSharing => {
                assert!(attr.priority <= TS_PRIO_MAX, "thread: invalid priority");
            }
            SchedClass::Idle => (),
        }

        let thread = Arc::new(Self {
            id: ThreadId::new(),
            name,
            task: task.clone(),
            tcb: UnsafeCell::new(tcb),
            stack: Some(stack),
            entry: Some((entry, arg)),
            state: AtomicU8::new(ThreadState::Sleeping as u8),
            flags: AtomicU32::new(0),
            preempt: AtomicU32::new(2),
            pinned: AtomicU32::new(0),
            runq: AtomicU32::new(RUNQ_NONE),
            policy: attr.policy,
            class,
            rt: RtCtx {
                priority: attr.priority,
                time_slice: AtomicU32::new(RR_TIME_SLICE),
            },
            ts: TsCtx {
                priority: attr.priority,
                weight: ts::prio_to_weight(attr.priority),
                round: AtomicU32::new(0),
                work: AtomicU32::new(0),
                queue: AtomicU8::new(TS_QUEUE_NONE),
            },
        });

        task::add_thread(&task, &thread);

        Ok(thread)
    }

    /// Create the bootstrap shim that gives a CPU a thread context before
    /// the scheduler runs. Booters are a distinct non-schedulable state:
    /// never enqueued, never woken, discarded at the first dispatch.
    pub(super) fn new_booter(cpu: usize) -> ThreadRef {
        let mut name = heapless::String::new();
        let _ = write!(name, "booter/{}", cpu);

        Arc::new(Self {
            id: ThreadId::new(),
            name,
            task: task::kernel_task().clone(),
            tcb: UnsafeCell::new(arch::tcb::Tcb::new()),
            stack: None,
            entry: None,
            state: AtomicU8::new(ThreadState::Running as u8),
            flags: AtomicU32::new(0),
            preempt: AtomicU32::new(1),
            pinned: AtomicU32::new(0),
            runq: AtomicU32::new(RUNQ_NONE),
            policy: SchedPolicy::Idle,
            class: SchedClass::Idle,
            rt: RtCtx {
                priority: 0,
                time_slice: AtomicU32::new(RR_TIME_SLICE),
            },
            ts: TsCtx {
                priority: 0,
                weight: 0,
                round: AtomicU32::new(0),
                work: AtomicU32::new(0),
                queue: AtomicU8::new(TS_QUEUE_NONE),
            },
        })
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    pub fn class(&self) -> SchedClass {
        self.class
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub(super) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(super) fn set_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Relaxed);
    }

    pub(super) fn clear_flag(&self, flag: ThreadFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Relaxed);
    }

    pub fn test_flag(&self, flag: ThreadFlags) -> bool {
        self.flags.load(Ordering::Relaxed) & flag.bits() != 0
    }

    /// The run queue that owns the thread, or `None` before the first
    /// dispatch.
    pub fn runq_cpu(&self) -> Option<usize> {
        match self.runq.load(Ordering::Relaxed) {
            RUNQ_NONE => None,
            cpu => Some(cpu as usize),
        }
    }

    pub(super) fn set_runq_cpu(&self, cpu: usize) {
        self.runq.store(cpu as u32, Ordering::Relaxed);
    }

    pub fn preempt_level(&self) -> u32 {
        self.preempt.load(Ordering::Relaxed)
    }

    pub(super) fn preempt_add(&self) {
        self.preempt.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the new level.
    pub(super) fn preempt_sub(&self) -> u32 {
        let old = self.preempt.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(old > 0, "thread: preemption counter underflow");
        old - 1
    }

    pub fn pinned(&self) -> u32 {
        self.pinned.load(Ordering::Acquire)
    }

    pub(super) fn pin_add(&self) {
        self.pinned.fetch_add(1, Ordering::Release);
    }

    pub(super) fn pin_sub(&self) {
        let old = self.pinned.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0, "thread: pin counter underflow");
    }

    pub(super) fn entry(&self) -> Option<(fn(usize), usize)> {
        self.entry
    }

    pub(super) fn tcb_ptr(&self) -> *mut arch::tcb::Tcb {
        self.tcb.get()
    }

    /// Real-time priority.
    pub(super) fn rt_priority(&self) -> u16 {
        self.rt.priority
    }

    /// Time-sharing priority.
    pub(super) fn ts_priority(&self) -> u16 {
        self.ts.priority
    }

    /// Time-sharing weight, in ticks per round.
    pub fn ts_weight(&self) -> u32 {
        self.ts.weight
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name.as_str())
            .field("policy", &self.policy)
            .field("state", &self.state())
            .field("has_stack", &self.stack.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::tests::kernel_thread;

    // =========================================================================
    // Identity Tests
    // =========================================================================

    #[test]
    fn test_thread_id_unique() {
        let id1 = ThreadId::new();
        let id2 = ThreadId::new();
        let id3 = ThreadId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_policy_to_class() {
        assert_eq!(SchedPolicy::Fifo.class(), SchedClass::RealTime);
        assert_eq!(SchedPolicy::RoundRobin.class(), SchedClass::RealTime);
        assert_eq!(SchedPolicy::TimeSharing.class(), SchedClass::TimeSharing);
        assert_eq!(SchedPolicy::Idle.class(), SchedClass::Idle);
    }

    #[test]
    fn test_class_ranking() {
        // Lower discriminant outranks higher
        assert!(SchedClass::RealTime < SchedClass::TimeSharing);
        assert!(SchedClass::TimeSharing < SchedClass::Idle);
    }

    // =========================================================================
    // Creation Tests
    // =========================================================================

    #[test]
    fn test_new_thread_initial_state() {
        let thread = kernel_thread("initial_state", SchedPolicy::TimeSharing, 3);

        assert_eq!(thread.state(), ThreadState::Sleeping);
        assert_eq!(thread.preempt_level(), 2);
        assert_eq!(thread.pinned(), 0);
        assert!(thread.runq_cpu().is_none());
        assert!(!thread.test_flag(ThreadFlags::RESCHEDULE));
        assert_eq!(thread.ts_priority(), 3);
        assert_eq!(thread.ts_weight(), crate::sched::ts::prio_to_weight(3));
    }

    #[test]
    fn test_new_thread_registered_with_task() {
        let task = crate::task::Task::new("ctor", None);
        let before = task.nr_threads();

        let attr = ThreadAttr {
            task: Some(task.clone()),
            name: Some("member"),
            policy: SchedPolicy::TimeSharing,
            priority: 0,
        };
        let thread = Thread::new(&attr, |_| {}, 0).unwrap();

        assert_eq!(task.nr_threads(), before + 1);
        assert!(Arc::ptr_eq(thread.task(), &task));
    }

    #[test]
    fn test_name_defaults_to_task_name() {
        let task = crate::task::Task::new("fallback", None);
        let attr = ThreadAttr {
            task: Some(task),
            name: None,
            policy: SchedPolicy::TimeSharing,
            priority: 0,
        };
        let thread = Thread::new(&attr, |_| {}, 0).unwrap();
        assert_eq!(thread.name(), "fallback");
    }

    #[test]
    fn test_booter_is_non_schedulable_shim() {
        let booter = Thread::new_booter(3);

        assert_eq!(booter.state(), ThreadState::Running);
        assert_eq!(booter.preempt_level(), 1);
        assert_eq!(booter.class(), SchedClass::Idle);
        assert!(booter.runq_cpu().is_none());
        assert!(booter.entry().is_none());
        assert_eq!(booter.name(), "booter/3");
    }

    #[test]
    #[should_panic(expected = "invalid priority")]
    fn test_rt_priority_out_of_range() {
        kernel_thread("bad_prio", SchedPolicy::Fifo, RT_PRIO_MAX + 1);
    }

    // =========================================================================
    // Flag and Counter Tests
    // =========================================================================

    #[test]
    fn test_flag_set_clear() {
        let thread = kernel_thread("flags", SchedPolicy::TimeSharing, 0);

        assert!(!thread.test_flag(ThreadFlags::RESCHEDULE));
        thread.set_flag(ThreadFlags::RESCHEDULE);
        assert!(thread.test_flag(ThreadFlags::RESCHEDULE));
        thread.clear_flag(ThreadFlags::RESCHEDULE);
        assert!(!thread.test_flag(ThreadFlags::RESCHEDULE));
    }

    #[test]
    fn test_preempt_counter() {
        let thread = kernel_thread("preempt", SchedPolicy::TimeSharing, 0);

        assert_eq!(thread.preempt_level(), 2);
        thread.preempt_add();
        assert_eq!(thread.preempt_level(), 3);
        assert_eq!(thread.preempt_sub(), 2);
        assert_eq!(thread.preempt_sub(), 1);
        assert_eq!(thread.preempt_sub(), 0);
    }

    #[test]
    fn test_pin_counter() {
        let thread = kernel_thread("pin", SchedPolicy::TimeSharing, 0);

        assert_eq!(thread.pinned(), 0);
        thread.pin_add();
        thread.pin_add();
        assert_eq!(thread.pinned(), 2);
        thread.pin_sub();
        assert_eq!(thread.pinned(), 1);
    }

    #[test]
    fn test_state_transitions() {
        let thread = kernel_thread("states", SchedPolicy::TimeSharing, 0);

        assert_eq!(thread.state(), ThreadState::Sleeping);
        thread.set_state(ThreadState::Running);
        assert_eq!(thread.state(), ThreadState::Running);
        thread.set_state(ThreadState::Dead);
        assert_eq!(thread.state(), ThreadState::Dead);
    }
}

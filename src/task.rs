//! Task management
//!
//! A task owns an address space and a set of threads. The scheduler treats
//! tasks as mostly opaque: it consults the address-space root on context
//! switch and keeps every schedulable thread registered with its owning
//! task from creation until the reaper destroys it (which is also what
//! keeps the thread structure alive across context switches).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Lazy;

use crate::sched::{ThreadId, ThreadRef};
use crate::sync::SpinLock;

/// Maximum task name length.
pub const TASK_NAME_LEN: usize = 32;

pub type TaskRef = Arc<Task>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Task identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    fn new() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// The task every kernel thread belongs to. It runs in the kernel address
/// space, so switching to one of its threads never reloads page tables.
static KERNEL_TASK: Lazy<TaskRef> = Lazy::new(|| Task::new("kernel", None));

pub fn kernel_task() -> &'static TaskRef {
    &KERNEL_TASK
}

/// A task: a name, an address space and the threads running in it.
pub struct Task {
    id: TaskId,
    name: heapless::String<TASK_NAME_LEN>,
    /// Physical root of the task's page tables; `None` means the kernel
    /// address space.
    page_table_root: Option<u64>,
    threads: SpinLock<HashMap<ThreadId, ThreadRef>>,
}

impl Task {
    pub fn new(name: &str, page_table_root: Option<u64>) -> TaskRef {
        let mut bounded = heapless::String::new();
        for c in name.chars().take(TASK_NAME_LEN) {
            let _ = bounded.push(c);
        }

        Arc::new(Self {
            id: TaskId::new(),
            name: bounded,
            page_table_root,
            threads: SpinLock::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_table_root(&self) -> Option<u64> {
        self.page_table_root
    }

    /// Number of registered threads.
    pub fn nr_threads(&self) -> usize {
        self.threads.lock().len()
    }
}

/// Register a thread with its owning task. Called on creation; the registry
/// reference is what keeps the thread structure alive while it is off every
/// run queue.
pub fn add_thread(task: &TaskRef, thread: &ThreadRef) {
    task.threads.lock().insert(thread.id(), thread.clone());
}

/// Unregister a destroyed thread.
pub fn remove_thread(task: &TaskRef, thread: &ThreadRef) {
    task.threads.lock().remove(&thread.id());
}

/// Load the task's address space if it has a private one.
pub fn load_address_space(task: &TaskRef) {
    if let Some(root) = task.page_table_root {
        crate::arch::load_page_table(root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{SchedPolicy, Thread, ThreadAttr};

    fn test_thread(task: &TaskRef) -> ThreadRef {
        let attr = ThreadAttr {
            task: Some(task.clone()),
            name: Some("task_test"),
            policy: SchedPolicy::TimeSharing,
            priority: 0,
        };
        Thread::new(&attr, |_| {}, 0).expect("thread allocation failed")
    }

    #[test]
    fn test_kernel_task_identity() {
        let a = kernel_task();
        let b = kernel_task();
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(a.name(), "kernel");
        assert!(a.page_table_root().is_none());
    }

    #[test]
    fn test_task_ids_unique() {
        let a = Task::new("a", None);
        let b = Task::new("b", None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_thread_registry() {
        let task = Task::new("registry", None);
        let before = task.nr_threads();

        let thread = test_thread(&task);
        assert_eq!(task.nr_threads(), before + 1);

        remove_thread(&task, &thread);
        assert_eq!(task.nr_threads(), before);
    }

    #[test]
    fn test_name_truncation() {
        let task = Task::new(
            "a-task-name-that-is-much-longer-than-the-limit",
            None,
        );
        assert_eq!(task.name().len(), TASK_NAME_LEN);
    }
}

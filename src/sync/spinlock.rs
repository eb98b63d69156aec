//! Raw ticket spinlock
//!
//! FIFO-fair: acquirers take a ticket and wait for it to be served. Holding
//! a lock disables preemption (the counter is re-enabled on release), which
//! is what makes the run-queue locking discipline work: whenever a run-queue
//! lock is held, the current thread's preemption counter is at least 1.
//!
//! Two escape hatches support the scheduler's context-switch hand-off, where
//! the thread that releases a run-queue lock is not the thread that acquired
//! it:
//! - [`SpinGuard::leak`] forgets a guard, leaving the lock held.
//! - [`SpinLock::adopt`] unsafely re-materializes a guard for a lock known
//!   to be held by the calling context.
//!
//! Neither touches the preemption counter; the counter value travels with
//! the switch contract instead (see `sched::runq`).

use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::sched;

/// A ticket spinlock protecting `T`.
pub struct SpinLock<T> {
    next_ticket: AtomicU32,
    owner: AtomicU32,
    data: UnsafeCell<T>,
}

// Mutual exclusion makes shared access sound for Send data.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            owner: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the lock, spinning until it is available.
    ///
    /// Preemption stays disabled until the returned guard is dropped.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        sched::preempt_disable();

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        while self.owner.load(Ordering::Acquire) != ticket {
            core::hint::spin_loop();
        }

        SpinGuard { lock: self }
    }

    /// Disable local interrupts and acquire the lock. Returns the guard and
    /// the saved interrupt state, to be restored after release.
    pub fn lock_intr_save(&self) -> (SpinGuard<'_, T>, bool) {
        let flags = crate::arch::intr_save();
        (self.lock(), flags)
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::Relaxed) != self.next_ticket.load(Ordering::Relaxed)
    }

    /// Re-materialize a guard for a lock the calling context already holds.
    ///
    /// Does not adjust the preemption counter: the acquisition that is being
    /// adopted already accounted for it.
    ///
    /// # Safety
    ///
    /// The lock must be held, with no other live guard for it, and the
    /// calling context must be the one responsible for releasing it (e.g. a
    /// thread resuming from a context switch under the run-queue lock).
    pub unsafe fn adopt(&self) -> SpinGuard<'_, T> {
        debug_assert!(self.is_locked());
        SpinGuard { lock: self }
    }
}

impl<T> fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// RAII guard for a [`SpinLock`].
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinGuard<'a, T> {
    /// Leave the lock held and forget the guard. The matching release must
    /// come from a context that re-adopts the guard.
    pub fn leak(self) {
        core::mem::forget(self);
    }

    /// Release the lock and hand back a reference to it, for the monitor
    /// hand-off in `sched::sleep` (release the interlock, re-acquire it
    /// after waking).
    pub fn into_lock(self) -> &'a SpinLock<T> {
        let lock = self.lock;
        drop(self);
        lock
    }

    /// Release the lock, then restore a saved interrupt state.
    pub fn unlock_intr_restore(self, flags: bool) {
        drop(self);
        crate::arch::intr_restore(flags);
    }
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.fetch_add(1, Ordering::Release);
        sched::preempt_enable();
    }
}

//! Condition variable
//!
//! Monitor-style waiting on a [`Mutex`]. The waiter queue spinlock is the
//! sleep interlock: a waiter publishes itself, releases the mutex, then
//! sleeps while the scheduler atomically drops the queue lock. A signaller
//! must hold the queue lock to pop a waiter, so wakeups cannot be lost.
//!
//! Within the wait-queue lock level, a condition's queue lock is acquired
//! before the associated mutex's state lock (the wait path releases the
//! mutex while holding the queue lock); the reverse never happens.

use alloc::collections::VecDeque;

use super::{MutexGuard, SpinLock};
use crate::sched::{self, ThreadRef};

/// A condition variable for use with [`Mutex`].
pub struct Condition {
    waiters: SpinLock<VecDeque<ThreadRef>>,
}

impl Condition {
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Atomically release the mutex and wait for a signal, then re-acquire
    /// the mutex. The predicate must be re-checked by the caller.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mut waiters = self.waiters.lock();
        waiters.push_back(sched::current());

        let mutex = guard.into_mutex();

        // Release the re-acquired queue lock before sleeping on the mutex
        drop(sched::sleep(waiters));

        mutex.lock()
    }

    /// Wake one waiter, if any.
    pub fn signal(&self) {
        let waiter = self.waiters.lock().pop_front();

        if let Some(waiter) = waiter {
            sched::wakeup(&waiter);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let waiters = core::mem::take(&mut *self.waiters.lock());

        for waiter in &waiters {
            sched::wakeup(waiter);
        }
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

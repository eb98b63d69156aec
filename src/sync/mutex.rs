//! Sleeping mutex
//!
//! A mutex whose contended path puts the caller to sleep through the
//! scheduler instead of spinning. The wait queue is protected by a raw
//! spinlock which doubles as the sleep interlock, so a waiter commits to
//! sleeping atomically with publishing itself on the queue.
//!
//! Not usable from interrupt context or while holding a run-queue lock.

use alloc::collections::VecDeque;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::SpinLock;
use crate::sched::{self, ThreadRef};

struct MutexState {
    locked: bool,
    waiters: VecDeque<ThreadRef>,
}

/// A sleeping mutual-exclusion lock protecting `T`.
pub struct Mutex<T> {
    state: SpinLock<MutexState>,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: SpinLock::new(MutexState {
                locked: false,
                waiters: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the mutex, sleeping while it is owned by another thread.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            let mut state = self.state.lock();

            if !state.locked {
                state.locked = true;
                return MutexGuard { mutex: self };
            }

            state.waiters.push_back(sched::current());

            // Commits to sleeping while releasing the wait-queue lock, so
            // the unlock path cannot miss us.
            let _state = sched::sleep(state);
        }
    }

    /// Try to acquire the mutex without sleeping.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let mut state = self.state.lock();

        if state.locked {
            return None;
        }

        state.locked = true;
        Some(MutexGuard { mutex: self })
    }

    fn unlock(&self) {
        let waiter = {
            let mut state = self.state.lock();
            state.locked = false;
            state.waiters.pop_front()
        };

        if let Some(waiter) = waiter {
            sched::wakeup(&waiter);
        }
    }
}

/// RAII guard for a [`Mutex`].
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Release the mutex and hand back a reference to it, so a condition
    /// variable can re-acquire it after sleeping.
    pub(super) fn into_mutex(self) -> &'a Mutex<T> {
        let mutex = self.mutex;
        drop(self);
        mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

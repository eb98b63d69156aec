//! # Synchronization primitives
//!
//! The raw ticket [`SpinLock`] is the foundation the scheduler builds on;
//! the sleeping [`Mutex`] and [`Condition`] are built on top of the
//! scheduler in turn (they are consumed by the reaper).
//!
//! See the crate-level documentation for the lock hierarchy.

mod condition;
mod mutex;
mod spinlock;

pub use condition::Condition;
pub use mutex::{Mutex, MutexGuard};
pub use spinlock::{SpinGuard, SpinLock};

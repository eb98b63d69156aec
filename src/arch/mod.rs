//! Architecture-specific code
//!
//! The scheduler consumes a small CPU facade:
//! - Local interrupt gate (enable/disable/save/restore/query)
//! - CPU identity and count
//! - Idle wait and the reschedule IPI
//! - The per-CPU current-thread pointer
//! - The context-switch trampoline ([`tcb`])
//!
//! Test builds swap the whole facade for a host emulation where each test
//! thread acts as its own CPU.

#[cfg(all(feature = "arch-x86_64", not(test)))]
pub mod x86_64;

#[cfg(all(feature = "arch-x86_64", not(test)))]
pub use x86_64::{
    cpu_count, cpu_id, cpu_idle, current_thread, intr_disable, intr_enable, intr_enabled,
    intr_restore, intr_save, load_page_table, send_reschedule, set_current_thread, tcb,
};

#[cfg(test)]
pub mod host;

#[cfg(test)]
pub use host::{
    cpu_count, cpu_id, cpu_idle, current_thread, intr_disable, intr_enable, intr_enabled,
    intr_restore, intr_save, load_page_table, send_reschedule, set_current_thread, tcb,
};

/// Maximum number of CPUs supported by the scheduler.
pub const MAX_CPUS: usize = 16;

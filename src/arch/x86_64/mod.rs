//! x86_64 CPU support
//!
//! Interrupt gate, CPU identity, the reschedule IPI and the per-CPU
//! current-thread pointer. Full platform bring-up (trampolines, GDT/IDT,
//! paging) lives outside this crate; only what the scheduler consumes is
//! provided here.

pub mod apic;
pub mod tcb;

use core::arch::asm;
use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use super::MAX_CPUS;

/// Number of CPUs online. The platform reports the result of its processor
/// enumeration through [`set_cpu_count`] before the scheduler is set up.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1); // BSP is always online

/// Per-CPU pointer to the currently running thread, maintained by the
/// scheduler across context switches.
static CURRENT_THREAD: [AtomicPtr<u8>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];

/// Record the number of online CPUs (from ACPI/MP enumeration).
pub fn set_cpu_count(count: u32) {
    assert!(count >= 1 && count as usize <= MAX_CPUS);
    CPU_COUNT.store(count, Ordering::SeqCst);
}

/// Get number of online CPUs
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::SeqCst) as usize
}

/// Get current CPU index.
///
/// APIC IDs are assumed sequential from 0, the same assumption the AP
/// bring-up path makes.
pub fn cpu_id() -> usize {
    apic::apic_id() as usize
}

/// Query the local interrupt flag.
pub fn intr_enabled() -> bool {
    let rflags: u64;
    unsafe {
        asm!("pushfq; pop {}", out(reg) rflags, options(preserves_flags));
    }
    rflags & (1 << 9) != 0
}

/// Enable local interrupts.
pub fn intr_enable() {
    unsafe { asm!("sti", options(nomem, nostack)) };
}

/// Disable local interrupts.
pub fn intr_disable() {
    unsafe { asm!("cli", options(nomem, nostack)) };
}

/// Disable local interrupts, returning the previous state.
pub fn intr_save() -> bool {
    let enabled = intr_enabled();
    intr_disable();
    enabled
}

/// Restore a previously saved interrupt state.
pub fn intr_restore(enabled: bool) {
    if enabled {
        intr_enable();
    }
}

/// Wait for the next interrupt.
pub fn cpu_idle() {
    unsafe { asm!("hlt", options(nomem, nostack)) };
}

/// Send a reschedule IPI to a remote CPU.
///
/// The receiving vector must be routed to [`crate::sched::reschedule_intr`].
pub fn send_reschedule(cpu: usize) {
    apic::send_ipi(cpu as u32, apic::RESCHEDULE_VECTOR);
}

/// Switch address spaces by loading a new page-table root.
pub fn load_page_table(root: u64) {
    unsafe { asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags)) };
}

/// Read this CPU's current-thread pointer.
pub fn current_thread() -> *mut u8 {
    CURRENT_THREAD[cpu_id()].load(Ordering::Relaxed)
}

/// Install this CPU's current-thread pointer. Only the scheduler calls this,
/// under the local run-queue lock.
pub fn set_current_thread(thread: *mut u8) {
    CURRENT_THREAD[cpu_id()].store(thread, Ordering::Relaxed);
}

//! Local APIC access
//!
//! Just enough of the local APIC for the scheduler: reading the APIC ID and
//! sending fixed-vector IPIs. The APIC registers are accessed through their
//! identity-mapped MMIO window.

use core::sync::atomic::{AtomicU64, Ordering};

/// Vector used for reschedule IPIs.
pub const RESCHEDULE_VECTOR: u8 = 0xFE;

/// APIC base address (mapped)
static APIC_BASE: AtomicU64 = AtomicU64::new(0xFEE0_0000);

const APIC_ID_OFFSET: u64 = 0x20;
const APIC_EOI_OFFSET: u64 = 0xB0;
const APIC_ICR_LOW_OFFSET: u64 = 0x300;
const APIC_ICR_HIGH_OFFSET: u64 = 0x310;

/// Record the APIC base detected from the IA32_APIC_BASE MSR during platform
/// bring-up.
pub fn set_apic_base(base: u64) {
    APIC_BASE.store(base, Ordering::SeqCst);
}

fn base() -> u64 {
    APIC_BASE.load(Ordering::Relaxed)
}

/// Read the local APIC ID.
pub fn apic_id() -> u32 {
    let value = unsafe { core::ptr::read_volatile((base() + APIC_ID_OFFSET) as *const u32) };
    (value >> 24) & 0xFF
}

/// Send a fixed-delivery IPI to a specific CPU.
pub fn send_ipi(apic_id: u32, vector: u8) {
    let icr_low_addr = (base() + APIC_ICR_LOW_OFFSET) as *mut u32;
    let icr_high_addr = (base() + APIC_ICR_HIGH_OFFSET) as *mut u32;

    unsafe {
        // Set destination
        core::ptr::write_volatile(icr_high_addr, apic_id << 24);

        // Fixed delivery mode, edge-triggered, assert
        core::ptr::write_volatile(icr_low_addr, 0x0000_4000 | (vector as u32));
    }

    wait_ipi_delivery();
}

/// Send EOI (End of Interrupt) to the local APIC
pub fn send_eoi() {
    let eoi_addr = (base() + APIC_EOI_OFFSET) as *mut u32;
    unsafe { core::ptr::write_volatile(eoi_addr, 0) };
}

/// Wait until the delivery status bit clears.
fn wait_ipi_delivery() {
    let icr_low_addr = (base() + APIC_ICR_LOW_OFFSET) as *const u32;

    loop {
        let icr_low = unsafe { core::ptr::read_volatile(icr_low_addr) };
        if icr_low & (1 << 12) == 0 {
            break;
        }
        core::hint::spin_loop();
    }
}

//! Panic handling
//!
//! A kernel panic is terminal: mask interrupts, report the failure through
//! the log facade, park the processor.

use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::arch::intr_disable();

    match info.location() {
        Some(location) => log::error!(
            "kernel panic: {} ({}:{})",
            info.message(),
            location.file(),
            location.line()
        ),
        None => log::error!("kernel panic: {}", info.message()),
    }

    loop {
        crate::arch::cpu_idle();
    }
}

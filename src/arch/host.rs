//! Host emulation of the CPU facade for test builds
//!
//! Each test thread acts as its own CPU: the CPU index, the interrupt flag
//! and the current-thread pointer are thread-local, so parallel tests don't
//! interfere. Reschedule IPIs are recorded instead of delivered so tests can
//! assert on them.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

static SENT_IPIS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

std::thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
    static INTR_ENABLED: Cell<bool> = const { Cell::new(true) };
    static CURRENT_THREAD: Cell<*mut u8> = const { Cell::new(core::ptr::null_mut()) };
}

/// Pretend this test thread is CPU `id`.
pub fn set_cpu_id(id: usize) {
    CPU_ID.with(|c| c.set(id));
}

pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::SeqCst);
}

/// Drain the reschedule IPIs recorded so far (target CPU indices).
pub fn take_sent_ipis() -> Vec<usize> {
    core::mem::take(&mut SENT_IPIS.lock().unwrap())
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::SeqCst) as usize
}

pub fn cpu_id() -> usize {
    CPU_ID.with(|c| c.get())
}

pub fn intr_enabled() -> bool {
    INTR_ENABLED.with(|c| c.get())
}

pub fn intr_enable() {
    INTR_ENABLED.with(|c| c.set(true));
}

pub fn intr_disable() {
    INTR_ENABLED.with(|c| c.set(false));
}

pub fn intr_save() -> bool {
    let enabled = intr_enabled();
    intr_disable();
    enabled
}

pub fn intr_restore(enabled: bool) {
    if enabled {
        intr_enable();
    }
}

pub fn cpu_idle() {
    std::thread::yield_now();
}

pub fn send_reschedule(cpu: usize) {
    SENT_IPIS.lock().unwrap().push(cpu);
}

pub fn load_page_table(_root: u64) {}

pub fn current_thread() -> *mut u8 {
    CURRENT_THREAD.with(|c| c.get())
}

pub fn set_current_thread(thread: *mut u8) {
    CURRENT_THREAD.with(|c| c.set(thread));
}

pub mod tcb {
    //! Context-switch stubs. Host tests exercise scheduling decisions, not
    //! actual stack switching.

    #[derive(Default)]
    pub struct Tcb;

    impl Tcb {
        pub const fn new() -> Self {
            Self
        }
    }

    /// # Safety
    ///
    /// No-op on the host.
    pub unsafe fn init(_tcb: &mut Tcb, _stack_top: *mut u8, _entry: extern "C" fn() -> !) {}

    /// # Safety
    ///
    /// No-op on the host; control simply continues in the caller.
    pub unsafe fn switch(_prev: *mut Tcb, _next: *mut Tcb) {}

    /// # Safety
    ///
    /// Never sound to call on the host.
    pub unsafe fn load(_next: *mut Tcb) -> ! {
        unreachable!("tcb load is not available on the host");
    }
}

//! Idle scheduling class
//!
//! Each run queue owns exactly one idler, installed at setup and returned
//! by `get_next` when the other classes are empty. Idlers are `Running`
//! from creation, never sleep, and never transit the normal enqueue paths;
//! using those paths on an idle-class thread is a fatal error.

use super::runq::RunqState;
use super::thread::{Thread, ThreadAttr, ThreadRef};
use super::SchedPolicy;
use crate::arch;
use crate::task;

pub(super) fn select_runq() -> ! {
    panic!("thread: idler threads cannot be awaken");
}

pub(super) fn add(_state: &mut RunqState, _thread: &ThreadRef) {
    panic!("thread: only idle threads are allowed in the idle class");
}

pub(super) fn remove(_state: &mut RunqState, _thread: &ThreadRef) {
    panic!("thread: only idle threads are allowed in the idle class");
}

pub(super) fn get_next(state: &RunqState) -> Option<ThreadRef> {
    state.idler.clone()
}

fn idler_main(_arg: usize) {
    loop {
        arch::cpu_idle();
    }
}

/// Create and install the idler for a run queue. Fatal on allocation
/// failure: a run queue cannot operate without its idler.
pub(super) fn setup(rq: &'static super::runq::RunQueue) {
    let mut name = heapless::String::<{ super::thread::THREAD_NAME_LEN }>::new();
    let _ = core::fmt::Write::write_fmt(&mut name, format_args!("idler/{}", rq.id));

    let attr = ThreadAttr {
        task: Some(task::kernel_task().clone()),
        name: Some(&name),
        policy: SchedPolicy::Idle,
        priority: 0,
    };

    let idler = match Thread::new(&attr, idler_main, 0) {
        Ok(idler) => idler,
        Err(_) => panic!("thread: unable to allocate idler thread"),
    };

    // Idlers never sleep: running from creation, installed directly
    // instead of being woken.
    idler.set_state(super::ThreadState::Running);

    let (mut state, flags) = rq.lock.lock_intr_save();
    state.idler = Some(idler);
    state.unlock_intr_restore(flags);

    log::debug!("thread: idler installed on cpu {}", rq.id);
}

//! Host-side fixtures for kernel state tests
//!
//! The global kernel state is driven directly: tests build ready TCBs,
//! point the current-task pointer at whichever task is "running" and call
//! kernel APIs as that task. With the stub port a context switch is a
//! no-op, so a call that would block parks the task and returns; the test
//! then acts for the next task. Fixtures serialize on one lock because
//! the kernel state is a process-wide singleton.

extern crate std;

use core::ptr::NonNull;
use std::boxed::Box;
use std::sync::{Mutex, MutexGuard};

use crate::state;
use crate::task::OsTcb;
use crate::types::{OsPrio, OsTaskState, OsTick};

static STATE_LOCK: Mutex<()> = Mutex::new(());

/// Exclusive handle on a freshly reset kernel state
pub(crate) struct KernelFixture {
    _guard: MutexGuard<'static, ()>,
}

/// Reset the kernel state and mark the kernel running
pub(crate) fn kernel_fixture() -> KernelFixture {
    let guard = STATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());

    unsafe { state::os_reset_state() };
    state::KERNEL.set_initialized(true);
    state::KERNEL.set_running(true);

    KernelFixture { _guard: guard }
}

impl KernelFixture {
    /// Create a ready task fixture at the given priority
    pub fn spawn(&self, name: &'static str, prio: OsPrio) -> NonNull<OsTcb> {
        let tcb = Box::leak(Box::new(OsTcb::new()));
        tcb.name = name;
        tcb.prio = prio;
        tcb.base_prio = prio;
        tcb.task_state = OsTaskState::Ready;

        let ptr = NonNull::from(tcb);
        unsafe { crate::sched::os_rdy_list_insert(ptr) };
        ptr
    }

    /// Make a task the current one
    pub fn set_current(&self, tcb: NonNull<OsTcb>) {
        unsafe { state::set_tcb_cur_ptr(Some(tcb)) };
    }

    /// Advance the tick clock, running the tick handler once per tick
    pub fn tick(&self, ticks: OsTick) {
        for _ in 0..ticks {
            crate::time::os_tick_handler();
        }
    }
}

impl Drop for KernelFixture {
    fn drop(&mut self) {
        state::KERNEL.set_running(false);
    }
}

//! Scheduler module
//!
//! Priority-based preemptive scheduler with round-robin among equals, plus
//! the generic blocking machinery shared by every waitable kernel object:
//! a task blocks by leaving the ready list, joining the object's pend list
//! and (for timed waits) the tick wheel; it unblocks through the symmetric
//! path with a wake status.

mod rdy_list;

pub use rdy_list::ReadyList;

use core::ptr::NonNull;

use crate::config::CFG_SCHED_ROUND_ROBIN_EN;
use crate::critical::{critical_section, is_isr_context, CriticalSection};
use crate::state;
use crate::sync::pend_list::PendList;
use crate::task::OsTcb;
use crate::types::{OsPendOn, OsPendStatus, OsPrio, OsTaskState, OsTick};

/// Main scheduling point
///
/// Determines the highest priority ready task and triggers a context
/// switch if it is not the current one. Called after any operation that
/// may change task readiness or priority.
pub fn os_sched() {
    if !state::KERNEL.is_running() {
        return;
    }

    if is_isr_context() {
        return;
    }

    if state::KERNEL.sched_lock_nesting() > 0 {
        return;
    }

    let _cs = CriticalSection::enter();

    let high_prio = unsafe { state::prio_table().get_highest() };

    unsafe {
        if let Some(high_rdy) = state::rdy_list(high_prio).head() {
            state::set_prio_high_rdy(high_prio);
            state::set_tcb_high_rdy_ptr(Some(high_rdy));

            if Some(high_rdy) != state::tcb_cur_ptr() {
                crate::port::os_ctx_sw();
            }
        }
    }
}

/// Round-robin time slicing for tasks at the same priority; called from
/// the tick handler
pub fn os_sched_round_robin() {
    if !CFG_SCHED_ROUND_ROBIN_EN {
        return;
    }

    if !state::KERNEL.is_running() {
        return;
    }

    if state::KERNEL.sched_lock_nesting() > 0 {
        return;
    }

    critical_section(|_cs| {
        unsafe {
            if let Some(cur_tcb_ptr) = state::tcb_cur_ptr() {
                let cur_tcb = &mut *cur_tcb_ptr.as_ptr();

                if cur_tcb.time_quanta_ctr > 0 {
                    cur_tcb.time_quanta_ctr -= 1;
                }

                if cur_tcb.time_quanta_ctr == 0 {
                    cur_tcb.time_quanta_ctr = cur_tcb.time_quanta;

                    let rdy_list = state::rdy_list(cur_tcb.prio);

                    if rdy_list.has_multiple() && rdy_list.head() == Some(cur_tcb_ptr) {
                        rdy_list.rotate();

                        if let Some(new_head) = rdy_list.head() {
                            state::set_tcb_high_rdy_ptr(Some(new_head));
                        }

                        crate::port::os_ctx_sw();
                    }
                }
            }
        }
    });
}

// ============ Ready list maintenance ============

/// Make a task ready at its effective priority
pub(crate) unsafe fn os_rdy_list_insert(tcb: NonNull<OsTcb>) {
    let prio = unsafe { tcb.as_ref() }.prio;

    unsafe {
        state::rdy_list(prio).push_back(tcb);
        state::prio_table().insert(prio);
    }
}

/// Remove a task from its ready list
pub(crate) unsafe fn os_rdy_list_remove(tcb: NonNull<OsTcb>) {
    let prio = unsafe { tcb.as_ref() }.prio;

    unsafe {
        let rdy_list = state::rdy_list(prio);
        rdy_list.remove(tcb);

        if rdy_list.is_empty() {
            state::prio_table().remove(prio);
        }
    }
}

/// Move a ready task to a different effective priority
pub(crate) unsafe fn os_rdy_list_change_prio(tcb: NonNull<OsTcb>, new_prio: OsPrio) {
    let tcb_ref = unsafe { &mut *tcb.as_ptr() };
    let old_prio = tcb_ref.prio;

    if old_prio == new_prio {
        return;
    }

    unsafe {
        let old_rdy_list = state::rdy_list(old_prio);
        old_rdy_list.remove(tcb);
        if old_rdy_list.is_empty() {
            state::prio_table().remove(old_prio);
        }
    }

    tcb_ref.prio = new_prio;

    unsafe {
        state::rdy_list(new_prio).push_back(tcb);
        state::prio_table().insert(new_prio);
    }
}

// ============ Generic pend machinery ============

/// Block a task on a kernel object's pend list
///
/// Removes the task from the ready list, records what it is blocked on,
/// arms the tick wheel when a deadline is given and enqueues it in
/// priority order. The caller triggers the reschedule.
pub(crate) unsafe fn os_pend_block(
    tcb: NonNull<OsTcb>,
    list: &mut PendList,
    pend_on: OsPendOn,
    obj: *const (),
    deadline: Option<OsTick>,
) {
    unsafe {
        os_rdy_list_remove(tcb);

        let t = &mut *tcb.as_ptr();
        t.pend_on = pend_on;
        t.pend_obj_ptr = obj;
        t.pend_status = OsPendStatus::Ok;

        match deadline {
            Some(expiry) => {
                t.task_state = OsTaskState::PendTimeout;
                state::tick_wheel_insert(tcb, expiry);
            }
            None => {
                t.task_state = OsTaskState::Pend;
            }
        }

        list.insert_by_prio(tcb);
    }
}

/// Wake a task whose wait ended
///
/// The caller has already detached the task from the object's pend list.
/// Clears the wait bookkeeping, disarms the tick wheel and makes the task
/// ready (or leaves it suspended if it was suspended while blocked).
pub(crate) unsafe fn os_pend_wake(tcb: NonNull<OsTcb>, status: OsPendStatus) {
    unsafe {
        let t = &mut *tcb.as_ptr();

        if t.in_tick_wheel {
            state::tick_wheel_remove(tcb);
        }

        t.pend_on = OsPendOn::Nothing;
        t.pend_obj_ptr = core::ptr::null();
        t.pend_status = status;

        match t.task_state {
            OsTaskState::Pend | OsTaskState::PendTimeout => {
                t.task_state = OsTaskState::Ready;
                os_rdy_list_insert(tcb);
            }
            OsTaskState::PendSuspended | OsTaskState::PendTimeoutSuspended => {
                t.task_state = OsTaskState::Suspended;
            }
            _ => {}
        }
    }
}

/// Cancel a task's wait from outside: timeout expiry or pend-abort
///
/// Detaches the task from whatever wait list it is in. For a mutex this
/// goes through the mutex so the owner's inherited priority is
/// recomputed; for everything else the pend object pointer addresses the
/// list directly.
pub(crate) unsafe fn os_pend_cancel(tcb: NonNull<OsTcb>, status: OsPendStatus) {
    unsafe {
        let (pend_on, obj) = {
            let t = tcb.as_ref();
            (t.pend_on, t.pend_obj_ptr)
        };

        match pend_on {
            OsPendOn::Nothing => return,
            #[cfg(feature = "mutex")]
            OsPendOn::Mutex => {
                let mutex = obj as *mut crate::sync::mutex::OsMutex;
                (*mutex).cancel_wait(tcb);
            }
            _ => {
                let list = obj as *mut PendList;
                (*list).remove(tcb);
            }
        }

        os_pend_wake(tcb, status);
    }
}

/// Re-sort a blocked task in its wait list after its effective priority
/// changed
pub(crate) unsafe fn os_pend_reinsert(tcb: NonNull<OsTcb>) {
    unsafe {
        let (pend_on, obj) = {
            let t = tcb.as_ref();
            (t.pend_on, t.pend_obj_ptr)
        };

        match pend_on {
            OsPendOn::Nothing => {}
            #[cfg(feature = "mutex")]
            OsPendOn::Mutex => {
                let mutex = obj as *mut crate::sync::mutex::OsMutex;
                (*mutex).pend_list.reinsert(tcb);
            }
            _ => {
                let list = obj as *mut PendList;
                (*list).reinsert(tcb);
            }
        }
    }
}

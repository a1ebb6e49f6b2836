//! Time management module
//!
//! Tick handling and tick-based sleeps. Sleeping and timed-waiting tasks
//! live in the tick wheel keyed by their absolute expiry tick; the tick
//! handler wakes everything due in the current tick, highest effective
//! priority first, and lets the ISR exit path perform one reschedule.

use core::ptr::NonNull;

use crate::config::CFG_TICK_WHEEL_SIZE;
use crate::critical::{critical_section, is_isr_context};
use crate::error::{OsError, OsResult};
use crate::sched;
use crate::state;
use crate::task::OsTcb;
use crate::types::{OsPendStatus, OsTaskState, OsTick};

/// Whether `expiry` is due at or before `now`, wrap-safe
#[inline]
pub(crate) fn tick_due(expiry: OsTick, now: OsTick) -> bool {
    (expiry.wrapping_sub(now) as i32) <= 0
}

/// Sleep for a number of ticks
///
/// The calling task leaves the ready list and joins the tick wheel; the
/// tick handler makes it ready again once the delay expires.
///
/// # Returns
/// * `Ok(())` - Delay completed (immediately for 0 ticks)
/// * `Err(OsError::Perm)` - Called from ISR or kernel not running
/// * `Err(OsError::Again)` - Scheduler is locked
pub fn os_time_dly(ticks: OsTick) -> OsResult<()> {
    let now = state::KERNEL.tick_get();
    os_time_dly_until(now.wrapping_add(ticks))
}

/// Sleep until an absolute tick
///
/// Returns immediately when the deadline is already in the past.
pub fn os_time_dly_until(deadline: OsTick) -> OsResult<()> {
    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    if is_isr_context() {
        return Err(OsError::Perm);
    }

    if state::KERNEL.sched_lock_nesting() > 0 {
        return Err(OsError::Again);
    }

    let blocked = critical_section(|_cs| {
        if tick_due(deadline, state::KERNEL.tick_get()) {
            return false;
        }

        unsafe {
            if let Some(cur_tcb) = state::tcb_cur_ptr() {
                let tcb = &mut *cur_tcb.as_ptr();

                tcb.task_state = OsTaskState::Delayed;
                state::tick_wheel_insert(cur_tcb, deadline);
                sched::os_rdy_list_remove(cur_tcb);
                return true;
            }
        }
        false
    });

    if blocked {
        sched::os_sched();
    }

    Ok(())
}

/// Get current tick count
#[inline]
pub fn os_time_get() -> OsTick {
    state::KERNEL.tick_get()
}

/// Tick handler; called from the SysTick ISR
pub fn os_tick_handler() {
    if !state::KERNEL.is_running() {
        return;
    }

    state::KERNEL.int_enter();

    let now = state::KERNEL.tick_increment();

    critical_section(|_cs| {
        process_tick_expiries(now);
        sched::os_sched_round_robin();
    });

    state::os_int_exit();
}

/// Wake every task whose expiry tick has been reached
///
/// Due tasks are first unlinked from the wheel slot into a scratch chain,
/// then woken in descending effective-priority order so that equal-priority
/// ready lists end up ordered by urgency of the sleepers.
fn process_tick_expiries(now: OsTick) {
    let slot = (now as usize) % CFG_TICK_WHEEL_SIZE;

    unsafe {
        let mut due_head: Option<NonNull<OsTcb>> = None;

        let mut current = state::tick_wheel_head(slot);
        while let Some(tcb_ptr) = current {
            let next = tcb_ptr.as_ref().tick_next_ptr;

            if tick_due(tcb_ptr.as_ref().tick_expiry, now) {
                state::tick_wheel_remove(tcb_ptr);
                (*tcb_ptr.as_ptr()).tick_next_ptr = due_head;
                due_head = Some(tcb_ptr);
            }

            current = next;
        }

        while let Some(first) = due_head {
            let mut best = first;
            let mut best_prev: Option<NonNull<OsTcb>> = None;

            let mut prev = first;
            let mut it = first.as_ref().tick_next_ptr;
            while let Some(t) = it {
                if t.as_ref().prio > best.as_ref().prio {
                    best = t;
                    best_prev = Some(prev);
                }
                prev = t;
                it = t.as_ref().tick_next_ptr;
            }

            match best_prev {
                Some(p) => (*p.as_ptr()).tick_next_ptr = best.as_ref().tick_next_ptr,
                None => due_head = best.as_ref().tick_next_ptr,
            }
            (*best.as_ptr()).tick_next_ptr = None;

            expire_task(best);
        }
    }
}

/// Transition one due task out of its sleeping or timed-waiting state
unsafe fn expire_task(tcb: NonNull<OsTcb>) {
    unsafe {
        let t = &mut *tcb.as_ptr();

        match t.task_state {
            OsTaskState::Delayed => {
                t.task_state = OsTaskState::Ready;
                sched::os_rdy_list_insert(tcb);
            }
            OsTaskState::DelayedSuspended => {
                t.task_state = OsTaskState::Suspended;
            }
            OsTaskState::PendTimeout | OsTaskState::PendTimeoutSuspended => {
                sched::os_pend_cancel(tcb, OsPendStatus::Timeout);
            }
            _ => {}
        }
    }
}

/// SysTick interrupt handler
#[cfg(target_arch = "arm")]
#[no_mangle]
pub extern "C" fn SysTick() {
    os_tick_handler();
}

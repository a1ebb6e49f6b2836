//! Task management module
//!
//! Task creation, termination with join/detach, suspend/resume, yield,
//! priority changes and wait cancellation.

mod tcb;

pub use tcb::{OsTaskFn, OsTcb};

use core::ptr::NonNull;

use crate::config::{CFG_PRIO_IDLE, CFG_STK_SIZE_MIN, CFG_TIME_QUANTA_DEFAULT};
use crate::critical::{critical_section, is_isr_context};
use crate::error::{OsError, OsResult};
use crate::sched;
use crate::state;
use crate::sync::pend_list::PendList;
use crate::time::tick_due;
use crate::types::{OsPendOn, OsPendStatus, OsPrio, OsStkElement, OsTaskState, OsTick};

/// Create a new task and make it runnable
///
/// The TCB and stack are caller-owned and must outlive the task. The
/// task starts immediately if it outranks the caller and the kernel is
/// running.
///
/// # Arguments
/// * `tcb` - Static mutable reference to the Task Control Block
/// * `stack` - Static mutable reference to the stack array
/// * `name` - Task name for debugging
/// * `task_fn` - Task entry point; the task terminates when it returns
/// * `prio` - Task priority, above the reserved idle priority
pub fn os_task_create(
    tcb: &'static mut OsTcb,
    stack: &'static mut [OsStkElement],
    name: &'static str,
    task_fn: OsTaskFn,
    prio: OsPrio,
) -> OsResult<()> {
    if prio == CFG_PRIO_IDLE {
        return Err(OsError::Invalid);
    }

    unsafe {
        os_task_create_raw(
            tcb as *mut OsTcb,
            name,
            task_fn,
            core::ptr::null_mut(),
            prio,
            stack.as_mut_ptr(),
            stack.len(),
            CFG_TIME_QUANTA_DEFAULT,
        )
    }
}

/// Task creation backend, also used for the idle task
///
/// # Safety
/// `tcb` and `stk_base` must point to storage that outlives the task and
/// is not otherwise in use.
#[doc(hidden)]
pub unsafe fn os_task_create_raw(
    tcb: *mut OsTcb,
    name: &'static str,
    task_fn: OsTaskFn,
    arg: *mut (),
    prio: OsPrio,
    stk_base: *mut OsStkElement,
    stk_size: usize,
    time_quanta: OsTick,
) -> OsResult<()> {
    if tcb.is_null() {
        return Err(OsError::Invalid);
    }

    if stk_base.is_null() || stk_size < CFG_STK_SIZE_MIN {
        return Err(OsError::Invalid);
    }

    if is_isr_context() {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        let tcb_ref = unsafe { &mut *tcb };
        tcb_ref.init();

        tcb_ref.name = name;
        tcb_ref.prio = prio;
        tcb_ref.base_prio = prio;
        tcb_ref.time_quanta = time_quanta;
        tcb_ref.time_quanta_ctr = time_quanta;
        tcb_ref.task_state = OsTaskState::Ready;

        let stk_ptr = unsafe { crate::port::os_task_stk_init(task_fn, arg, stk_base, stk_size) };
        tcb_ref.stk_ptr = stk_ptr;
        tcb_ref.stk_base = stk_base;
        tcb_ref.stk_size = stk_size;
        tcb_ref.stk_limit = unsafe { stk_base.add(stk_size / 10) }; // 10% watermark

        tcb_ref.task_entry = Some(task_fn);
        tcb_ref.task_entry_arg = arg;

        let tcb_nonnull = unsafe { NonNull::new_unchecked(tcb) };
        unsafe {
            sched::os_rdy_list_insert(tcb_nonnull);
        }

        if state::KERNEL.is_running() {
            sched::os_sched();
        }

        Ok(())
    })
}

/// Terminate the calling task
///
/// Called when a task's entry function returns, or directly. Posts the
/// task's join list and yields the CPU for good. Exiting while holding a
/// mutex would leave waiters stranded with a dangling owner, so it is a
/// kernel panic.
pub fn os_task_exit() -> ! {
    critical_section(|_cs| unsafe {
        if let Some(cur) = state::tcb_cur_ptr() {
            os_task_exit_inner(cur);
        }
    });

    sched::os_sched();

    loop {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::wfi();
        #[cfg(not(target_arch = "arm"))]
        core::hint::spin_loop();
    }
}

/// Termination bookkeeping; runs inside a critical section
pub(crate) unsafe fn os_task_exit_inner(cur: NonNull<OsTcb>) {
    unsafe {
        let t = &mut *cur.as_ptr();

        #[cfg(feature = "mutex")]
        if t.owned_head.is_some() {
            panic!("task exited while holding a mutex");
        }

        if t.is_ready() {
            sched::os_rdy_list_remove(cur);
        }
        t.task_state = OsTaskState::Terminated;
        t.exited = true;

        while let Some(waiter) = t.join_list.pop_head() {
            sched::os_pend_wake(waiter, OsPendStatus::Ok);
        }
    }
}

/// Wait for a task to terminate
///
/// Returns immediately when the task has already exited. The TCB and
/// stack may be reclaimed by the caller once join returns `Ok`.
///
/// # Arguments
/// * `tcb` - Task to wait for
/// * `deadline` - Absolute tick to give up at, `None` to wait forever
pub fn os_task_join(tcb: NonNull<OsTcb>, deadline: Option<OsTick>) -> OsResult<()> {
    if is_isr_context() {
        return Err(OsError::Perm);
    }

    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        let cur_tcb_ptr = unsafe { state::tcb_cur_ptr() }.ok_or(OsError::Perm)?;

        if cur_tcb_ptr == tcb {
            return Err(OsError::Deadlock);
        }

        let t = unsafe { &mut *tcb.as_ptr() };

        if !t.joinable {
            return Err(OsError::Invalid);
        }

        if t.exited {
            return Ok(());
        }

        if state::KERNEL.sched_lock_nesting() > 0 {
            return Err(OsError::Again);
        }

        if let Some(expiry) = deadline {
            if tick_due(expiry, state::KERNEL.tick_get()) {
                return Err(OsError::Timeout);
            }
        }

        let list_ptr = &t.join_list as *const PendList as *const ();

        unsafe {
            sched::os_pend_block(
                cur_tcb_ptr,
                &mut t.join_list,
                OsPendOn::Join,
                list_ptr,
                deadline,
            );
        }

        sched::os_sched();

        unsafe {
            let t = cur_tcb_ptr.as_ref();
            if t.is_pending() {
                // resumed without a wake: only possible with the no-op
                // stub port, where blocking cannot happen
                return Err(OsError::Again);
            }
            match t.pend_status {
                OsPendStatus::Ok => Ok(()),
                OsPendStatus::Timeout => Err(OsError::Timeout),
                OsPendStatus::Canceled => Err(OsError::Canceled),
            }
        }
    })
}

/// Mark a task as detached: nobody will join it and its storage is
/// reclaimed by the creator once it terminates
pub fn os_task_detach(tcb: NonNull<OsTcb>) -> OsResult<()> {
    critical_section(|_cs| {
        let t = unsafe { &mut *tcb.as_ptr() };
        t.joinable = false;
        Ok(())
    })
}

/// Change a task's base priority
///
/// The effective priority follows unless a boost from owned mutexes
/// exceeds the new base; either way the change propagates through any
/// inheritance chain the task sits in.
pub fn os_task_change_prio(tcb: NonNull<OsTcb>, new_prio: OsPrio) -> OsResult<()> {
    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    if new_prio == CFG_PRIO_IDLE {
        return Err(OsError::Invalid);
    }

    critical_section(|_cs| {
        let t = unsafe { &mut *tcb.as_ptr() };

        if t.task_state == OsTaskState::Terminated {
            return Err(OsError::Invalid);
        }

        t.base_prio = new_prio;

        #[cfg(feature = "mutex")]
        unsafe {
            crate::sync::mutex::os_prio_propagate(tcb);
        }

        #[cfg(not(feature = "mutex"))]
        unsafe {
            if t.is_ready() {
                sched::os_rdy_list_change_prio(tcb, new_prio);
            } else {
                t.prio = new_prio;
                if t.is_pending() {
                    sched::os_pend_reinsert(tcb);
                }
            }
        }

        Ok(())
    })?;

    sched::os_sched();

    Ok(())
}

/// Abort a task's wait
///
/// The target resumes from its suspension point with `Canceled`; any
/// priority boost it contributed is rolled back on the way out.
pub fn os_task_pend_abort(tcb: NonNull<OsTcb>) -> OsResult<()> {
    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        if !unsafe { tcb.as_ref() }.is_pending() {
            return Err(OsError::Invalid);
        }

        unsafe {
            sched::os_pend_cancel(tcb, OsPendStatus::Canceled);
        }

        Ok(())
    })?;

    sched::os_sched();

    Ok(())
}

/// Give the CPU to the next task of the same priority
pub fn os_task_yield() -> OsResult<()> {
    if is_isr_context() {
        return Err(OsError::Perm);
    }

    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        unsafe {
            if let Some(cur) = state::tcb_cur_ptr() {
                let rdy_list = state::rdy_list(cur.as_ref().prio);
                if rdy_list.head() == Some(cur) {
                    rdy_list.rotate();
                }
            }
        }
    });

    sched::os_sched();

    Ok(())
}

/// Suspend a task (or the caller when `tcb` is `None`)
///
/// Suspension nests; a task blocked while suspended stays off the ready
/// list until both conditions clear.
pub fn os_task_suspend(tcb: Option<NonNull<OsTcb>>) -> OsResult<()> {
    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    if is_isr_context() {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        let tcb_ptr = match tcb {
            Some(ptr) => ptr,
            None => unsafe { state::tcb_cur_ptr() }.ok_or(OsError::Perm)?,
        };

        let tcb_ref = unsafe { &mut *tcb_ptr.as_ptr() };

        if tcb_ref.prio == CFG_PRIO_IDLE {
            return Err(OsError::Perm);
        }

        tcb_ref.suspend_ctr = tcb_ref.suspend_ctr.saturating_add(1);

        match tcb_ref.task_state {
            OsTaskState::Ready => {
                tcb_ref.task_state = OsTaskState::Suspended;
                unsafe { sched::os_rdy_list_remove(tcb_ptr) };
            }
            OsTaskState::Delayed => {
                tcb_ref.task_state = OsTaskState::DelayedSuspended;
            }
            OsTaskState::Pend => {
                tcb_ref.task_state = OsTaskState::PendSuspended;
            }
            OsTaskState::PendTimeout => {
                tcb_ref.task_state = OsTaskState::PendTimeoutSuspended;
            }
            _ => {} // already suspended or not schedulable
        }

        let is_current = unsafe { state::tcb_cur_ptr() } == Some(tcb_ptr);
        if is_current {
            sched::os_sched();
        }

        Ok(())
    })
}

/// Resume a suspended task
pub fn os_task_resume(tcb: NonNull<OsTcb>) -> OsResult<()> {
    if !state::KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    if is_isr_context() {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        if tcb_ref.suspend_ctr == 0 {
            return Err(OsError::Perm);
        }

        tcb_ref.suspend_ctr -= 1;

        if tcb_ref.suspend_ctr == 0 {
            match tcb_ref.task_state {
                OsTaskState::Suspended => {
                    tcb_ref.task_state = OsTaskState::Ready;
                    unsafe { sched::os_rdy_list_insert(tcb) };
                }
                OsTaskState::DelayedSuspended => {
                    tcb_ref.task_state = OsTaskState::Delayed;
                }
                OsTaskState::PendSuspended => {
                    tcb_ref.task_state = OsTaskState::Pend;
                }
                OsTaskState::PendTimeoutSuspended => {
                    tcb_ref.task_state = OsTaskState::PendTimeout;
                }
                _ => {}
            }

            sched::os_sched();
        }

        Ok(())
    })
}

/// TCB of the calling task
#[inline]
pub fn os_task_current() -> Option<NonNull<OsTcb>> {
    unsafe { state::tcb_cur_ptr() }
}

#[cfg(test)]
mod tests {
    use crate::kernel::test_support::kernel_fixture;

    use super::*;

    #[test]
    fn join_blocks_until_exit() {
        let fix = kernel_fixture();
        let waiter = fix.spawn("waiter", 5);
        let worker = fix.spawn("worker", 3);

        fix.set_current(waiter);
        let _ = os_task_join(worker, None);
        assert_eq!(unsafe { waiter.as_ref() }.task_state, OsTaskState::Pend);
        assert_eq!(unsafe { waiter.as_ref() }.pend_on, OsPendOn::Join);

        fix.set_current(worker);
        unsafe { os_task_exit_inner(worker) };

        assert_eq!(unsafe { worker.as_ref() }.task_state, OsTaskState::Terminated);
        assert_eq!(unsafe { waiter.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { waiter.as_ref() }.pend_status, OsPendStatus::Ok);

        // joining an exited task completes immediately
        fix.set_current(waiter);
        assert_eq!(os_task_join(worker, None), Ok(()));
    }

    #[test]
    fn join_self_is_deadlock() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);

        fix.set_current(t1);
        assert_eq!(os_task_join(t1, None), Err(OsError::Deadlock));
    }

    #[test]
    fn join_detached_task_is_invalid() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        let t2 = fix.spawn("t2", 4);

        os_task_detach(t2).unwrap();

        fix.set_current(t1);
        assert_eq!(os_task_join(t2, None), Err(OsError::Invalid));
    }

    #[test]
    fn join_with_deadline_times_out() {
        let fix = kernel_fixture();
        let waiter = fix.spawn("waiter", 5);
        let worker = fix.spawn("worker", 3);

        fix.set_current(waiter);
        let deadline = state::KERNEL.tick_get() + 2;
        let _ = os_task_join(worker, Some(deadline));
        assert_eq!(
            unsafe { waiter.as_ref() }.task_state,
            OsTaskState::PendTimeout
        );

        fix.tick(2);
        assert_eq!(unsafe { waiter.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(
            unsafe { waiter.as_ref() }.pend_status,
            OsPendStatus::Timeout
        );
        assert!(unsafe { worker.as_ref() }.join_list.is_empty());
    }

    #[test]
    fn change_prio_rejects_idle_level() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        assert_eq!(os_task_change_prio(t1, CFG_PRIO_IDLE), Err(OsError::Invalid));
        assert_eq!(os_task_change_prio(t1, 9), Ok(()));
        assert_eq!(unsafe { t1.as_ref() }.prio, 9);
        assert_eq!(unsafe { t1.as_ref() }.base_prio, 9);
    }

    #[test]
    fn suspend_resume_round_trip() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        let t2 = fix.spawn("t2", 4);
        fix.set_current(t1);

        os_task_suspend(Some(t2)).unwrap();
        assert_eq!(unsafe { t2.as_ref() }.task_state, OsTaskState::Suspended);

        // suspension nests
        os_task_suspend(Some(t2)).unwrap();
        os_task_resume(t2).unwrap();
        assert_eq!(unsafe { t2.as_ref() }.task_state, OsTaskState::Suspended);

        os_task_resume(t2).unwrap();
        assert_eq!(unsafe { t2.as_ref() }.task_state, OsTaskState::Ready);

        assert_eq!(os_task_resume(t2), Err(OsError::Perm));
    }

    #[test]
    fn yield_rotates_within_priority_level() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        let t2 = fix.spawn("t2", 5);

        fix.set_current(t1);
        assert_eq!(unsafe { state::rdy_list(5) }.head(), Some(t1));

        os_task_yield().unwrap();
        assert_eq!(unsafe { state::rdy_list(5) }.head(), Some(t2));
    }

    #[test]
    fn create_validates_arguments() {
        extern crate std;
        use std::boxed::Box;

        fn leaked_tcb() -> &'static mut OsTcb {
            Box::leak(Box::new(OsTcb::new()))
        }

        fn leaked_stack(words: usize) -> &'static mut [OsStkElement] {
            Box::leak(std::vec![0 as OsStkElement; words].into_boxed_slice())
        }

        let _fix = kernel_fixture();

        fn entry(_: *mut ()) {}

        assert_eq!(
            os_task_create(leaked_tcb(), leaked_stack(64), "t", entry, CFG_PRIO_IDLE),
            Err(OsError::Invalid)
        );

        assert_eq!(
            os_task_create(leaked_tcb(), leaked_stack(16), "t", entry, 5),
            Err(OsError::Invalid)
        );

        assert_eq!(
            os_task_create(leaked_tcb(), leaked_stack(64), "t", entry, 5),
            Ok(())
        );
    }
}

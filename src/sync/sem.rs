//! Counting semaphore
//!
//! A non-negative counter with a configurable ceiling and a
//! priority-ordered wait list. A posted permit is handed directly to the
//! highest-priority waiter instead of passing through the counter, so a
//! lower-priority task polling the semaphore can never steal a permit
//! meant for a task that is already unblocking. `post` is safe to call
//! from interrupt handlers.

use crate::critical::{critical_section, is_isr_context};
use crate::error::{OsError, OsResult};
use crate::sched;
use crate::state;
use crate::sync::pend_list::PendList;
use crate::time::tick_due;
use crate::types::{OsObjType, OsPendOn, OsPendStatus, OsSemCtr, OsTick};

/// Counting semaphore
pub struct OsSem {
    /// Object type marker
    obj_type: OsObjType,
    /// Tasks waiting on this semaphore, highest priority first
    pend_list: PendList,
    /// Current count
    count: OsSemCtr,
    /// Ceiling; `post` beyond it reports overflow
    max_count: OsSemCtr,
    /// Name for debugging
    #[cfg(feature = "defmt")]
    name: &'static str,
}

impl OsSem {
    /// Create a new semaphore with an unbounded counter
    pub const fn new(count: OsSemCtr) -> Self {
        Self::with_max(count, OsSemCtr::MAX)
    }

    /// Create a new semaphore with a counter ceiling
    pub const fn with_max(count: OsSemCtr, max_count: OsSemCtr) -> Self {
        OsSem {
            obj_type: OsObjType::Sem,
            pend_list: PendList::new(),
            count,
            max_count,
            #[cfg(feature = "defmt")]
            name: "",
        }
    }

    /// Initialize/create the semaphore
    pub fn create(&mut self, count: OsSemCtr, max_count: OsSemCtr, _name: &'static str) -> OsResult<()> {
        if is_isr_context() {
            return Err(OsError::Perm);
        }

        if count > max_count {
            return Err(OsError::Invalid);
        }

        critical_section(|_cs| {
            self.obj_type = OsObjType::Sem;
            self.pend_list.init();
            self.count = count;
            self.max_count = max_count;
            #[cfg(feature = "defmt")]
            {
                self.name = _name;
            }
            Ok(())
        })
    }

    /// Wait on the semaphore
    ///
    /// # Arguments
    /// * `deadline` - Absolute tick to give up at, `None` to wait forever
    /// * `non_blocking` - Fail with `Again` instead of blocking
    pub fn pend(&mut self, deadline: Option<OsTick>, non_blocking: bool) -> OsResult<()> {
        if is_isr_context() {
            return Err(OsError::Perm);
        }

        if !state::KERNEL.is_running() {
            return Err(OsError::Perm);
        }

        if self.obj_type != OsObjType::Sem {
            return Err(OsError::Invalid);
        }

        critical_section(|_cs| {
            if self.count > 0 {
                self.count -= 1;
                return Ok(());
            }

            if non_blocking {
                return Err(OsError::Again);
            }

            if state::KERNEL.sched_lock_nesting() > 0 {
                return Err(OsError::Again);
            }

            if let Some(expiry) = deadline {
                if tick_due(expiry, state::KERNEL.tick_get()) {
                    return Err(OsError::Timeout);
                }
            }

            let cur_tcb_ptr = unsafe { state::tcb_cur_ptr() }.ok_or(OsError::Perm)?;
            let list_ptr = &self.pend_list as *const PendList as *const ();

            unsafe {
                sched::os_pend_block(
                    cur_tcb_ptr,
                    &mut self.pend_list,
                    OsPendOn::Semaphore,
                    list_ptr,
                    deadline,
                );
            }

            sched::os_sched();

            unsafe {
                let t = cur_tcb_ptr.as_ref();
                if t.is_pending() {
                    // resumed without a wake: only possible with the
                    // no-op stub port, where blocking cannot happen
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

    /// Signal the semaphore
    ///
    /// Hands the permit to the highest-priority waiter if there is one;
    /// otherwise increments the counter.
    ///
    /// # Returns
    /// * `Err(OsError::Overflow)` - Counter already at its ceiling
    pub fn post(&mut self) -> OsResult<()> {
        if self.obj_type != OsObjType::Sem {
            return Err(OsError::Invalid);
        }

        critical_section(|_cs| {
            if let Some(waiter) = self.pend_list.pop_head() {
                unsafe { sched::os_pend_wake(waiter, OsPendStatus::Ok) };

                if !is_isr_context() {
                    sched::os_sched();
                }

                Ok(())
            } else if self.count == self.max_count {
                Err(OsError::Overflow)
            } else {
                self.count += 1;
                Ok(())
            }
        })
    }

    /// Current count
    #[inline(always)]
    pub fn count(&self) -> OsSemCtr {
        self.count
    }
}

impl Default for OsSem {
    fn default() -> Self {
        Self::new(0)
    }
}

// ============ Safe Wrapper ============

use core::cell::UnsafeCell;

/// Shareable semaphore handle for static allocation
pub struct Semaphore {
    inner: UnsafeCell<OsSem>,
}

unsafe impl Sync for Semaphore {}
unsafe impl Send for Semaphore {}

impl Semaphore {
    pub const fn new(count: OsSemCtr) -> Self {
        Semaphore {
            inner: UnsafeCell::new(OsSem::new(count)),
        }
    }

    pub const fn with_max(count: OsSemCtr, max_count: OsSemCtr) -> Self {
        Semaphore {
            inner: UnsafeCell::new(OsSem::with_max(count, max_count)),
        }
    }

    pub fn create(&self, count: OsSemCtr, max_count: OsSemCtr, name: &'static str) -> OsResult<()> {
        unsafe { (*self.inner.get()).create(count, max_count, name) }
    }

    /// Block until a permit is available
    pub fn wait(&self) -> OsResult<()> {
        unsafe { (*self.inner.get()).pend(None, false) }
    }

    /// Take a permit without blocking; `Again` when none is available
    pub fn try_wait(&self) -> OsResult<()> {
        unsafe { (*self.inner.get()).pend(None, true) }
    }

    /// Wait at most `ticks` ticks for a permit
    pub fn try_wait_for(&self, ticks: OsTick) -> OsResult<()> {
        let deadline = state::KERNEL.tick_get().wrapping_add(ticks);
        unsafe { (*self.inner.get()).pend(Some(deadline), false) }
    }

    /// Wait until the absolute tick `deadline` for a permit
    pub fn try_wait_until(&self, deadline: OsTick) -> OsResult<()> {
        unsafe { (*self.inner.get()).pend(Some(deadline), false) }
    }

    /// Release one permit
    pub fn post(&self) -> OsResult<()> {
        unsafe { (*self.inner.get()).post() }
    }

    #[inline]
    pub fn count(&self) -> OsSemCtr {
        unsafe { (*self.inner.get()).count() }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use crate::kernel::test_support::kernel_fixture;
    use crate::types::{OsPendStatus, OsTaskState};

    use super::*;

    #[test]
    fn counts_down_then_blocks() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);

        let mut sem = OsSem::new(2);
        sem.create(2, OsSemCtr::MAX, "sem").unwrap();

        fix.set_current(t1);
        assert_eq!(sem.pend(None, true), Ok(()));
        assert_eq!(sem.pend(None, true), Ok(()));
        assert_eq!(sem.count(), 0);
        assert_eq!(sem.pend(None, true), Err(OsError::Again));

        // a blocking wait on the empty semaphore parks the caller
        let _ = sem.pend(None, false);
        assert_eq!(unsafe { t1.as_ref() }.task_state, OsTaskState::Pend);

        assert_eq!(sem.post(), Ok(()));
        assert_eq!(unsafe { t1.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { t1.as_ref() }.pend_status, OsPendStatus::Ok);
        // the permit was transferred, never counted
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn post_wakes_waiters_in_priority_order() {
        let fix = kernel_fixture();
        let low = fix.spawn("low", 5);
        let high = fix.spawn("high", 10);

        let mut sem = OsSem::new(0);
        sem.create(0, OsSemCtr::MAX, "sem").unwrap();

        // the low-priority task blocks first
        fix.set_current(low);
        let _ = sem.pend(None, false);
        fix.set_current(high);
        let _ = sem.pend(None, false);

        // two posts from interrupt context: priority, not arrival order
        assert_eq!(sem.post(), Ok(()));
        assert_eq!(unsafe { high.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { low.as_ref() }.task_state, OsTaskState::Pend);

        assert_eq!(sem.post(), Ok(()));
        assert_eq!(unsafe { low.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(sem.count(), 0);
    }

    #[test]
    fn ceiling_reports_overflow() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        let mut sem = OsSem::with_max(0, 2);
        sem.create(0, 2, "sem").unwrap();

        assert_eq!(sem.post(), Ok(()));
        assert_eq!(sem.post(), Ok(()));
        assert_eq!(sem.post(), Err(OsError::Overflow));
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn timed_wait_expires() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        let mut sem = OsSem::new(0);
        sem.create(0, OsSemCtr::MAX, "sem").unwrap();

        let deadline = state::KERNEL.tick_get() + 3;
        let _ = sem.pend(Some(deadline), false);
        assert_eq!(unsafe { t1.as_ref() }.task_state, OsTaskState::PendTimeout);

        fix.tick(2);
        assert_eq!(unsafe { t1.as_ref() }.task_state, OsTaskState::PendTimeout);

        fix.tick(1);
        assert_eq!(unsafe { t1.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { t1.as_ref() }.pend_status, OsPendStatus::Timeout);
        assert!(sem.pend_list.is_empty());
    }

    #[test]
    fn expired_deadline_fails_without_blocking() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        let mut sem = OsSem::new(0);
        sem.create(0, OsSemCtr::MAX, "sem").unwrap();

        let now = state::KERNEL.tick_get();
        assert_eq!(sem.pend(Some(now), false), Err(OsError::Timeout));
        assert_eq!(unsafe { t1.as_ref() }.task_state, OsTaskState::Ready);
    }
}

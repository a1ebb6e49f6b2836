//! Task Control Block (TCB) definition
//!
//! The TCB contains all the information needed to manage a task: stack
//! bookkeeping, scheduling state, base and effective priority, wait-list
//! membership, the list of owned mutexes feeding priority boosts, and the
//! join list posted on exit.

use core::ptr::NonNull;

use crate::sync::pend_list::PendList;
use crate::types::{
    OsNestingCtr, OsPendOn, OsPendStatus, OsPrio, OsStkElement, OsTaskState, OsTick,
};

/// Task entry point function type
pub type OsTaskFn = fn(*mut ());

/// Task Control Block
#[repr(C)]
pub struct OsTcb {
    // ============ Stack pointer ============
    /// Current stack pointer
    pub stk_ptr: *mut OsStkElement,

    // ============ Stack information ============
    /// Base of stack
    pub stk_base: *mut OsStkElement,
    /// Stack limit pointer
    pub stk_limit: *mut OsStkElement,
    /// Stack size in words
    pub stk_size: usize,

    // ============ Task identification ============
    /// Task name
    pub name: &'static str,

    // ============ Ready list links ============
    /// Next TCB in ready list
    pub next_ptr: Option<NonNull<OsTcb>>,
    /// Previous TCB in ready list
    pub prev_ptr: Option<NonNull<OsTcb>>,

    // ============ Wait list membership ============
    /// Next TCB in pend list
    pub pend_next_ptr: Option<NonNull<OsTcb>>,
    /// Previous TCB in pend list
    pub pend_prev_ptr: Option<NonNull<OsTcb>>,
    /// Kind of object this task is blocked on
    pub pend_on: OsPendOn,
    /// The object blocked on; interpretation depends on `pend_on`
    pub pend_obj_ptr: *const (),
    /// Why the last wait ended
    pub pend_status: OsPendStatus,

    // ============ Tick wheel links ============
    /// Next TCB in tick wheel slot
    pub tick_next_ptr: Option<NonNull<OsTcb>>,
    /// Previous TCB in tick wheel slot
    pub tick_prev_ptr: Option<NonNull<OsTcb>>,
    /// Absolute tick at which the sleep or timed wait expires
    pub tick_expiry: OsTick,
    /// Which tick wheel slot this task is in
    pub tick_wheel_slot: u8,
    /// Whether the task is currently linked into the tick wheel
    pub in_tick_wheel: bool,

    // ============ Priority ============
    /// Effective priority: base plus any boost from owned mutexes
    pub prio: OsPrio,
    /// Priority last set by the user
    pub base_prio: OsPrio,

    // ============ State ============
    /// Current task state
    pub task_state: OsTaskState,
    /// Suspend nesting counter
    pub suspend_ctr: OsNestingCtr,

    // ============ Time slicing ============
    /// Time quanta for this task
    pub time_quanta: OsTick,
    /// Remaining time quanta
    pub time_quanta_ctr: OsTick,

    // ============ Owned mutexes ============
    /// Head of the intrusive list of PI / priority-protect mutexes held by
    /// this task; the links live in the mutex control blocks
    #[cfg(feature = "mutex")]
    pub owned_head: Option<NonNull<crate::sync::mutex::OsMutex>>,

    // ============ Join ============
    /// Tasks waiting for this task to exit
    pub join_list: PendList,
    /// Set when the task has exited
    pub exited: bool,
    /// Cleared by detach; a detached task is reclaimed without join
    pub joinable: bool,

    // ============ Task entry point ============
    /// Task entry function
    pub task_entry: Option<OsTaskFn>,
    /// Task argument
    pub task_entry_arg: *mut (),
}

impl OsTcb {
    /// Create a new, uninitialized TCB
    pub const fn new() -> Self {
        OsTcb {
            stk_ptr: core::ptr::null_mut(),
            stk_base: core::ptr::null_mut(),
            stk_limit: core::ptr::null_mut(),
            stk_size: 0,

            name: "",

            next_ptr: None,
            prev_ptr: None,

            pend_next_ptr: None,
            pend_prev_ptr: None,
            pend_on: OsPendOn::Nothing,
            pend_obj_ptr: core::ptr::null(),
            pend_status: OsPendStatus::Ok,

            tick_next_ptr: None,
            tick_prev_ptr: None,
            tick_expiry: 0,
            tick_wheel_slot: 0,
            in_tick_wheel: false,

            prio: 0,
            base_prio: 0,

            task_state: OsTaskState::Created,
            suspend_ctr: 0,

            time_quanta: 0,
            time_quanta_ctr: 0,

            #[cfg(feature = "mutex")]
            owned_head: None,

            join_list: PendList::new(),
            exited: false,
            joinable: true,

            task_entry: None,
            task_entry_arg: core::ptr::null_mut(),
        }
    }

    /// Initialize TCB to default values
    pub fn init(&mut self) {
        *self = Self::new();
    }

    /// Check if task is ready to run
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.task_state == OsTaskState::Ready
    }

    /// Check if task is blocked on a kernel object
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(
            self.task_state,
            OsTaskState::Pend
                | OsTaskState::PendTimeout
                | OsTaskState::PendSuspended
                | OsTaskState::PendTimeoutSuspended
        )
    }

    /// Check if task is suspended
    #[inline]
    pub fn is_suspended(&self) -> bool {
        matches!(
            self.task_state,
            OsTaskState::Suspended
                | OsTaskState::DelayedSuspended
                | OsTaskState::PendSuspended
                | OsTaskState::PendTimeoutSuspended
        )
    }

    /// Check if task is sleeping
    #[inline]
    pub fn is_delayed(&self) -> bool {
        matches!(
            self.task_state,
            OsTaskState::Delayed | OsTaskState::DelayedSuspended
        )
    }
}

impl Default for OsTcb {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for OsTcb {}
unsafe impl Sync for OsTcb {}

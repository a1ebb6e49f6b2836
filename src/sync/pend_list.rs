//! Generic wait list for blocked tasks
//!
//! Every blocking kernel object (semaphore, mutex, join) keeps its waiters
//! in a `PendList`: an intrusive doubly-linked list ordered by effective
//! priority, highest first, FIFO among equals. The links live in the TCB,
//! which makes removal by token O(1) for the cancel and timeout paths.

use core::ptr::NonNull;

use crate::task::OsTcb;

/// Priority-ordered list of tasks blocked on a kernel object
#[derive(Debug)]
pub struct PendList {
    head: Option<NonNull<OsTcb>>,
    tail: Option<NonNull<OsTcb>>,
}

impl PendList {
    /// Create a new empty pend list
    pub const fn new() -> Self {
        PendList {
            head: None,
            tail: None,
        }
    }

    /// Initialize the pend list
    pub fn init(&mut self) {
        self.head = None;
        self.tail = None;
    }

    /// Check if list is empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Highest-priority waiter
    #[inline(always)]
    pub fn head(&self) -> Option<NonNull<OsTcb>> {
        self.head
    }

    /// Insert in priority order, after any waiters of equal priority
    pub fn insert_by_prio(&mut self, tcb: NonNull<OsTcb>) {
        let prio = unsafe { tcb.as_ref() }.prio;

        let mut prev: Option<NonNull<OsTcb>> = None;
        let mut current = self.head;

        while let Some(cur_ptr) = current {
            let cur_ref = unsafe { cur_ptr.as_ref() };
            if prio > cur_ref.prio {
                break;
            }
            prev = current;
            current = cur_ref.pend_next_ptr;
        }

        let tcb_mut = unsafe { &mut *tcb.as_ptr() };
        tcb_mut.pend_prev_ptr = prev;
        tcb_mut.pend_next_ptr = current;

        match prev {
            Some(p) => {
                unsafe { (*p.as_ptr()).pend_next_ptr = Some(tcb) };
            }
            None => {
                self.head = Some(tcb);
            }
        }

        match current {
            Some(c) => {
                unsafe { (*c.as_ptr()).pend_prev_ptr = Some(tcb) };
            }
            None => {
                self.tail = Some(tcb);
            }
        }
    }

    /// Pop the highest-priority waiter
    pub fn pop_head(&mut self) -> Option<NonNull<OsTcb>> {
        let head = self.head?;
        self.remove(head);
        Some(head)
    }

    /// Remove a specific waiter; O(1) via its TCB links
    pub fn remove(&mut self, tcb: NonNull<OsTcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };

        match tcb_ref.pend_prev_ptr {
            Some(prev) => {
                unsafe { (*prev.as_ptr()).pend_next_ptr = tcb_ref.pend_next_ptr };
            }
            None => {
                self.head = tcb_ref.pend_next_ptr;
            }
        }

        match tcb_ref.pend_next_ptr {
            Some(next) => {
                unsafe { (*next.as_ptr()).pend_prev_ptr = tcb_ref.pend_prev_ptr };
            }
            None => {
                self.tail = tcb_ref.pend_prev_ptr;
            }
        }

        tcb_ref.pend_prev_ptr = None;
        tcb_ref.pend_next_ptr = None;
    }

    /// Restore ordering after a member's effective priority changed
    ///
    /// The waiter is detached and inserted again, landing after any equals
    /// at its new priority.
    pub fn reinsert(&mut self, tcb: NonNull<OsTcb>) {
        self.remove(tcb);
        self.insert_by_prio(tcb);
    }
}

impl Default for PendList {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for PendList {}
unsafe impl Sync for PendList {}

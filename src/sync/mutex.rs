//! Mutex with priority inheritance
//!
//! A mutex combines a type (plain, error-checking or recursive ownership
//! rules) with a locking protocol (none, priority inheritance or priority
//! protect). Protocol mutexes are linked into their owner's owned-mutex
//! list; the owner's effective priority is the maximum of its base
//! priority and the contribution of every owned mutex - the
//! highest-priority waiter for inheritance, the fixed ceiling for protect.
//!
//! Boosts are transitive: when a waiter raises an owner that is itself
//! blocked on another inheritance mutex, the recomputation follows the
//! owner chain until a task is not blocked or its priority settles. The
//! same walk runs in reverse when a boost source disappears - unlock,
//! timeout, cancellation or an explicit priority change.

use core::ptr::NonNull;

use crate::critical::{critical_section, is_isr_context};
use crate::error::{OsError, OsResult};
use crate::sched;
use crate::state;
use crate::sync::pend_list::PendList;
use crate::task::OsTcb;
use crate::time::tick_due;
use crate::types::{OsNestingCtr, OsObjType, OsPendOn, OsPendStatus, OsPrio, OsTick};

/// Ownership rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OsMutexType {
    /// Self-lock and foreign unlock are caught but carry no recursion
    Normal = 0,
    /// Self-lock returns `Deadlock`, foreign unlock returns `Perm`
    ErrorChecking = 1,
    /// Self-lock nests; released when the nesting count reaches zero
    Recursive = 2,
}

/// Locking protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OsMutexProtocol {
    /// No priority adjustment
    None = 0,
    /// Owner inherits the priority of its highest-priority waiter
    PriorityInheritance = 1,
    /// Owner runs at the mutex ceiling while holding the lock
    PriorityProtect = 2,
}

/// Mutex control block
pub struct OsMutex {
    /// Object type marker
    obj_type: OsObjType,
    /// Tasks waiting for the mutex, highest priority first
    pub(crate) pend_list: PendList,
    /// Task that owns the mutex
    owner: Option<NonNull<OsTcb>>,
    /// Nesting counter; > 1 only for recursive mutexes
    nesting_ctr: OsNestingCtr,
    /// Ownership rules
    mtx_type: OsMutexType,
    /// Locking protocol
    protocol: OsMutexProtocol,
    /// Priority ceiling (protect protocol only)
    ceiling: OsPrio,
    /// Next mutex in the owner's owned-mutex list
    owned_next: Option<NonNull<OsMutex>>,
    /// Previous mutex in the owner's owned-mutex list
    owned_prev: Option<NonNull<OsMutex>>,
    /// Name for debugging
    #[cfg(feature = "defmt")]
    name: &'static str,
}

impl OsMutex {
    /// Create a new mutex
    pub const fn new(mtx_type: OsMutexType, protocol: OsMutexProtocol) -> Self {
        OsMutex {
            obj_type: OsObjType::Mutex,
            pend_list: PendList::new(),
            owner: None,
            nesting_ctr: 0,
            mtx_type,
            protocol,
            ceiling: 0,
            owned_next: None,
            owned_prev: None,
            #[cfg(feature = "defmt")]
            name: "",
        }
    }

    /// Create a new priority-protect mutex with the given ceiling
    pub const fn with_ceiling(mtx_type: OsMutexType, ceiling: OsPrio) -> Self {
        let mut mutex = Self::new(mtx_type, OsMutexProtocol::PriorityProtect);
        mutex.ceiling = ceiling;
        mutex
    }

    /// Initialize the mutex
    pub fn create(&mut self, _name: &'static str) -> OsResult<()> {
        if is_isr_context() {
            return Err(OsError::Perm);
        }

        critical_section(|_cs| {
            self.obj_type = OsObjType::Mutex;
            self.pend_list.init();
            self.owner = None;
            self.nesting_ctr = 0;
            self.owned_next = None;
            self.owned_prev = None;
            #[cfg(feature = "defmt")]
            {
                self.name = _name;
            }
            Ok(())
        })
    }

    /// This mutex's contribution to its owner's effective priority
    fn prio_contribution(&self) -> Option<OsPrio> {
        match self.protocol {
            OsMutexProtocol::PriorityInheritance => {
                self.pend_list.head().map(|t| unsafe { t.as_ref() }.prio)
            }
            OsMutexProtocol::PriorityProtect => Some(self.ceiling),
            OsMutexProtocol::None => None,
        }
    }

    /// Link into the owner's owned-mutex list
    unsafe fn owned_list_insert(&mut self, owner: NonNull<OsTcb>) {
        let self_ptr = unsafe { NonNull::new_unchecked(self as *mut OsMutex) };
        let o = unsafe { &mut *owner.as_ptr() };

        self.owned_prev = None;
        self.owned_next = o.owned_head;
        if let Some(mut head) = o.owned_head {
            unsafe { head.as_mut() }.owned_prev = Some(self_ptr);
        }
        o.owned_head = Some(self_ptr);
    }

    /// Unlink from the owner's owned-mutex list
    unsafe fn owned_list_remove(&mut self, owner: NonNull<OsTcb>) {
        let o = unsafe { &mut *owner.as_ptr() };

        match self.owned_prev {
            Some(mut prev) => unsafe { prev.as_mut() }.owned_next = self.owned_next,
            None => o.owned_head = self.owned_next,
        }
        if let Some(mut next) = self.owned_next {
            unsafe { next.as_mut() }.owned_prev = self.owned_prev;
        }

        self.owned_next = None;
        self.owned_prev = None;
    }

    /// Take the free mutex
    unsafe fn acquire(&mut self, tcb: NonNull<OsTcb>) {
        self.owner = Some(tcb);
        self.nesting_ctr = 1;

        if self.protocol != OsMutexProtocol::None {
            unsafe {
                self.owned_list_insert(tcb);
                os_prio_propagate(tcb);
            }
        }
    }

    /// Acquire the mutex
    ///
    /// # Arguments
    /// * `deadline` - Absolute tick to give up at, `None` to wait forever
    /// * `non_blocking` - Fail with `Busy` instead of blocking
    pub fn pend(&mut self, deadline: Option<OsTick>, non_blocking: bool) -> OsResult<()> {
        if is_isr_context() {
            return Err(OsError::Perm);
        }

        if !state::KERNEL.is_running() {
            return Err(OsError::Perm);
        }

        if self.obj_type != OsObjType::Mutex {
            return Err(OsError::Invalid);
        }

        critical_section(|_cs| {
            let cur_tcb_ptr = unsafe { state::tcb_cur_ptr() }.ok_or(OsError::Perm)?;

            if self.protocol == OsMutexProtocol::PriorityProtect
                && unsafe { cur_tcb_ptr.as_ref() }.prio > self.ceiling
            {
                return Err(OsError::Invalid);
            }

            let owner = match self.owner {
                None => {
                    unsafe { self.acquire(cur_tcb_ptr) };
                    return Ok(());
                }
                Some(owner) if owner == cur_tcb_ptr => {
                    return match self.mtx_type {
                        OsMutexType::Recursive => {
                            if self.nesting_ctr == OsNestingCtr::MAX {
                                Err(OsError::Overflow)
                            } else {
                                self.nesting_ctr += 1;
                                Ok(())
                            }
                        }
                        _ => Err(OsError::Deadlock),
                    };
                }
                Some(owner) => owner,
            };

            if non_blocking {
                return Err(OsError::Busy);
            }

            if state::KERNEL.sched_lock_nesting() > 0 {
                return Err(OsError::Again);
            }

            if let Some(expiry) = deadline {
                if tick_due(expiry, state::KERNEL.tick_get()) {
                    return Err(OsError::Timeout);
                }
            }

            let self_ptr = self as *mut OsMutex as *const ();

            unsafe {
                sched::os_pend_block(
                    cur_tcb_ptr,
                    &mut self.pend_list,
                    OsPendOn::Mutex,
                    self_ptr,
                    deadline,
                );

                if self.protocol == OsMutexProtocol::PriorityInheritance {
                    os_prio_propagate(owner);
                }
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

    /// Release the mutex
    ///
    /// A recursive mutex only releases when the nesting count reaches
    /// zero. On full release the owner's inherited boost from this mutex
    /// is rolled back and the highest-priority waiter, if any, becomes the
    /// new owner directly.
    pub fn post(&mut self) -> OsResult<()> {
        if is_isr_context() {
            return Err(OsError::Perm);
        }

        if !state::KERNEL.is_running() {
            return Err(OsError::Perm);
        }

        if self.obj_type != OsObjType::Mutex {
            return Err(OsError::Invalid);
        }

        critical_section(|_cs| {
            let cur_tcb_ptr = unsafe { state::tcb_cur_ptr() }.ok_or(OsError::Perm)?;

            if self.owner != Some(cur_tcb_ptr) {
                return Err(OsError::Perm);
            }

            if self.nesting_ctr > 1 {
                self.nesting_ctr -= 1;
                return Ok(());
            }

            if self.protocol != OsMutexProtocol::None {
                unsafe {
                    self.owned_list_remove(cur_tcb_ptr);
                    os_prio_propagate(cur_tcb_ptr);
                }
            }

            if let Some(waiter) = self.pend_list.pop_head() {
                self.owner = Some(waiter);
                self.nesting_ctr = 1;

                unsafe {
                    sched::os_pend_wake(waiter, OsPendStatus::Ok);

                    if self.protocol != OsMutexProtocol::None {
                        self.owned_list_insert(waiter);
                        os_prio_propagate(waiter);
                    }
                }

                sched::os_sched();
            } else {
                self.owner = None;
                self.nesting_ctr = 0;
            }

            Ok(())
        })
    }

    /// Roll back a waiter that gave up: timeout or pend-abort
    ///
    /// Removes the waiter and recomputes the owner's inherited priority;
    /// losing the highest waiter can deflate a boost that had propagated
    /// through the whole chain.
    pub(crate) unsafe fn cancel_wait(&mut self, tcb: NonNull<OsTcb>) {
        self.pend_list.remove(tcb);

        if self.protocol == OsMutexProtocol::PriorityInheritance {
            if let Some(owner) = self.owner {
                unsafe { os_prio_propagate(owner) };
            }
        }
    }

    /// Check if mutex is owned
    #[inline]
    pub fn is_owned(&self) -> bool {
        self.owner.is_some()
    }
}

impl Default for OsMutex {
    fn default() -> Self {
        Self::new(OsMutexType::Normal, OsMutexProtocol::PriorityInheritance)
    }
}

unsafe impl Send for OsMutex {}
unsafe impl Sync for OsMutex {}

/// Recompute a task's effective priority and propagate along its chain
///
/// Effective priority is the maximum of the base priority and the
/// contribution of every owned protocol mutex. When the value changes:
/// a ready task moves between ready lists and the walk ends; a blocked
/// task is re-sorted in its wait list, and if that list belongs to an
/// inheritance mutex the walk continues at that mutex's owner. The walk
/// also ends as soon as a task's priority settles, which bounds it by the
/// chain depth and keeps it finite even on a deadlocked cycle.
pub(crate) unsafe fn os_prio_propagate(start: NonNull<OsTcb>) {
    let mut tcb = start;

    loop {
        let t = unsafe { &mut *tcb.as_ptr() };

        let mut new_prio = t.base_prio;
        let mut node = t.owned_head;
        while let Some(mutex) = node {
            let m = unsafe { mutex.as_ref() };
            if let Some(p) = m.prio_contribution() {
                if p > new_prio {
                    new_prio = p;
                }
            }
            node = m.owned_next;
        }

        if new_prio == t.prio {
            break;
        }

        if t.is_ready() {
            unsafe { sched::os_rdy_list_change_prio(tcb, new_prio) };
            break;
        }

        t.prio = new_prio;

        if t.is_pending() {
            unsafe { sched::os_pend_reinsert(tcb) };

            if t.pend_on == OsPendOn::Mutex {
                let m = unsafe { &*(t.pend_obj_ptr as *const OsMutex) };
                if m.protocol == OsMutexProtocol::PriorityInheritance {
                    if let Some(owner) = m.owner {
                        tcb = owner;
                        continue;
                    }
                }
            }
        }

        break;
    }
}

// ============ Safe Wrapper ============

use core::cell::UnsafeCell;

/// Shareable mutex handle for static allocation
pub struct Mutex {
    inner: UnsafeCell<OsMutex>,
}

unsafe impl Sync for Mutex {}
unsafe impl Send for Mutex {}

impl Mutex {
    pub const fn new(mtx_type: OsMutexType, protocol: OsMutexProtocol) -> Self {
        Mutex {
            inner: UnsafeCell::new(OsMutex::new(mtx_type, protocol)),
        }
    }

    pub const fn with_ceiling(mtx_type: OsMutexType, ceiling: OsPrio) -> Self {
        Mutex {
            inner: UnsafeCell::new(OsMutex::with_ceiling(mtx_type, ceiling)),
        }
    }

    pub fn create(&self, name: &'static str) -> OsResult<()> {
        unsafe { (*self.inner.get()).create(name) }
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) -> OsResult<()> {
        unsafe { (*self.inner.get()).pend(None, false) }
    }

    /// Acquire without blocking; `Busy` when held by another task
    pub fn try_lock(&self) -> OsResult<()> {
        unsafe { (*self.inner.get()).pend(None, true) }
    }

    /// Wait at most `ticks` ticks for the mutex
    pub fn try_lock_for(&self, ticks: OsTick) -> OsResult<()> {
        let deadline = state::KERNEL.tick_get().wrapping_add(ticks);
        unsafe { (*self.inner.get()).pend(Some(deadline), false) }
    }

    /// Wait until the absolute tick `deadline` for the mutex
    pub fn try_lock_until(&self, deadline: OsTick) -> OsResult<()> {
        unsafe { (*self.inner.get()).pend(Some(deadline), false) }
    }

    /// Release the mutex
    pub fn unlock(&self) -> OsResult<()> {
        unsafe { (*self.inner.get()).post() }
    }

    #[inline]
    pub fn is_owned(&self) -> bool {
        unsafe { (*self.inner.get()).is_owned() }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec;
    use std::vec::Vec;

    use crate::kernel::test_support::{kernel_fixture, KernelFixture};
    use crate::task::os_task_change_prio;
    use crate::types::{OsPendStatus, OsTaskState};

    use super::*;

    fn prio_of(tcb: NonNull<OsTcb>) -> u8 {
        unsafe { tcb.as_ref() }.prio
    }

    fn base_of(tcb: NonNull<OsTcb>) -> u8 {
        unsafe { tcb.as_ref() }.base_prio
    }

    fn pi_mutexes<const N: usize>(mtx_type: OsMutexType) -> [OsMutex; N] {
        let mut mutexes: [OsMutex; N] =
            core::array::from_fn(|_| OsMutex::new(mtx_type, OsMutexProtocol::PriorityInheritance));
        for m in mutexes.iter_mut() {
            m.create("m").unwrap();
        }
        mutexes
    }

    /// Run one task's lock sequence until it acquires everything or blocks
    fn run_locks(
        fix: &KernelFixture,
        tcb: NonNull<OsTcb>,
        mutexes: &mut [OsMutex],
        locks: &[usize],
    ) {
        fix.set_current(tcb);
        for &mi in locks {
            let _ = mutexes[mi].pend(None, false);
            if unsafe { tcb.as_ref() }.is_pending() {
                break;
            }
        }
    }

    /// Unlock every mutex a task holds, cascading into tasks that acquire
    /// a mutex through the hand-off
    fn run_unlocks(
        fix: &KernelFixture,
        tcbs: &[NonNull<OsTcb>],
        mutexes: &mut [OsMutex],
        locks: &[&[usize]],
        start: usize,
    ) {
        let mut pending = vec![start];
        while let Some(i) = pending.pop() {
            fix.set_current(tcbs[i]);
            for &mi in locks[i] {
                let woken = mutexes[mi].pend_list.head();
                mutexes[mi].post().unwrap();
                if let Some(w) = woken {
                    let idx = tcbs.iter().position(|t| *t == w).unwrap();
                    pending.push(idx);
                }
            }
        }
    }

    #[test]
    fn binary_priority_inversion() {
        let fix = kernel_fixture();
        let low = fix.spawn("low", 1);
        let med = fix.spawn("med", 2);
        let high = fix.spawn("high", 3);

        let mut mutex = OsMutex::new(OsMutexType::Normal, OsMutexProtocol::PriorityInheritance);
        mutex.create("m").unwrap();

        fix.set_current(low);
        assert_eq!(mutex.pend(None, false), Ok(()));

        fix.set_current(high);
        let _ = mutex.pend(None, false);
        assert_eq!(unsafe { high.as_ref() }.task_state, OsTaskState::Pend);

        // while high is blocked, low runs at high's priority and the
        // medium task cannot get ahead of it
        assert_eq!(prio_of(low), 3);
        let top = unsafe { state::prio_table() }.get_highest();
        assert_eq!(top, 3);
        assert_eq!(unsafe { state::rdy_list(top) }.head(), Some(low));
        assert_eq!(prio_of(med), 2);

        fix.set_current(low);
        assert_eq!(mutex.post(), Ok(()));

        assert_eq!(prio_of(low), 1);
        assert_eq!(unsafe { high.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { high.as_ref() }.pend_status, OsPendStatus::Ok);
        assert!(mutex.is_owned());

        fix.set_current(high);
        assert_eq!(mutex.post(), Ok(()));
        assert!(!mutex.is_owned());
    }

    #[test]
    fn unlock_hands_off_to_highest_waiter() {
        let fix = kernel_fixture();
        let low = fix.spawn("low", 1);
        let w1 = fix.spawn("w1", 7);
        let w2 = fix.spawn("w2", 9);

        let mut mutex = OsMutex::new(OsMutexType::Normal, OsMutexProtocol::PriorityInheritance);
        mutex.create("m").unwrap();

        fix.set_current(low);
        mutex.pend(None, false).unwrap();

        fix.set_current(w1);
        let _ = mutex.pend(None, false);
        assert_eq!(prio_of(low), 7);

        fix.set_current(w2);
        let _ = mutex.pend(None, false);
        assert_eq!(prio_of(low), 9);

        fix.set_current(low);
        mutex.post().unwrap();

        // w2 takes the permit and keeps inheriting from w1, still queued
        assert_eq!(prio_of(low), 1);
        assert_eq!(unsafe { w2.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { w1.as_ref() }.task_state, OsTaskState::Pend);
        assert_eq!(prio_of(w2), 9);

        fix.set_current(w2);
        mutex.post().unwrap();
        assert_eq!(unsafe { w1.as_ref() }.task_state, OsTaskState::Ready);

        fix.set_current(w1);
        mutex.post().unwrap();
        assert!(!mutex.is_owned());
    }

    // The tree of testBasicPriorityInheritance: ten tasks connected to the
    // main task through ten inheritance mutexes.
    //
    //   T111 -> M111 -> T11 -> M11 -> T1 -> M1 -> main
    //   T110 -> M110 -> T11
    //   T101 -> M101 -> T10 -> M10 -> T1
    //   T100 -> M100 -> T10
    //   T01  -> M01  -> T0 -> M0 -> main
    //   T00  -> M00  -> T0
    //
    // Mutex indices: m0=0 m1=1 m00=2 m01=3 m10=4 m11=5 m100=6 m101=7
    // m110=8 m111=9.
    const TREE_LOCKS: [&[usize]; 10] = [
        &[2, 3, 0], // T0
        &[4, 5, 1], // T1
        &[2],       // T00
        &[3],       // T01
        &[6, 7, 4], // T10
        &[8, 9, 5], // T11
        &[6],       // T100
        &[7],       // T101
        &[8],       // T110
        &[9],       // T111
    ];

    const TREE_PRIOS: [u8; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

    // Expected effective priority (relative to the main task's) of every
    // task after each task starts.
    const TREE_BOOSTS: [[u8; 10]; 10] = [
        [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        [3, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        [4, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        [4, 5, 3, 4, 5, 6, 7, 8, 9, 10],
        [4, 6, 3, 4, 5, 6, 7, 8, 9, 10],
        [4, 7, 3, 4, 7, 6, 7, 8, 9, 10],
        [4, 8, 3, 4, 8, 6, 7, 8, 9, 10],
        [4, 9, 3, 4, 8, 9, 7, 8, 9, 10],
        [4, 10, 3, 4, 8, 10, 7, 8, 9, 10],
    ];

    fn tree_inheritance_for_type(mtx_type: OsMutexType) {
        const BASE: u8 = 20;

        let fix = kernel_fixture();
        let main = fix.spawn("main", BASE);
        let tcbs: Vec<NonNull<OsTcb>> = TREE_PRIOS
            .iter()
            .map(|&p| fix.spawn("t", BASE + p))
            .collect();

        let mut mutexes = pi_mutexes::<10>(mtx_type);

        fix.set_current(main);
        mutexes[0].pend(None, false).unwrap();
        mutexes[1].pend(None, false).unwrap();

        for i in 0..10 {
            run_locks(&fix, tcbs[i], &mut mutexes, TREE_LOCKS[i]);

            fix.set_current(main);
            for j in 0..10 {
                assert_eq!(
                    prio_of(tcbs[j]),
                    BASE + TREE_BOOSTS[i][j],
                    "task {} after starting task {}",
                    j,
                    i
                );
            }
            assert_eq!(prio_of(main), prio_of(tcbs[i]));
        }

        // releasing m1 collapses the T1 subtree; main keeps the boost
        // inherited through m0
        fix.set_current(main);
        let woken = mutexes[1].pend_list.head().unwrap();
        assert_eq!(woken, tcbs[1]);
        mutexes[1].post().unwrap();
        run_unlocks(&fix, &tcbs, &mut mutexes, &TREE_LOCKS, 1);

        fix.set_current(main);
        assert_eq!(prio_of(main), prio_of(tcbs[0]));
        assert_eq!(prio_of(main), BASE + 4);

        let woken = mutexes[0].pend_list.head().unwrap();
        assert_eq!(woken, tcbs[0]);
        mutexes[0].post().unwrap();
        run_unlocks(&fix, &tcbs, &mut mutexes, &TREE_LOCKS, 0);

        fix.set_current(main);
        assert_eq!(prio_of(main), BASE);
        for (j, &tcb) in tcbs.iter().enumerate() {
            assert_eq!(prio_of(tcb), BASE + TREE_PRIOS[j]);
            assert!(!unsafe { tcb.as_ref() }.is_pending());
        }
        for m in mutexes.iter() {
            assert!(!m.is_owned());
            assert!(m.pend_list.is_empty());
        }
    }

    #[test]
    fn tree_inheritance_normal() {
        tree_inheritance_for_type(OsMutexType::Normal);
    }

    #[test]
    fn tree_inheritance_error_checking() {
        tree_inheritance_for_type(OsMutexType::ErrorChecking);
    }

    #[test]
    fn tree_inheritance_recursive() {
        tree_inheritance_for_type(OsMutexType::Recursive);
    }

    // The vertical chain of testCanceledLock and testPriorityChange:
    // task i holds m(i+1) and waits on m(i); the main task holds m0.
    const CHAIN_LOCKS: [&[usize]; 10] = [
        &[1, 0],
        &[2, 1],
        &[3, 2],
        &[4, 3],
        &[5, 4],
        &[6, 5],
        &[7, 6],
        &[8, 7],
        &[9, 8],
        &[9],
    ];

    fn chain_timeouts_for_type(mtx_type: OsMutexType) {
        const BASE: u8 = 20;
        const DURATION_UNIT: OsTick = 10;

        let fix = kernel_fixture();
        let main = fix.spawn("main", BASE);
        let tcbs: Vec<NonNull<OsTcb>> =
            (1..=10u8).map(|p| fix.spawn("t", BASE + p)).collect();

        let mut mutexes = pi_mutexes::<10>(mtx_type);

        fix.set_current(main);
        mutexes[0].pend(None, false).unwrap();

        // task i takes m(i+1) outright, then waits on m(i) with a
        // deadline; deadlines shrink up the chain so the highest-priority
        // task expires first
        for i in 0..10 {
            fix.set_current(tcbs[i]);
            if i < 9 {
                mutexes[i + 1].pend(None, false).unwrap();
            }
            let deadline = state::KERNEL.tick_get() + DURATION_UNIT * (10 - i as OsTick);
            let _ = mutexes[i].pend(Some(deadline), false);
            assert_eq!(
                unsafe { tcbs[i].as_ref() }.task_state,
                OsTaskState::PendTimeout
            );

            fix.set_current(main);
            assert_eq!(prio_of(main), prio_of(tcbs[i]));
        }

        assert_eq!(prio_of(main), BASE + 10);

        // each expiry pops the top of the chain and deflates every boost
        // below it by one
        for step in 1..=10u8 {
            fix.tick(DURATION_UNIT);

            let i = 10 - step as usize;
            assert_eq!(
                unsafe { tcbs[i].as_ref() }.pend_status,
                OsPendStatus::Timeout
            );
            assert_eq!(unsafe { tcbs[i].as_ref() }.task_state, OsTaskState::Ready);
            assert_eq!(prio_of(main), BASE + 10 - step);

            // the expired task releases the mutex it still holds
            fix.set_current(tcbs[i]);
            if i < 9 {
                mutexes[i + 1].post().unwrap();
            }
        }

        fix.set_current(main);
        assert_eq!(prio_of(main), BASE);
        mutexes[0].post().unwrap();
        assert!(!mutexes[0].is_owned());
        for m in mutexes.iter() {
            assert!(m.pend_list.is_empty());
        }
    }

    #[test]
    fn chain_timeouts_normal() {
        chain_timeouts_for_type(OsMutexType::Normal);
    }

    #[test]
    fn chain_timeouts_error_checking() {
        chain_timeouts_for_type(OsMutexType::ErrorChecking);
    }

    #[test]
    fn chain_timeouts_recursive() {
        chain_timeouts_for_type(OsMutexType::Recursive);
    }

    fn chain_priority_change_for_type(mtx_type: OsMutexType) {
        const BASE: u8 = 20;

        // task index, new priority
        let priority_changes: Vec<(usize, u8)> = {
            let mut changes = Vec::new();
            // drop everything to the main task's priority, top down
            for i in (0..10).rev() {
                changes.push((i, BASE));
            }
            // restore, bottom up
            for i in 0..10 {
                changes.push((i, BASE + 1 + i as u8));
            }
            // spike each task to the maximum, then restore it
            for i in 0..10 {
                changes.push((i, u8::MAX));
                changes.push((i, BASE + 1 + i as u8));
            }
            changes
        };

        let fix = kernel_fixture();
        let main = fix.spawn("main", BASE);
        let tcbs: Vec<NonNull<OsTcb>> =
            (1..=10u8).map(|p| fix.spawn("t", BASE + p)).collect();

        let mut mutexes = pi_mutexes::<10>(mtx_type);

        fix.set_current(main);
        mutexes[0].pend(None, false).unwrap();

        for i in 0..10 {
            run_locks(&fix, tcbs[i], &mut mutexes, CHAIN_LOCKS[i]);
            fix.set_current(main);
            assert_eq!(prio_of(main), prio_of(tcbs[i]));
        }

        for &(idx, new_prio) in priority_changes.iter() {
            os_task_change_prio(tcbs[idx], new_prio).unwrap();

            // every task's effective priority must equal the maximum of
            // its own priority and the one inherited from the task
            // blocked on the mutex it owns, computed down the chain
            let mut inherited: u8 = 0;
            for j in (0..10).rev() {
                let expected = inherited.max(base_of(tcbs[j]));
                assert_eq!(
                    prio_of(tcbs[j]),
                    expected,
                    "task {} after setting task {} to {}",
                    j,
                    idx,
                    new_prio
                );
                inherited = prio_of(tcbs[j]);
            }
            let expected = inherited.max(base_of(main));
            assert_eq!(prio_of(main), expected);
        }

        fix.set_current(main);
        let woken = mutexes[0].pend_list.head().unwrap();
        assert_eq!(woken, tcbs[0]);
        mutexes[0].post().unwrap();
        run_unlocks(&fix, &tcbs, &mut mutexes, &CHAIN_LOCKS, 0);

        fix.set_current(main);
        assert_eq!(prio_of(main), BASE);
        for (j, &tcb) in tcbs.iter().enumerate() {
            assert_eq!(prio_of(tcb), BASE + 1 + j as u8);
        }
        for m in mutexes.iter() {
            assert!(!m.is_owned());
            assert!(m.pend_list.is_empty());
        }
    }

    #[test]
    fn chain_priority_change_normal() {
        chain_priority_change_for_type(OsMutexType::Normal);
    }

    #[test]
    fn chain_priority_change_error_checking() {
        chain_priority_change_for_type(OsMutexType::ErrorChecking);
    }

    #[test]
    fn chain_priority_change_recursive() {
        chain_priority_change_for_type(OsMutexType::Recursive);
    }

    #[test]
    fn recursive_lock_unlock_pairs() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        let mut mutex =
            OsMutex::new(OsMutexType::Recursive, OsMutexProtocol::PriorityInheritance);
        mutex.create("m").unwrap();

        for _ in 0..4 {
            assert_eq!(mutex.pend(None, false), Ok(()));
        }
        for _ in 0..3 {
            assert_eq!(mutex.post(), Ok(()));
            assert!(mutex.is_owned());
        }
        assert_eq!(mutex.post(), Ok(()));
        assert!(!mutex.is_owned());

        // one unlock too many: no longer the owner
        assert_eq!(mutex.post(), Err(OsError::Perm));
    }

    #[test]
    fn error_checking_self_lock_and_foreign_unlock() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        let t2 = fix.spawn("t2", 6);

        let mut mutex = OsMutex::new(
            OsMutexType::ErrorChecking,
            OsMutexProtocol::PriorityInheritance,
        );
        mutex.create("m").unwrap();

        fix.set_current(t1);
        assert_eq!(mutex.pend(None, false), Ok(()));
        assert_eq!(mutex.pend(None, false), Err(OsError::Deadlock));

        fix.set_current(t2);
        assert_eq!(mutex.post(), Err(OsError::Perm));
        assert_eq!(mutex.pend(None, true), Err(OsError::Busy));

        fix.set_current(t1);
        assert_eq!(mutex.post(), Ok(()));
    }

    #[test]
    fn normal_self_lock_is_deadlock() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        let mut mutex = OsMutex::new(OsMutexType::Normal, OsMutexProtocol::None);
        mutex.create("m").unwrap();

        assert_eq!(mutex.pend(None, false), Ok(()));
        assert_eq!(mutex.pend(None, false), Err(OsError::Deadlock));
        assert_eq!(mutex.post(), Ok(()));
    }

    #[test]
    fn priority_protect_ceiling() {
        let fix = kernel_fixture();
        let low = fix.spawn("low", 5);
        let high = fix.spawn("high", 15);

        let mut mutex = OsMutex::with_ceiling(OsMutexType::Normal, 12);
        mutex.create("m").unwrap();

        fix.set_current(low);
        assert_eq!(mutex.pend(None, false), Ok(()));
        // the owner runs at the ceiling for the whole critical section
        assert_eq!(prio_of(low), 12);

        // a task above the ceiling must not use this mutex
        fix.set_current(high);
        assert_eq!(mutex.pend(None, false), Err(OsError::Invalid));

        fix.set_current(low);
        assert_eq!(mutex.post(), Ok(()));
        assert_eq!(prio_of(low), 5);
    }

    #[test]
    fn lock_unlock_restores_effective_priority() {
        let fix = kernel_fixture();
        let t1 = fix.spawn("t1", 5);
        fix.set_current(t1);

        let mut a = OsMutex::with_ceiling(OsMutexType::Normal, 12);
        let mut b = OsMutex::with_ceiling(OsMutexType::Normal, 8);
        a.create("a").unwrap();
        b.create("b").unwrap();

        a.pend(None, false).unwrap();
        b.pend(None, false).unwrap();
        assert_eq!(prio_of(t1), 12);

        // still held ceilings keep contributing after one unlock
        a.post().unwrap();
        assert_eq!(prio_of(t1), 8);
        b.post().unwrap();
        assert_eq!(prio_of(t1), 5);
    }

    #[test]
    fn canceled_wait_rolls_back_boost() {
        let fix = kernel_fixture();
        let low = fix.spawn("low", 2);
        let high = fix.spawn("high", 9);

        let mut mutex = OsMutex::new(OsMutexType::Normal, OsMutexProtocol::PriorityInheritance);
        mutex.create("m").unwrap();

        fix.set_current(low);
        mutex.pend(None, false).unwrap();

        fix.set_current(high);
        let _ = mutex.pend(None, false);
        assert_eq!(prio_of(low), 9);

        crate::task::os_task_pend_abort(high).unwrap();

        assert_eq!(unsafe { high.as_ref() }.task_state, OsTaskState::Ready);
        assert_eq!(unsafe { high.as_ref() }.pend_status, OsPendStatus::Canceled);
        assert_eq!(prio_of(low), 2);
        assert!(mutex.pend_list.is_empty());
        assert!(mutex.is_owned());
    }
}

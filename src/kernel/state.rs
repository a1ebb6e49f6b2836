//! Global kernel state and initialization
//!
//! This module owns the global kernel flags, the scheduler state (priority
//! table, ready lists, tick wheel) and the CPU context-switch state, plus
//! initialization and startup of multitasking.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::config::{CFG_PRIO_IDLE, CFG_PRIO_LEVELS, CFG_TICK_WHEEL_SIZE};
use crate::critical::{critical_section, CriticalSection, CsCell};
use crate::error::{OsError, OsResult};
use crate::prio::PrioTable;
use crate::sched::ReadyList;
use crate::task::OsTcb;
use crate::types::{OsNestingCtr, OsPrio, OsTick};

// ============ Kernel State Structures ============

/// Atomic kernel flags
pub struct KernelFlags {
    initialized: AtomicBool,
    running: AtomicBool,
    int_nesting: AtomicU8,
    sched_lock_nesting: AtomicU8,
    tick_counter: AtomicU32,
}

impl KernelFlags {
    const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            running: AtomicBool::new(false),
            int_nesting: AtomicU8::new(0),
            sched_lock_nesting: AtomicU8::new(0),
            tick_counter: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.int_nesting.store(0, Ordering::SeqCst);
        self.sched_lock_nesting.store(0, Ordering::SeqCst);
        self.tick_counter.store(0, Ordering::SeqCst);
    }

    /// Check if the kernel is running
    #[inline(always)]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Check if the kernel is initialized
    #[inline(always)]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Get current tick count
    #[inline(always)]
    pub fn tick_get(&self) -> OsTick {
        self.tick_counter.load(Ordering::Relaxed)
    }

    /// Get interrupt nesting level
    #[inline(always)]
    pub fn int_nesting(&self) -> OsNestingCtr {
        self.int_nesting.load(Ordering::Relaxed)
    }

    /// Get scheduler lock nesting level
    #[inline(always)]
    pub fn sched_lock_nesting(&self) -> OsNestingCtr {
        self.sched_lock_nesting.load(Ordering::SeqCst)
    }

    /// Increment and return tick count
    #[inline(always)]
    pub(crate) fn tick_increment(&self) -> OsTick {
        self.tick_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Enter ISR
    #[inline(always)]
    pub(crate) fn int_enter(&self) {
        if self.is_running() {
            let nesting = self.int_nesting.fetch_add(1, Ordering::Relaxed);
            if nesting == u8::MAX - 1 {
                self.int_nesting.store(u8::MAX - 1, Ordering::Relaxed);
            }
        }
    }

    /// Set initialized flag
    #[inline(always)]
    pub(crate) fn set_initialized(&self, val: bool) {
        self.initialized.store(val, Ordering::SeqCst);
    }

    /// Set running flag
    #[inline(always)]
    pub(crate) fn set_running(&self, val: bool) {
        self.running.store(val, Ordering::SeqCst);
    }

    /// Decrement interrupt nesting
    #[inline(always)]
    pub(crate) fn int_nesting_dec(&self) -> OsNestingCtr {
        let nesting = self.int_nesting.load(Ordering::Relaxed);
        if nesting > 0 {
            self.int_nesting.store(nesting - 1, Ordering::Relaxed);
        }
        nesting.saturating_sub(1)
    }

    /// Lock the scheduler
    pub(crate) fn try_sched_lock(&self) -> OsResult<()> {
        let nesting = self.sched_lock_nesting.load(Ordering::SeqCst);
        if nesting == u8::MAX {
            return Err(OsError::Overflow);
        }
        self.sched_lock_nesting.store(nesting + 1, Ordering::SeqCst);
        Ok(())
    }

    /// Unlock the scheduler
    pub(crate) fn try_sched_unlock(&self) -> OsResult<OsNestingCtr> {
        let nesting = self.sched_lock_nesting.load(Ordering::SeqCst);
        if nesting == 0 {
            return Err(OsError::Perm);
        }
        self.sched_lock_nesting.store(nesting - 1, Ordering::SeqCst);
        Ok(nesting - 1)
    }
}

// ============ Global Instances ============

/// Global kernel flags instance
pub(crate) static KERNEL: KernelFlags = KernelFlags::new();

/// Scheduler state
pub struct SchedState {
    pub(crate) prio_tbl: PrioTable,
    pub(crate) rdy_list: [ReadyList; CFG_PRIO_LEVELS],
    pub(crate) tick_wheel: [Option<NonNull<OsTcb>>; CFG_TICK_WHEEL_SIZE],
}

impl SchedState {
    const fn new() -> Self {
        Self {
            prio_tbl: PrioTable::new(),
            rdy_list: [const { ReadyList::new() }; CFG_PRIO_LEVELS],
            tick_wheel: [None; CFG_TICK_WHEEL_SIZE],
        }
    }

    pub(crate) fn reset(&mut self) {
        self.prio_tbl = PrioTable::new();
        self.rdy_list = [const { ReadyList::new() }; CFG_PRIO_LEVELS];
        self.tick_wheel = [None; CFG_TICK_WHEEL_SIZE];
    }

    /// Slot for a given expiry tick
    #[inline(always)]
    fn tick_wheel_slot(expiry: OsTick) -> usize {
        (expiry as usize) % CFG_TICK_WHEEL_SIZE
    }

    /// Head of tick wheel slot
    #[inline(always)]
    pub fn tick_wheel_head(&self, slot: usize) -> Option<NonNull<OsTcb>> {
        self.tick_wheel[slot]
    }

    /// Link a task into the wheel slot of its expiry tick
    pub unsafe fn tick_wheel_insert(&mut self, tcb: NonNull<OsTcb>, expiry: OsTick) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };
        let slot = Self::tick_wheel_slot(expiry);

        tcb_ref.tick_expiry = expiry;
        tcb_ref.tick_wheel_slot = slot as u8;
        tcb_ref.in_tick_wheel = true;

        tcb_ref.tick_next_ptr = self.tick_wheel[slot];
        tcb_ref.tick_prev_ptr = None;

        if let Some(mut old_head) = self.tick_wheel[slot] {
            unsafe { old_head.as_mut().tick_prev_ptr = Some(tcb) };
        }

        self.tick_wheel[slot] = Some(tcb);
    }

    /// Unlink a task from the tick wheel
    pub unsafe fn tick_wheel_remove(&mut self, tcb: NonNull<OsTcb>) {
        let tcb_ref = unsafe { &mut *tcb.as_ptr() };
        let slot = tcb_ref.tick_wheel_slot as usize;

        if let Some(mut prev) = tcb_ref.tick_prev_ptr {
            unsafe { prev.as_mut().tick_next_ptr = tcb_ref.tick_next_ptr };
        } else {
            self.tick_wheel[slot] = tcb_ref.tick_next_ptr;
        }

        if let Some(mut next) = tcb_ref.tick_next_ptr {
            unsafe { next.as_mut().tick_prev_ptr = tcb_ref.tick_prev_ptr };
        }

        tcb_ref.tick_next_ptr = None;
        tcb_ref.tick_prev_ptr = None;
        tcb_ref.in_tick_wheel = false;
    }
}

/// Global scheduler state instance
pub(crate) static SCHED: CsCell<SchedState> = CsCell::new(SchedState::new());

/// Idle task TCB
static mut IDLE_TCB: OsTcb = OsTcb::new();

/// Idle task stack size in words
const IDLE_STK_SIZE: usize = 128;

/// Idle task stack
static mut IDLE_STK: [crate::types::OsStkElement; IDLE_STK_SIZE] = [0; IDLE_STK_SIZE];

// ============ CPU/Context Switch State ============

/// CPU context switch state, shared with the port's PendSV handler
#[repr(C)]
pub struct CpuState {
    /// Current running task's TCB pointer
    pub tcb_cur: *mut OsTcb,
    /// Highest priority ready task's TCB pointer
    pub tcb_high_rdy: *mut OsTcb,
    /// Current running task's priority
    pub prio_cur: OsPrio,
    /// Highest ready priority
    pub prio_high_rdy: OsPrio,
}

impl CpuState {
    pub const fn new() -> Self {
        Self {
            tcb_cur: core::ptr::null_mut(),
            tcb_high_rdy: core::ptr::null_mut(),
            prio_cur: 0,
            prio_high_rdy: 0,
        }
    }

    /// Get current TCB pointer
    #[inline(always)]
    pub unsafe fn tcb_cur_ptr(&self) -> Option<NonNull<OsTcb>> {
        NonNull::new(self.tcb_cur)
    }

    /// Set current TCB pointer
    #[inline(always)]
    pub unsafe fn set_tcb_cur(&mut self, tcb: Option<NonNull<OsTcb>>) {
        self.tcb_cur = tcb.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    }

    /// Get high ready TCB pointer
    #[inline(always)]
    pub unsafe fn tcb_high_rdy_ptr(&self) -> Option<NonNull<OsTcb>> {
        NonNull::new(self.tcb_high_rdy)
    }

    /// Set high ready TCB pointer
    #[inline(always)]
    pub unsafe fn set_tcb_high_rdy(&mut self, tcb: Option<NonNull<OsTcb>>) {
        self.tcb_high_rdy = tcb.map_or(core::ptr::null_mut(), |p| p.as_ptr());
    }
}

/// Global CPU state instance
#[no_mangle]
#[used]
pub static mut CPU_STATE: CpuState = CpuState::new();

// ============ Initialization ============

/// Idle task body; must never block
fn os_idle_task(_: *mut ()) {
    loop {
        #[cfg(target_arch = "arm")]
        cortex_m::asm::nop();
        #[cfg(not(target_arch = "arm"))]
        core::hint::spin_loop();
    }
}

/// Reset global kernel state
pub(crate) unsafe fn os_reset_state() {
    KERNEL.reset();

    unsafe {
        CPU_STATE.tcb_cur = core::ptr::null_mut();
        CPU_STATE.tcb_high_rdy = core::ptr::null_mut();
        CPU_STATE.prio_cur = 0;
        CPU_STATE.prio_high_rdy = 0;

        SCHED.get_unchecked().reset();
    }
}

// ============ Public API ============

/// Initialize the kernel
///
/// This must be called before any other kernel function. It resets the
/// priority table, ready lists and tick wheel, and creates the idle task
/// at the reserved priority 0.
///
/// # Returns
/// * `Ok(())` - Initialization successful
/// * `Err(OsError::Perm)` - Kernel is already running
pub fn os_init() -> OsResult<()> {
    unsafe {
        os_reset_state();
    }

    if KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    critical_section(|cs| {
        let sched = SCHED.get(cs);

        sched.prio_tbl.init();

        for list in sched.rdy_list.iter_mut() {
            list.init();
        }

        unsafe {
            crate::task::os_task_create_raw(
                &raw mut IDLE_TCB,
                "Idle",
                os_idle_task,
                core::ptr::null_mut(),
                CFG_PRIO_IDLE,
                (&raw mut IDLE_STK) as *mut crate::types::OsStkElement,
                IDLE_STK_SIZE,
                0,
            )
            .expect("idle task creation failed");
        }

        KERNEL.set_initialized(true);
    });

    Ok(())
}

/// Start multitasking
///
/// Dispatches the highest priority ready task; does not return under
/// normal operation. At least one application task must exist.
///
/// # Returns
/// * `Err(OsError::Invalid)` - Kernel not initialized
/// * `Err(OsError::Perm)` - Kernel is already running
pub fn os_start() -> OsResult<()> {
    if !KERNEL.is_initialized() {
        return Err(OsError::Invalid);
    }

    if KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    critical_section(|cs| {
        let sched = SCHED.get(cs);

        let high_prio = sched.prio_tbl.get_highest();

        unsafe {
            CPU_STATE.prio_high_rdy = high_prio;
            CPU_STATE.prio_cur = high_prio;

            if let Some(head) = sched.rdy_list[high_prio as usize].head() {
                CPU_STATE.tcb_high_rdy = head.as_ptr();
                CPU_STATE.tcb_cur = head.as_ptr();
            } else {
                return;
            }
        }

        KERNEL.set_running(true);
    });

    crate::port::os_cpu_systick_init(16_000_000 / crate::config::CFG_TICK_RATE_HZ);

    unsafe {
        CPU_STATE.tcb_cur = CPU_STATE.tcb_high_rdy;
        crate::port::os_start_high_rdy();
    }

    Ok(())
}

/// Exit ISR; performs a deferred context switch if the ISR readied a
/// higher-priority task
#[allow(static_mut_refs)]
pub fn os_int_exit() {
    if !KERNEL.is_running() {
        return;
    }

    let _cs = CriticalSection::enter();

    let old_nesting = KERNEL.int_nesting();
    if old_nesting == 0 {
        return;
    }

    let new_nesting = KERNEL.int_nesting_dec();

    if new_nesting == 0 && KERNEL.sched_lock_nesting() == 0 {
        unsafe {
            let high_prio = SCHED.get_unchecked().prio_tbl.get_highest();
            let cur_prio = CPU_STATE
                .tcb_cur_ptr()
                .map_or(CFG_PRIO_IDLE, |t| t.as_ref().prio);

            if high_prio > cur_prio {
                CPU_STATE.prio_high_rdy = high_prio;

                if let Some(head) = SCHED.get_unchecked().rdy_list[high_prio as usize].head() {
                    CPU_STATE.tcb_high_rdy = head.as_ptr();
                    crate::port::os_int_ctx_sw();
                }
            }
        }
    }
}

/// Lock the scheduler: the current task keeps the CPU across readiness
/// changes until the matching unlock
pub fn os_sched_lock() -> OsResult<()> {
    if !KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    if KERNEL.int_nesting() > 0 {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| KERNEL.try_sched_lock())
}

/// Unlock the scheduler; reschedules when the last nesting level is released
pub fn os_sched_unlock() -> OsResult<()> {
    if !KERNEL.is_running() {
        return Err(OsError::Perm);
    }

    if KERNEL.int_nesting() > 0 {
        return Err(OsError::Perm);
    }

    critical_section(|_cs| {
        let remaining = KERNEL.try_sched_unlock()?;
        if remaining == 0 {
            crate::sched::os_sched();
        }
        Ok(())
    })
}

// ============ Internal accessors for other modules ============

/// Get mutable reference to priority table
#[inline(always)]
pub(crate) unsafe fn prio_table() -> &'static mut PrioTable {
    unsafe { &mut SCHED.get_unchecked().prio_tbl }
}

/// Get reference to ready list for a priority
#[inline(always)]
pub(crate) unsafe fn rdy_list(prio: OsPrio) -> &'static mut ReadyList {
    unsafe { &mut SCHED.get_unchecked().rdy_list[prio as usize] }
}

/// Get current TCB pointer as Option<NonNull>
#[inline]
#[allow(static_mut_refs)]
pub(crate) unsafe fn tcb_cur_ptr() -> Option<NonNull<OsTcb>> {
    unsafe { CPU_STATE.tcb_cur_ptr() }
}

/// Set current TCB pointer
#[inline]
#[allow(dead_code, static_mut_refs)]
pub(crate) unsafe fn set_tcb_cur_ptr(tcb: Option<NonNull<OsTcb>>) {
    unsafe { CPU_STATE.set_tcb_cur(tcb) }
}

/// Set high ready TCB pointer
#[inline]
#[allow(static_mut_refs)]
pub(crate) unsafe fn set_tcb_high_rdy_ptr(tcb: Option<NonNull<OsTcb>>) {
    unsafe { CPU_STATE.set_tcb_high_rdy(tcb) }
}

/// Set high ready priority
#[inline]
#[allow(static_mut_refs)]
pub(crate) unsafe fn set_prio_high_rdy(prio: OsPrio) {
    unsafe { CPU_STATE.prio_high_rdy = prio }
}

// ============ Tick Wheel Management ============

/// Link a task into the tick wheel at its expiry tick
pub(crate) unsafe fn tick_wheel_insert(tcb: NonNull<OsTcb>, expiry: OsTick) {
    unsafe {
        SCHED.get_unchecked().tick_wheel_insert(tcb, expiry);
    }
}

/// Unlink a task from the tick wheel
pub(crate) unsafe fn tick_wheel_remove(tcb: NonNull<OsTcb>) {
    unsafe {
        SCHED.get_unchecked().tick_wheel_remove(tcb);
    }
}

/// Head of tick wheel at specified slot
#[inline]
pub(crate) unsafe fn tick_wheel_head(slot: usize) -> Option<NonNull<OsTcb>> {
    unsafe { SCHED.get_unchecked().tick_wheel_head(slot) }
}

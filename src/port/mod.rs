//! Port layer - CPU-specific implementations
//!
//! This module provides the hardware abstraction layer for context
//! switching, the initial stack frame of a task and the SysTick timer.

#[cfg(target_arch = "arm")]
pub mod cortex_m4;

#[cfg(target_arch = "arm")]
pub use cortex_m4::*;

// Stub implementations for non-ARM targets (for host testing)
#[cfg(not(target_arch = "arm"))]
pub mod stub {
    use crate::task::OsTaskFn;
    use crate::types::OsStkElement;

    pub unsafe fn os_start_high_rdy() {
        panic!("os_start_high_rdy not available on this platform");
    }

    pub fn os_ctx_sw() {
        // No-op on the host
    }

    pub fn os_int_ctx_sw() {
        // No-op on the host
    }

    pub unsafe fn os_task_stk_init(
        _task_fn: OsTaskFn,
        _arg: *mut (),
        stk_base: *mut OsStkElement,
        stk_size: usize,
    ) -> *mut OsStkElement {
        // Return top of stack
        unsafe { stk_base.add(stk_size - 1) }
    }

    pub fn os_cpu_systick_init(_reload: u32) {
        // No-op on the host
    }
}

#[cfg(not(target_arch = "arm"))]
pub use stub::*;

//! corten - preemptive RTOS kernel core
//!
//! A real-time kernel for single-core microcontrollers providing:
//! - Priority-based preemptive scheduling with round-robin among equals
//! - Mutexes with priority inheritance and priority protect protocols
//! - Counting semaphores and FIFO queues over one wait-list mechanism
//! - Tick-based sleeps, timed waits and wait cancellation
//! - Context switching for ARM Cortex-M

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(test)]
extern crate std;

// ============ Critical Section ============

#[cfg(target_arch = "arm")]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod kernel;
pub mod port;
pub mod sync;

// ============ Re-exports ============

pub use kernel::config;
pub use kernel::config::*;
pub use kernel::critical;
pub use kernel::error;
pub use kernel::error::{OsError, OsResult};
pub use kernel::prio;
pub use kernel::sched;
pub use kernel::state;
pub use kernel::state::{os_init, os_int_exit, os_sched_lock, os_sched_unlock, os_start};
pub use kernel::task;
pub use kernel::task::{os_task_create, os_task_current, os_task_exit, os_task_join};
pub use kernel::time;
pub use kernel::types;
pub use kernel::types::*;

#[cfg(feature = "sem")]
pub use sync::sem;

#[cfg(feature = "mutex")]
pub use sync::mutex;

#[cfg(feature = "queue")]
pub use sync::queue;

#[cfg(all(feature = "pac", target_arch = "arm"))]
pub use stm32_metapac as pac;

//! Compile-time configuration for the kernel
//!
//! These constants control the behavior and resource limits of the kernel.

use crate::types::{OsPrio, OsTick};

/// Number of priority levels (priorities are 0..=255, higher wins)
pub const CFG_PRIO_LEVELS: usize = 256;

/// Idle task priority; reserved, user tasks must be created above it
pub const CFG_PRIO_IDLE: OsPrio = 0;

/// Highest usable priority
pub const CFG_PRIO_MAX: OsPrio = (CFG_PRIO_LEVELS - 1) as OsPrio;

/// System tick rate in Hz
pub const CFG_TICK_RATE_HZ: u32 = 1000;

/// Number of slots in the tick wheel
pub const CFG_TICK_WHEEL_SIZE: usize = 16;

/// Default time quanta for round-robin scheduling
pub const CFG_TIME_QUANTA_DEFAULT: OsTick = 10;

/// Minimum task stack size in words
pub const CFG_STK_SIZE_MIN: usize = 64;

/// Enable round-robin scheduling for same-priority tasks
pub const CFG_SCHED_ROUND_ROBIN_EN: bool = true;

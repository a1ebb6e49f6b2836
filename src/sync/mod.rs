//! Synchronization primitives
//!
//! The shared wait list, plus semaphores, mutexes and FIFO queues built
//! on it.

pub mod pend_list;

#[cfg(feature = "sem")]
pub mod sem;

#[cfg(feature = "mutex")]
pub mod mutex;

#[cfg(feature = "queue")]
pub mod queue;

//! Error codes for kernel operations
//!
//! Every kernel primitive reports failure through a small integer code;
//! there is no panicking path in kernel API code (interrupt context forbids
//! it). The discriminants follow the usual errno values so the codes stay
//! meaningful at an FFI or tooling boundary.

/// Kernel error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OsError {
    /// Caller lacks ownership, or the call is not permitted in this
    /// context (wrong owner on unlock, kernel not running, blocking or
    /// object creation attempted from an ISR)
    Perm = 1,

    /// Non-blocking operation would have to block, or a blocking
    /// operation was attempted with the scheduler locked
    Again = 11,

    /// Object is held by another task (non-blocking lock attempt)
    Busy = 16,

    /// Bad argument: priority out of range, stack too small, object not
    /// created, null control block
    Invalid = 22,

    /// Lock attempt that can never succeed: re-lock of an error-checking
    /// mutex by its owner, join on self
    Deadlock = 35,

    /// Counter ceiling reached: semaphore at its maximum, recursive mutex
    /// nesting at its maximum
    Overflow = 75,

    /// Tick deadline expired before the awaited event
    Timeout = 110,

    /// Wait was aborted by another task
    Canceled = 125,
}

/// Result type alias for kernel operations
pub type OsResult<T> = Result<T, OsError>;

impl OsError {
    /// Raw errno-style code
    #[inline]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

//! Interrupt-masking critical sections
//!
//! All kernel state is mutated inside a critical section: a scoped guard
//! that disables maskable interrupts on entry and restores the previous
//! mask state on every exit path. Sections nest freely; an inner guard
//! observes interrupts already disabled and leaves them that way.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

/// Critical section nesting depth, for diagnostics
static CS_DEPTH: AtomicU8 = AtomicU8::new(0);

/// RAII guard for critical sections
///
/// Creating the guard disables maskable interrupts; dropping it restores
/// the interrupt mask captured at entry.
pub struct CriticalSection {
    was_active: bool,
}

impl CriticalSection {
    /// Enter a critical section, saving the current interrupt mask state.
    #[inline(always)]
    pub fn enter() -> Self {
        #[cfg(target_arch = "arm")]
        let was_active = {
            let active = cortex_m::register::primask::read().is_active();
            cortex_m::interrupt::disable();
            active
        };

        #[cfg(not(target_arch = "arm"))]
        let was_active = CS_DEPTH.load(Ordering::Relaxed) == 0;

        CS_DEPTH.fetch_add(1, Ordering::Relaxed);
        CriticalSection { was_active }
    }

    /// Check if any critical section is currently active
    #[inline(always)]
    pub fn is_active() -> bool {
        CS_DEPTH.load(Ordering::Relaxed) > 0
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        CS_DEPTH.fetch_sub(1, Ordering::Relaxed);

        #[cfg(target_arch = "arm")]
        if self.was_active {
            unsafe { cortex_m::interrupt::enable() };
        }

        #[cfg(not(target_arch = "arm"))]
        let _ = self.was_active;
    }
}

/// Execute a closure with interrupts disabled
///
/// The closure receives a reference to the critical section guard, which
/// can be used to access [`CsCell`] protected data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// Check if currently executing in an ISR context
#[inline]
pub fn is_isr_context() -> bool {
    #[cfg(target_arch = "arm")]
    {
        let ipsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        ipsr != 0
    }

    #[cfg(not(target_arch = "arm"))]
    {
        false
    }
}

/// A cell that can only be accessed within a critical section.
pub struct CsCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for CsCell<T> {}

impl<T> CsCell<T> {
    /// Create a new CsCell
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Get a mutable reference to the inner value
    #[inline(always)]
    pub fn get(&self, _cs: &CriticalSection) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// Get a mutable reference without a guard
    ///
    /// # Safety
    /// Caller must ensure no other reference to the inner value is live;
    /// kernel code calls this only with interrupts already masked.
    #[inline(always)]
    pub unsafe fn get_unchecked(&self) -> &mut T {
        unsafe { &mut *self.0.get() }
    }
}

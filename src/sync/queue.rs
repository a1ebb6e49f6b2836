//! FIFO queue
//!
//! A circular buffer of fixed-size element slots coordinated by two
//! semaphores: `space_sem` counts free slots, `items_sem` counts queued
//! elements. Producers and consumers hand a transfer functor to the base,
//! which runs it on the current slot pointer inside a critical section, so
//! the same machinery serves byte buffers and typed element queues and a
//! half-written slot is never observable from interrupt context.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use crate::critical::{critical_section, is_isr_context};
use crate::error::{OsError, OsResult};
use crate::state;
use crate::sync::sem::OsSem;
use crate::types::{OsObjType, OsSemCtr, OsTick};

/// Untyped FIFO queue over caller-provided storage
pub struct OsQueueBase {
    /// Object type marker
    obj_type: OsObjType,
    /// Counts free slots; producers wait on it
    space_sem: OsSem,
    /// Counts queued elements; consumers wait on it
    items_sem: OsSem,
    /// First byte of the slot storage
    storage_begin: *mut u8,
    /// One past the last byte of the slot storage
    storage_end: *mut u8,
    /// Next slot to write
    write_pos: *mut u8,
    /// Next slot to read
    read_pos: *mut u8,
    /// Size of one element slot in bytes
    elem_size: usize,
}

impl OsQueueBase {
    /// Create a new, unconfigured queue
    pub const fn new() -> Self {
        OsQueueBase {
            obj_type: OsObjType::None,
            space_sem: OsSem::new(0),
            items_sem: OsSem::new(0),
            storage_begin: core::ptr::null_mut(),
            storage_end: core::ptr::null_mut(),
            write_pos: core::ptr::null_mut(),
            read_pos: core::ptr::null_mut(),
            elem_size: 0,
        }
    }

    /// Configure the queue over caller storage
    ///
    /// # Safety
    /// `storage` must point to at least `elem_size * capacity` writable
    /// bytes that outlive the queue.
    pub unsafe fn create(
        &mut self,
        storage: *mut u8,
        elem_size: usize,
        capacity: usize,
    ) -> OsResult<()> {
        if is_isr_context() {
            return Err(OsError::Perm);
        }

        if storage.is_null() || elem_size == 0 || capacity == 0 {
            return Err(OsError::Invalid);
        }

        critical_section(|_cs| {
            self.space_sem
                .create(capacity as OsSemCtr, capacity as OsSemCtr, "q.space")?;
            self.items_sem.create(0, capacity as OsSemCtr, "q.items")?;

            self.storage_begin = storage;
            self.storage_end = unsafe { storage.add(elem_size * capacity) };
            self.write_pos = storage;
            self.read_pos = storage;
            self.elem_size = elem_size;
            self.obj_type = OsObjType::Queue;

            Ok(())
        })
    }

    /// Next slot position, wrapping at the end of storage
    fn advance(&self, pos: *mut u8) -> *mut u8 {
        let next = unsafe { pos.add(self.elem_size) };
        if next >= self.storage_end {
            self.storage_begin
        } else {
            next
        }
    }

    /// Write one element through the transfer functor
    ///
    /// Waits for a free slot, then runs the functor on the write position
    /// and advances it, all inside one critical section. The first
    /// non-`Ok` result from the underlying semaphores is propagated.
    pub fn push_with(
        &mut self,
        transfer: impl FnOnce(*mut u8),
        deadline: Option<OsTick>,
        non_blocking: bool,
    ) -> OsResult<()> {
        if self.obj_type != OsObjType::Queue {
            return Err(OsError::Invalid);
        }

        self.space_sem.pend(deadline, non_blocking)?;
        self.commit_push(transfer)
    }

    /// Slot transfer and hand-off after a space permit was obtained
    fn commit_push(&mut self, transfer: impl FnOnce(*mut u8)) -> OsResult<()> {
        critical_section(|_cs| {
            transfer(self.write_pos);
            self.write_pos = self.advance(self.write_pos);
        });

        self.items_sem.post()
    }

    /// Read one element through the transfer functor; symmetric to
    /// [`push_with`](Self::push_with)
    pub fn pop_with(
        &mut self,
        transfer: impl FnOnce(*mut u8),
        deadline: Option<OsTick>,
        non_blocking: bool,
    ) -> OsResult<()> {
        if self.obj_type != OsObjType::Queue {
            return Err(OsError::Invalid);
        }

        self.items_sem.pend(deadline, non_blocking)?;
        self.commit_pop(transfer)
    }

    /// Slot transfer and hand-off after an item permit was obtained
    fn commit_pop(&mut self, transfer: impl FnOnce(*mut u8)) -> OsResult<()> {
        critical_section(|_cs| {
            transfer(self.read_pos);
            self.read_pos = self.advance(self.read_pos);
        });

        self.space_sem.post()
    }

    /// Number of queued elements
    pub fn len(&self) -> usize {
        self.items_sem.count() as usize
    }

    /// Whether the queue holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for OsQueueBase {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for OsQueueBase {}
unsafe impl Sync for OsQueueBase {}

// ============ Typed Wrapper ============

/// Statically allocated FIFO queue of `N` elements of type `T`
pub struct OsFifoQueue<T, const N: usize> {
    base: UnsafeCell<OsQueueBase>,
    storage: UnsafeCell<[MaybeUninit<T>; N]>,
}

unsafe impl<T: Send, const N: usize> Sync for OsFifoQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Send for OsFifoQueue<T, N> {}

impl<T: Send, const N: usize> OsFifoQueue<T, N> {
    pub const fn new() -> Self {
        OsFifoQueue {
            base: UnsafeCell::new(OsQueueBase::new()),
            storage: UnsafeCell::new([const { MaybeUninit::uninit() }; N]),
        }
    }

    /// Initialize the queue over its embedded storage
    pub fn create(&self) -> OsResult<()> {
        unsafe {
            let storage = (*self.storage.get()).as_mut_ptr() as *mut u8;
            (*self.base.get()).create(storage, core::mem::size_of::<T>(), N)
        }
    }

    fn push_inner(&self, value: T, deadline: Option<OsTick>, non_blocking: bool) -> OsResult<()> {
        unsafe {
            (*self.base.get()).push_with(
                |dst| unsafe { (dst as *mut T).write(value) },
                deadline,
                non_blocking,
            )
        }
    }

    fn pop_inner(&self, deadline: Option<OsTick>, non_blocking: bool) -> OsResult<T> {
        let mut slot = MaybeUninit::<T>::uninit();
        unsafe {
            (*self.base.get()).pop_with(
                |src| {
                    slot.write(unsafe { (src as *mut T).read() });
                },
                deadline,
                non_blocking,
            )?;
            Ok(slot.assume_init())
        }
    }

    /// Append an element, blocking while the queue is full
    pub fn push(&self, value: T) -> OsResult<()> {
        self.push_inner(value, None, false)
    }

    /// Append without blocking; `Again` when full (the element is dropped)
    pub fn try_push(&self, value: T) -> OsResult<()> {
        self.push_inner(value, None, true)
    }

    /// Append, waiting at most `ticks` ticks for a free slot
    pub fn push_for(&self, value: T, ticks: OsTick) -> OsResult<()> {
        let deadline = state::KERNEL.tick_get().wrapping_add(ticks);
        self.push_inner(value, Some(deadline), false)
    }

    /// Take the oldest element, blocking while the queue is empty
    pub fn pop(&self) -> OsResult<T> {
        self.pop_inner(None, false)
    }

    /// Take without blocking; `Again` when empty
    pub fn try_pop(&self) -> OsResult<T> {
        self.pop_inner(None, true)
    }

    /// Take, waiting at most `ticks` ticks for an element
    pub fn pop_for(&self, ticks: OsTick) -> OsResult<T> {
        let deadline = state::KERNEL.tick_get().wrapping_add(ticks);
        self.pop_inner(Some(deadline), false)
    }

    /// Number of queued elements
    pub fn len(&self) -> usize {
        unsafe { (*self.base.get()).len() }
    }

    /// Whether the queue holds no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send, const N: usize> Default for OsFifoQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

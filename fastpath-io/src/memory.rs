use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::slice;

use libc::{c_void, mlock, munlock};
use log::warn;
use thiserror::Error;

use crate::slot::{AddressFamily, SlotRegion};

/// Alignment of slot buffers handed to the batch calls.
pub const PAGE_SIZE: usize = 4096;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate {0} bytes of aligned memory")]
    AllocationFailed(usize),
    #[error("buffer of {slot_count} slots x {slot_size} bytes overflows usize")]
    SizeOverflow { slot_count: usize, slot_size: usize },
    #[error("zero-sized buffer requested")]
    Empty,
}

/// A zeroed, page-aligned buffer for a batch of slots.
/// Locked into RAM via `mlock` when the limit allows it.
pub struct SlotBuffer {
    ptr: *mut u8,
    layout: Layout,
    locked: bool,
    slot_size: usize,
}

// SAFETY: the allocation is owned exclusively by this value.
unsafe impl Send for SlotBuffer {}

impl SlotBuffer {
    /// Allocates room for `slot_count` slots of `slot_size` bytes, rounded up to
    /// whole pages.
    ///
    /// # Logic
    /// Zeroed, 4096-byte aligned allocation followed by `mlock`. A refused lock is
    /// logged and the buffer is returned unlocked (see [`SlotBuffer::is_locked`]).
    ///
    /// # Errors
    /// `Empty` for a zero-sized request, `SizeOverflow` when the size does not fit in
    /// `usize`, `AllocationFailed` when the allocator returns null.
    pub fn new(slot_count: usize, slot_size: usize) -> Result<Self, MemoryError> {
        let len = slot_count
            .checked_mul(slot_size)
            .ok_or(MemoryError::SizeOverflow { slot_count, slot_size })?;
        if len == 0 {
            return Err(MemoryError::Empty);
        }
        let rounded = len
            .checked_add(PAGE_SIZE - 1)
            .map(|n| n & !(PAGE_SIZE - 1))
            .ok_or(MemoryError::SizeOverflow { slot_count, slot_size })?;
        let layout = Layout::from_size_align(rounded, PAGE_SIZE).map_err(|_| MemoryError::AllocationFailed(rounded))?;

        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::AllocationFailed(rounded));
        }

        // SAFETY: `ptr` is a live allocation of `layout.size()` bytes.
        let locked = unsafe { mlock(ptr as *const c_void, layout.size()) == 0 };
        if !locked {
            warn!(
                "Failed to lock {} byte slot buffer via mlock: {}. Pages may be swapped.",
                layout.size(),
                std::io::Error::last_os_error()
            );
        }

        Ok(Self { ptr, layout, locked, slot_size })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Whole slots that fit in the buffer.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.layout.size() / self.slot_size
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: initialized by `alloc_zeroed`, alive as long as `self`.
        unsafe { slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` guarantees exclusivity.
        unsafe { slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }

    /// Slot view over the whole buffer.
    pub fn region(&mut self, family: AddressFamily) -> crate::Result<SlotRegion<&mut [u8]>> {
        let slot_size = self.slot_size;
        SlotRegion::new(self.as_slice_mut(), family, slot_size)
    }
}

impl AsRef<[u8]> for SlotBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SlotBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_slice_mut()
    }
}

impl Drop for SlotBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with `layout` in `new` and is released once.
        unsafe {
            if self.locked {
                munlock(self.ptr as *const c_void, self.layout.size());
            }
            dealloc(self.ptr, self.layout);
        }
    }
}

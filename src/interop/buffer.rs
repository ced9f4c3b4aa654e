//! Per-call argument buffers and raw slot access
//!
//! An `ArgumentBuffer` holds two regions in one allocation:
//! - a scratch area at the low offsets holding argument bytes and the return
//!   slot, at the offsets the layout computed
//! - a pointer table at the next pointer-aligned offset, one entry per
//!   argument pointing at that argument's slot, as `ffi_call` expects
//!
//! The buffer lives for exactly one invocation and is freed on drop.

use super::call::CallDescriptor;
use super::layout::{align_up, extent, POINTER_ALIGN, POINTER_SIZE};
use crate::error::{FfiError, Result};
use core::ffi::c_void;
use core::ptr::NonNull;
use std::alloc::{self, Layout};

/// Untyped address of an argument, return value or scratch area
///
/// Reads and writes are unaligned and unchecked: the layer above is
/// responsible for matching the bytes to the declared native types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Slot(NonNull<u8>);

impl Slot {
    /// Wrap a raw address, rejecting null
    #[inline]
    pub fn new(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr.cast()).map(Self)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr().cast()
    }

    /// Slot `offset` bytes further on
    ///
    /// # Safety
    /// The result must stay within the allocation this slot points into.
    #[inline]
    pub unsafe fn add(self, offset: usize) -> Self {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(offset)))
    }

    /// Read a `T` stored at this slot
    ///
    /// # Safety
    /// `size_of::<T>()` bytes must be readable and hold a valid `T`.
    #[inline]
    pub unsafe fn read<T: Copy>(self) -> T {
        self.0.as_ptr().cast::<T>().read_unaligned()
    }

    /// Store a `T` at this slot
    ///
    /// # Safety
    /// `size_of::<T>()` bytes must be writable.
    #[inline]
    pub unsafe fn write<T: Copy>(self, value: T) {
        self.0.as_ptr().cast::<T>().write_unaligned(value)
    }

    /// # Safety
    /// See `add` and `read`.
    #[inline]
    pub unsafe fn read_at<T: Copy>(self, offset: usize) -> T {
        self.add(offset).read()
    }

    /// # Safety
    /// See `add` and `write`.
    #[inline]
    pub unsafe fn write_at<T: Copy>(self, offset: usize, value: T) {
        self.add(offset).write(value)
    }

    /// Copy raw bytes into this slot
    ///
    /// # Safety
    /// `bytes.len()` bytes must be writable and must not overlap `bytes`.
    #[inline]
    pub unsafe fn copy_from(self, bytes: &[u8]) {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.0.as_ptr(), bytes.len());
    }
}

/// Scratch area plus pointer table for one native call
pub struct ArgumentBuffer {
    base: NonNull<u8>,
    layout: Layout,
    table_offset: usize,
    arity: usize,
}

impl ArgumentBuffer {
    /// Allocate and populate a buffer for a prepared descriptor
    pub fn new(descriptor: &CallDescriptor) -> Result<Self> {
        let elements = descriptor
            .layout()
            .elements()
            .filter(|_| descriptor.is_ready())
            .ok_or_else(|| FfiError::wrong_state("argument_buffer", descriptor.state()))?;

        let arity = elements.len();
        let table_offset = align_up(descriptor.total_bytes(), POINTER_ALIGN)?;
        let table_bytes = arity
            .checked_mul(POINTER_SIZE)
            .ok_or(FfiError::OutOfMemory("argument buffer"))?;
        let bytes = extent(table_offset, table_bytes)?;
        let align = descriptor
            .max_alignment()
            .max(descriptor.return_alignment())
            .max(POINTER_ALIGN);

        let layout = Layout::from_size_align(bytes.max(POINTER_SIZE), align)
            .map_err(|_| FfiError::OutOfMemory("argument buffer"))?;
        // SAFETY: layout has nonzero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(FfiError::OutOfMemory("argument buffer"))?;

        let buffer = Self {
            base,
            layout,
            table_offset,
            arity,
        };

        let table = buffer.pointer_table();
        let mut offset = 0;
        for (index, element) in elements.iter().enumerate() {
            offset = align_up(offset, element.alignment())?;
            // SAFETY: offsets stay inside the scratch area and `index < arity`.
            unsafe {
                table
                    .add(index)
                    .write(buffer.base.as_ptr().add(offset).cast::<c_void>());
            }
            offset = extent(offset, element.size())?;
        }

        Ok(buffer)
    }

    /// Start of the scratch area
    #[inline]
    pub fn scratch(&self) -> Slot {
        Slot(self.base)
    }

    /// Slot at `offset` within the scratch area
    ///
    /// # Safety
    /// `offset` must lie within the scratch area.
    #[inline]
    pub unsafe fn slot(&self, offset: usize) -> Slot {
        self.scratch().add(offset)
    }

    /// Table of per-argument pointers handed to `ffi_call`
    #[inline]
    pub fn pointer_table(&self) -> *mut *mut c_void {
        // SAFETY: table_offset is within the allocation and pointer-aligned.
        unsafe { self.base.as_ptr().add(self.table_offset).cast() }
    }

    /// Entry `index` of the pointer table
    pub fn argument(&self, index: usize) -> Option<Slot> {
        if index >= self.arity {
            return None;
        }
        // SAFETY: index < arity and every entry was written in `new`.
        let ptr = unsafe { self.pointer_table().add(index).read() };
        Slot::new(ptr)
    }

    #[inline]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Total bytes allocated, scratch area and pointer table together
    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }
}

impl Drop for ArgumentBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with exactly this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl core::fmt::Debug for ArgumentBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ArgumentBuffer")
            .field("base", &self.base)
            .field("bytes", &self.layout.size())
            .field("table_offset", &self.table_offset)
            .field("arity", &self.arity)
            .finish()
    }
}

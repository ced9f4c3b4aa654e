//! Prepared call interfaces and outbound native calls
//!
//! A `CallDescriptor` is a `LayoutBuilder` for an argument list plus a return
//! slot and a libffi call interface. Once prepared it is immutable and may be
//! shared across threads; each invocation gets its own `ArgumentBuffer`.

use super::abi::{check_status, CallingConvention};
use super::buffer::{ArgumentBuffer, Slot};
use super::errno;
use super::layout::{align_up, extent, LayoutBuilder, LayoutState, POINTER_ALIGN, POINTER_SIZE};
use super::types::TypeDescriptor;
use super::COUNTERS;
use crate::error::{FfiError, Result};
use crate::logging::{log_ffi_call, log_ffi_error, log_ffi_return};
use core::ffi::c_uint;
use core::mem;
use core::ptr;
use libffi::middle::{CodePtr, Type};
use libffi::raw;
use std::sync::atomic::Ordering;
use tracing::debug;

/// Compiled libffi interface plus everything it points at
struct PreparedInterface {
    cif: Box<raw::ffi_cif>,
    /// Keeps the return `ffi_type` alive for as long as `cif` refers to it
    _return_type: Type,
    abi: raw::ffi_abi,
}

impl PreparedInterface {
    #[inline]
    fn cif_ptr(&self) -> *mut raw::ffi_cif {
        // libffi takes a mutable pointer but only reads a prepared interface.
        ptr::addr_of!(*self.cif).cast_mut()
    }
}

/// Argument layout, return slot and prepared call interface
pub struct CallDescriptor {
    layout: LayoutBuilder,
    return_offset: usize,
    return_alignment: usize,
    prepared: Option<PreparedInterface>,
}

// SAFETY: after `prepare` the descriptor is never mutated; libffi only reads
// the interface during calls, so concurrent invocations are sound.
unsafe impl Send for CallDescriptor {}
unsafe impl Sync for CallDescriptor {}

impl CallDescriptor {
    pub fn new() -> Self {
        Self {
            layout: LayoutBuilder::new(),
            return_offset: 0,
            return_alignment: 1,
            prepared: None,
        }
    }

    /// Append an argument, returning its offset in the scratch area
    #[inline]
    pub fn add_element(&mut self, descriptor: &TypeDescriptor) -> Result<usize> {
        self.layout.add_element(descriptor)
    }

    /// Append an argument known only by footprint
    ///
    /// Such a descriptor can no longer be prepared for a call.
    #[inline]
    pub fn add_opaque_element(&mut self, size: usize, alignment: usize) -> Result<usize> {
        self.layout.add_opaque_element(size, alignment)
    }

    #[inline]
    pub fn layout(&self) -> &LayoutBuilder {
        &self.layout
    }

    #[inline]
    pub fn state(&self) -> LayoutState {
        self.layout.state()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.prepared.is_some()
    }

    /// Scratch bytes needed, including return slot and trailing pad once prepared
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.layout.total_bytes()
    }

    #[inline]
    pub fn max_alignment(&self) -> usize {
        self.layout.max_alignment()
    }

    /// Number of arguments
    #[inline]
    pub fn arity(&self) -> usize {
        self.layout.len()
    }

    /// Offset of the return slot (meaningful once prepared)
    #[inline]
    pub fn return_offset(&self) -> usize {
        self.return_offset
    }

    /// Alignment the return slot needs (meaningful once prepared)
    #[inline]
    pub fn return_alignment(&self) -> usize {
        self.return_alignment
    }

    /// Prepare for the target's default calling convention
    pub fn prepare(&mut self, return_type: &TypeDescriptor) -> Result<()> {
        self.prepare_with(return_type, CallingConvention::Default)
    }

    /// Reserve the return slot and compile the call interface
    ///
    /// On failure the descriptor is left untouched in `Building`.
    pub fn prepare_with(
        &mut self,
        return_type: &TypeDescriptor,
        convention: CallingConvention,
    ) -> Result<()> {
        let state = self.layout.state();
        if state != LayoutState::Building {
            return Err(FfiError::wrong_state("prepare", state));
        }
        let native_return = return_type
            .native()
            .cloned()
            .ok_or(FfiError::BadCallingConvention)?;

        let return_offset = align_up(self.layout.total_bytes(), return_type.alignment())?;
        // libffi may write a full register past a small return value, so pad
        // to pointer alignment and leave one extra pointer-sized word.
        let return_end = extent(return_offset, return_type.size())?;
        let total_bytes = extent(align_up(return_end, POINTER_ALIGN)?, POINTER_SIZE)?;

        let nargs =
            c_uint::try_from(self.layout.len()).map_err(|_| FfiError::BadCallingConvention)?;
        let abi = convention.as_raw();
        // SAFETY: an all-zero ffi_cif is a valid blank interface for prep_cif to fill.
        let mut cif: Box<raw::ffi_cif> = Box::new(unsafe { mem::zeroed() });
        let status = unsafe {
            raw::ffi_prep_cif(
                &mut *cif,
                abi,
                nargs,
                native_return.as_raw_ptr(),
                self.layout.native_types_ptr(),
            )
        };
        check_status(status, abi)?;

        self.return_offset = return_offset;
        self.return_alignment = return_type.alignment();
        self.layout.finish_call(total_bytes);
        self.prepared = Some(PreparedInterface {
            cif,
            _return_type: native_return,
            abi,
        });

        debug!(
            target: "ffi",
            arity = nargs,
            return_offset,
            total_bytes,
            "call interface prepared"
        );
        Ok(())
    }

    /// Raw interface for closures; `None` until prepared
    pub(crate) fn cif_ptr(&self) -> Option<*mut raw::ffi_cif> {
        self.prepared.as_ref().map(PreparedInterface::cif_ptr)
    }

    pub(crate) fn abi(&self) -> raw::ffi_abi {
        self.prepared
            .as_ref()
            .map_or(CallingConvention::Default.as_raw(), |prepared| prepared.abi)
    }
}

impl Default for CallDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for CallDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CallDescriptor")
            .field("layout", &self.layout)
            .field("return_offset", &self.return_offset)
            .field("prepared", &self.is_ready())
            .finish()
    }
}

/// Call a native function through a prepared descriptor
///
/// `write_args` receives the scratch area and must store every argument at
/// the offset `add_element` returned for it; `read_return` receives the
/// return slot after the call.
///
/// # Safety
/// `function` must be a native function whose signature matches
/// `descriptor`, and `write_args` must fill every argument slot with a valid
/// value of its declared type.
pub unsafe fn invoke<T, W, R>(
    function: CodePtr,
    descriptor: &CallDescriptor,
    write_args: W,
    read_return: R,
) -> Result<T>
where
    W: FnOnce(Slot),
    R: FnOnce(Slot) -> T,
{
    call_through(function, descriptor, None, write_args, read_return)
}

/// `invoke`, failing with `OsError` if the call leaves `errno` nonzero
///
/// `errno` is cleared immediately before the native call and inspected
/// immediately after it, before `read_return` runs.
///
/// # Safety
/// See `invoke`.
pub unsafe fn invoke_with_os_error_check<T, W, R>(
    function_name: &str,
    function: CodePtr,
    descriptor: &CallDescriptor,
    write_args: W,
    read_return: R,
) -> Result<T>
where
    W: FnOnce(Slot),
    R: FnOnce(Slot) -> T,
{
    call_through(function, descriptor, Some(function_name), write_args, read_return)
}

unsafe fn call_through<T, W, R>(
    function: CodePtr,
    descriptor: &CallDescriptor,
    errno_check: Option<&str>,
    write_args: W,
    read_return: R,
) -> Result<T>
where
    W: FnOnce(Slot),
    R: FnOnce(Slot) -> T,
{
    let prepared = descriptor
        .prepared
        .as_ref()
        .ok_or_else(|| FfiError::wrong_state("invoke", descriptor.state()))?;

    let buffer = ArgumentBuffer::new(descriptor)?;
    let return_slot = buffer.slot(descriptor.return_offset());
    write_args(buffer.scratch());

    let name = errno_check.unwrap_or("<anonymous>");
    log_ffi_call(name, buffer.arity());
    COUNTERS.calls.fetch_add(1, Ordering::Relaxed);

    if errno_check.is_some() {
        errno::set(0);
    }
    raw::ffi_call(
        prepared.cif_ptr(),
        Some(*function.as_fun()),
        return_slot.as_ptr(),
        buffer.pointer_table(),
    );
    let code = if errno_check.is_some() { errno::get() } else { 0 };

    if code != 0 {
        COUNTERS.os_errors.fetch_add(1, Ordering::Relaxed);
        let error = FfiError::OsError {
            code,
            function: name.to_owned(),
        };
        log_ffi_error(name, &error.to_string());
        return Err(error);
    }

    log_ffi_return(name);
    Ok(read_return(return_slot))
}

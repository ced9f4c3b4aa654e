//! Incremental byte layout for argument lists and struct fields
//!
//! A `LayoutBuilder` walks a sequence of element types, placing each at the
//! next offset that satisfies its alignment. The same builder serves two
//! purposes: it describes the scratch area used for a native call, and it
//! describes the field layout of a struct that may itself be passed by value.
//!
//! Once an opaque element is added only aggregate size/alignment survive.

use super::abi::{check_status, CallingConvention};
use super::types::TypeDescriptor;
use crate::error::{FfiError, Result};
use core::ffi::c_void;
use core::mem::{self, align_of, size_of};
use core::ptr;
use libffi::middle::Type;
use libffi::raw;
use tracing::{debug, trace};

/// Native pointer size in bytes
pub(crate) const POINTER_SIZE: usize = size_of::<*const c_void>();

/// Native pointer alignment in bytes
pub(crate) const POINTER_ALIGN: usize = align_of::<*const c_void>();

const INITIAL_CAPACITY: usize = 8;

/// Round `offset` up to the next multiple of `alignment`
///
/// `alignment` must be a nonzero power of two.
#[inline]
pub fn align_up(offset: usize, alignment: usize) -> Result<usize> {
    if !alignment.is_power_of_two() {
        return Err(FfiError::InvalidAlignment(alignment));
    }
    round_up(offset, alignment).ok_or(FfiError::OutOfMemory("layout size"))
}

/// `align_up` for alignments already known to be powers of two
///
/// `None` if the result does not fit in `usize`.
#[inline]
pub(crate) const fn round_up(offset: usize, alignment: usize) -> Option<usize> {
    match offset.checked_add(alignment - 1) {
        Some(bumped) => Some(bumped & !(alignment - 1)),
        None => None,
    }
}

/// End of a `size`-byte element placed at `offset`
#[inline]
pub(crate) fn extent(offset: usize, size: usize) -> Result<usize> {
    offset
        .checked_add(size)
        .ok_or(FfiError::OutOfMemory("layout size"))
}

/// Lifecycle of a builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutState {
    /// Accepting elements, per-element types retained
    Building,
    /// Accepting elements, only size/alignment retained
    BuildingOpaque,
    /// Completed as a passable struct
    StructReady,
    /// Completed as an opaque aggregate
    StructReadyOpaque,
    /// Completed as a prepared call interface; immutable
    CallReady,
}

/// Incremental layout of typed elements
pub struct LayoutBuilder {
    total_bytes: usize,
    max_alignment: usize,
    len: usize,
    elements: Vec<TypeDescriptor>,
    /// Raw libffi handles for `elements`, always followed by a null terminator
    native_types: Vec<*mut raw::ffi_type>,
    state: LayoutState,
}

// SAFETY: `native_types` only points at `ffi_type`s owned by `elements`
// (or libffi's statics). The builder is mutated by its single owner and is
// read-only once it is shared.
unsafe impl Send for LayoutBuilder {}
unsafe impl Sync for LayoutBuilder {}

impl LayoutBuilder {
    pub fn new() -> Self {
        Self {
            total_bytes: 0,
            max_alignment: 0,
            len: 0,
            elements: Vec::new(),
            native_types: vec![ptr::null_mut()],
            state: LayoutState::Building,
        }
    }

    #[inline]
    pub fn state(&self) -> LayoutState {
        self.state
    }

    /// Bytes laid out so far
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Largest element alignment seen so far (0 when empty)
    #[inline]
    pub fn max_alignment(&self) -> usize {
        self.max_alignment
    }

    /// Number of elements added, opaque ones included
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_opaque(&self) -> bool {
        matches!(
            self.state,
            LayoutState::BuildingOpaque | LayoutState::StructReadyOpaque
        )
    }

    /// Element types in insertion order, or `None` once the layout is opaque
    pub fn elements(&self) -> Option<&[TypeDescriptor]> {
        if self.is_opaque() {
            None
        } else {
            Some(&self.elements)
        }
    }

    /// Element offsets, recomputed by walking the element list from zero
    pub fn offsets(&self) -> Option<Vec<usize>> {
        let elements = self.elements()?;
        let mut offsets = Vec::with_capacity(elements.len());
        let mut offset = 0;
        for element in elements {
            offset = round_up(offset, element.alignment())?;
            offsets.push(offset);
            offset = offset.checked_add(element.size())?;
        }
        Some(offsets)
    }

    /// Append a typed element, returning its offset
    ///
    /// An opaque-aggregate descriptor has no native type to retain, so adding
    /// one turns the whole layout opaque.
    pub fn add_element(&mut self, descriptor: &TypeDescriptor) -> Result<usize> {
        match self.state {
            LayoutState::Building => {
                let Some(native) = descriptor.native().cloned() else {
                    return self.add_opaque_element(descriptor.size(), descriptor.alignment());
                };

                let offset = align_up(self.total_bytes, descriptor.alignment())?;
                let end = extent(offset, descriptor.size())?;
                self.reserve_slot()?;

                // native_types must point at the copy kept in `elements`.
                let raw_type = native.as_raw_ptr();
                self.elements.push(TypeDescriptor::new(
                    descriptor.size(),
                    descriptor.alignment(),
                    native,
                ));
                let terminator = self.native_types.len() - 1;
                self.native_types[terminator] = raw_type;
                self.native_types.push(ptr::null_mut());

                self.total_bytes = end;
                self.len += 1;
                self.max_alignment = self.max_alignment.max(descriptor.alignment());

                trace!(
                    target: "layout",
                    offset,
                    size = descriptor.size(),
                    alignment = descriptor.alignment(),
                    "element added"
                );
                Ok(offset)
            }
            state => Err(FfiError::wrong_state("add_element", state)),
        }
    }

    /// Append an element known only by size and alignment, returning its offset
    ///
    /// Irreversibly discards per-element type information.
    pub fn add_opaque_element(&mut self, size: usize, alignment: usize) -> Result<usize> {
        match self.state {
            LayoutState::Building | LayoutState::BuildingOpaque => {
                let offset = align_up(self.total_bytes, alignment)?;
                let end = extent(offset, size)?;

                if self.state == LayoutState::Building {
                    debug!(target: "layout", elements = self.len, "layout became opaque");
                    self.state = LayoutState::BuildingOpaque;
                    self.elements = Vec::new();
                    self.native_types = vec![ptr::null_mut()];
                }

                self.total_bytes = end;
                self.len += 1;
                self.max_alignment = self.max_alignment.max(alignment);

                trace!(target: "layout", offset, size, alignment, "opaque element added");
                Ok(offset)
            }
            state => Err(FfiError::wrong_state("add_opaque_element", state)),
        }
    }

    /// Finish the layout as a struct type usable as an element elsewhere
    pub fn complete_as_struct(&mut self) -> Result<TypeDescriptor> {
        match self.state {
            LayoutState::Building if self.elements.is_empty() => {
                Err(FfiError::BadCallingConvention)
            }
            LayoutState::Building => {
                let fields: Vec<Type> = self
                    .elements
                    .iter()
                    .filter_map(|element| element.native().cloned())
                    .collect();
                let native = Type::structure(fields);
                let (size, alignment) = aggregate_footprint(&native)?;

                self.state = LayoutState::StructReady;
                debug!(
                    target: "layout",
                    fields = self.len,
                    size,
                    alignment,
                    "struct layout completed"
                );
                Ok(TypeDescriptor::new(size, alignment, native))
            }
            LayoutState::BuildingOpaque => {
                let size = align_up(self.total_bytes, self.max_alignment)?;
                let alignment = self.max_alignment;

                self.state = LayoutState::StructReadyOpaque;
                debug!(
                    target: "layout",
                    fields = self.len,
                    size,
                    alignment,
                    "opaque struct layout completed"
                );
                Ok(TypeDescriptor::opaque(size, alignment))
            }
            state => Err(FfiError::wrong_state("complete_as_struct", state)),
        }
    }

    /// Keep at least one spare slot past the live elements for the terminator
    fn reserve_slot(&mut self) -> Result<()> {
        if self.native_types.len() + 1 > self.native_types.capacity() {
            let additional = self.native_types.capacity().max(INITIAL_CAPACITY);
            self.native_types
                .try_reserve_exact(additional)
                .map_err(|_| FfiError::OutOfMemory("layout element storage"))?;
        }
        self.elements
            .try_reserve(1)
            .map_err(|_| FfiError::OutOfMemory("layout element storage"))
    }

    /// Null-terminated array of element types for `ffi_prep_cif`
    pub(crate) fn native_types_ptr(&mut self) -> *mut *mut raw::ffi_type {
        self.native_types.as_mut_ptr()
    }

    /// Commit the return slot and trailing pad computed by call preparation
    pub(crate) fn finish_call(&mut self, total_bytes: usize) {
        self.total_bytes = total_bytes;
        self.state = LayoutState::CallReady;
    }
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for LayoutBuilder {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LayoutBuilder")
            .field("state", &self.state)
            .field("total_bytes", &self.total_bytes)
            .field("max_alignment", &self.max_alignment)
            .field("len", &self.len)
            .finish()
    }
}

/// Ask libffi for a struct type's padded size and alignment
///
/// libffi only fills these in while preparing a call interface, so a
/// throwaway interface returning the struct is prepared for the purpose.
fn aggregate_footprint(native: &Type) -> Result<(usize, usize)> {
    let raw_type = native.as_raw_ptr();
    let abi = CallingConvention::Default.as_raw();
    // SAFETY: an all-zero ffi_cif is a valid blank interface for prep_cif to fill.
    let mut cif: raw::ffi_cif = unsafe { mem::zeroed() };
    let status = unsafe { raw::ffi_prep_cif(&mut cif, abi, 0, raw_type, ptr::null_mut()) };
    check_status(status, abi)?;

    // SAFETY: raw_type is owned by `native` and was just initialized by libffi.
    let (size, alignment) = unsafe { ((*raw_type).size, usize::from((*raw_type).alignment)) };
    Ok((size, alignment))
}

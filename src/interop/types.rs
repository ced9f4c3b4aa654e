//! Type descriptors consumed by the layout machinery
//!
//! Each descriptor carries a byte size, a byte alignment and, for anything
//! that can cross a native call boundary by value, a libffi type handle.

use core::ffi::c_void;
use core::mem::{align_of, size_of};
use libffi::middle::Type;

/// Primitive native types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Primitive {
    Void,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Pointer,
    Usize,
    Isize,
}

impl Primitive {
    /// Size of type in bytes
    #[inline]
    pub const fn size(self) -> usize {
        match self {
            Self::Void => 0,
            Self::Bool => size_of::<bool>(),
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
            Self::Pointer => size_of::<*const c_void>(),
            Self::Usize | Self::Isize => size_of::<usize>(),
        }
    }

    /// Alignment requirement
    #[inline]
    pub const fn align(self) -> usize {
        match self {
            Self::Void => 1,
            Self::Bool => align_of::<bool>(),
            Self::I8 | Self::U8 => align_of::<u8>(),
            Self::I16 | Self::U16 => align_of::<u16>(),
            Self::I32 | Self::U32 => align_of::<u32>(),
            Self::F32 => align_of::<f32>(),
            Self::I64 | Self::U64 => align_of::<u64>(),
            Self::F64 => align_of::<f64>(),
            Self::Pointer => align_of::<*const c_void>(),
            Self::Usize | Self::Isize => align_of::<usize>(),
        }
    }

    /// Check if type is integral
    #[inline]
    pub const fn is_integral(self) -> bool {
        matches!(
            self,
            Self::I8
                | Self::I16
                | Self::I32
                | Self::I64
                | Self::U8
                | Self::U16
                | Self::U32
                | Self::U64
                | Self::Usize
                | Self::Isize
        )
    }

    /// Check if type is floating point
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// libffi handle for this primitive
    pub fn native_type(self) -> Type {
        match self {
            Self::Void => Type::void(),
            Self::Bool => Type::u8(),
            Self::I8 => Type::i8(),
            Self::I16 => Type::i16(),
            Self::I32 => Type::i32(),
            Self::I64 => Type::i64(),
            Self::U8 => Type::u8(),
            Self::U16 => Type::u16(),
            Self::U32 => Type::u32(),
            Self::U64 => Type::u64(),
            Self::F32 => Type::f32(),
            Self::F64 => Type::f64(),
            Self::Pointer => Type::pointer(),
            Self::Usize => Type::usize(),
            Self::Isize => Type::isize(),
        }
    }

    /// Full descriptor for this primitive
    pub fn descriptor(self) -> TypeDescriptor {
        TypeDescriptor::new(self.size(), self.align(), self.native_type())
    }
}

/// Size, alignment and native handle for one element type
///
/// A descriptor without a native handle is an opaque aggregate: it has a
/// known footprint but cannot be passed by value through libffi.
#[derive(Clone)]
pub struct TypeDescriptor {
    size: usize,
    alignment: usize,
    native: Option<Type>,
}

// SAFETY: the wrapped `ffi_type` is never mutated after the descriptor is
// built; libffi only reads it while preparing call interfaces.
unsafe impl Send for TypeDescriptor {}
unsafe impl Sync for TypeDescriptor {}

impl TypeDescriptor {
    /// Passable descriptor
    #[inline]
    pub fn new(size: usize, alignment: usize, native: Type) -> Self {
        Self {
            size,
            alignment,
            native: Some(native),
        }
    }

    /// Opaque aggregate of the given footprint
    #[inline]
    pub fn opaque(size: usize, alignment: usize) -> Self {
        Self {
            size,
            alignment,
            native: None,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// libffi handle, absent for opaque aggregates
    #[inline]
    pub fn native(&self) -> Option<&Type> {
        self.native.as_ref()
    }

    #[inline]
    pub fn is_opaque(&self) -> bool {
        self.native.is_none()
    }
}

impl core::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("opaque", &self.is_opaque())
            .finish()
    }
}

impl From<Primitive> for TypeDescriptor {
    #[inline]
    fn from(primitive: Primitive) -> Self {
        primitive.descriptor()
    }
}

//! dynffi - Dynamic native calls and callbacks for managed runtimes
//!
//! Signatures are discovered at run time: build a layout element by element,
//! prepare it into a call descriptor, then either call native functions
//! through it or synthesize trampolines that native code can call back into.
//!
//! ```ignore
//! let mut add = CallDescriptor::new();
//! let a = add.add_element(&Primitive::I32.descriptor())?;
//! let b = add.add_element(&Primitive::I32.descriptor())?;
//! add.prepare(&Primitive::I32.descriptor())?;
//!
//! let sum: i32 = unsafe {
//!     invoke(function, &add, |args| {
//!         args.write_at(a, 2i32);
//!         args.write_at(b, 3i32);
//!     }, |ret| ret.read())
//! }?;
//! ```

pub mod error;
pub mod interop;
pub mod logging;

// Re-export core types
pub use error::{FfiError, Result};
pub use interop::{
    invoke, invoke_with_os_error_check, make_trampoline, release_trampoline, Binding,
    CallDescriptor, CallingConvention, CodePtr, LayoutBuilder, LayoutState, Primitive, Slot,
    Trampoline, TypeDescriptor,
};

/// Initialize logging and the trampoline registry
pub fn init() {
    logging::init();
    interop::init();
    tracing::info!(target: "ffi", "dynffi initialized");
}

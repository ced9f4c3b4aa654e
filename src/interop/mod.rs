//! Interoperability - dynamic calls into and out of native code
//!
//! Design: layouts and signatures are built at run time, compiled once into a
//! libffi call interface, then used for any number of calls or callbacks.
//!
//! Architecture:
//! - `types.rs` - Type descriptors (Primitive, TypeDescriptor)
//! - `layout.rs` - Incremental argument/struct layout (LayoutBuilder)
//! - `abi.rs` - Calling convention selection
//! - `call.rs` - Prepared call interfaces and outbound calls
//! - `buffer.rs` - Per-call scratch buffers and raw slots
//! - `trampoline.rs` - Native-callable closures over binding chains
//! - `errno.rs` - Thread-local OS error indicator
//! - `library.rs` - Dynamic library loading (dlopen/LoadLibrary)

mod abi;
mod buffer;
mod call;
pub mod errno;
mod layout;
mod library;
mod trampoline;
mod types;

pub use abi::CallingConvention;
pub use buffer::{ArgumentBuffer, Slot};
pub use call::{invoke, invoke_with_os_error_check, CallDescriptor};
pub use layout::{align_up, LayoutBuilder, LayoutState};
pub use library::{Library, LoadError, SymbolError};
pub use trampoline::{
    live_trampolines, make_trampoline, release_trampoline, walk_chain, BindStep, Binding,
    ReturnHandler, Trampoline,
};
pub use types::{Primitive, TypeDescriptor};

pub use libffi::middle::CodePtr;

use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide interop counters
pub(crate) struct Counters {
    pub(crate) calls: AtomicUsize,
    pub(crate) os_errors: AtomicUsize,
    pub(crate) trampolines_created: AtomicUsize,
    pub(crate) trampoline_invocations: AtomicUsize,
}

pub(crate) static COUNTERS: Counters = Counters {
    calls: AtomicUsize::new(0),
    os_errors: AtomicUsize::new(0),
    trampolines_created: AtomicUsize::new(0),
    trampoline_invocations: AtomicUsize::new(0),
};

/// Initialize interop subsystem
pub fn init() {
    trampoline::init_registry();
}

/// Get interop statistics
pub fn stats() -> InteropStats {
    InteropStats {
        calls_made: COUNTERS.calls.load(Ordering::Relaxed),
        os_errors: COUNTERS.os_errors.load(Ordering::Relaxed),
        trampolines_created: COUNTERS.trampolines_created.load(Ordering::Relaxed),
        trampolines_live: live_trampolines(),
        trampoline_invocations: COUNTERS.trampoline_invocations.load(Ordering::Relaxed),
    }
}

/// Interop statistics for monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteropStats {
    pub calls_made: usize,
    pub os_errors: usize,
    pub trampolines_created: usize,
    pub trampolines_live: usize,
    pub trampoline_invocations: usize,
}

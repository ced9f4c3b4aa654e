//! Native-callable trampolines into managed binding chains
//!
//! A trampoline is a libffi closure whose handler walks a curried chain of
//! binding steps: one `Bind` per native argument, then a `Done` that fills in
//! the return slot. Every invocation starts again from the head of the chain
//! and owns the intermediate nodes it produces, so concurrent and re-entrant
//! calls never share traversal state.
//!
//! Lifetime is caller-directed. The closure, its descriptor and its chain
//! live in a process-wide registry until `release` is called; dropping the
//! handle without releasing it leaks the entry. Nothing detects when native
//! code can no longer reach the function pointer.

use super::abi::check_status;
use super::buffer::Slot;
use super::call::CallDescriptor;
use super::COUNTERS;
use crate::error::{FfiError, Result};
use core::ffi::c_void;
use core::mem;
use core::ptr;
use dashmap::DashMap;
use libffi::middle::CodePtr;
use libffi::raw;
use once_cell::sync::Lazy;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Step applied to one native argument, yielding the rest of the chain
pub type BindStep = Box<dyn Fn(Slot) -> Binding + Send + Sync>;

/// Final step, given the return slot to fill in
pub type ReturnHandler = Box<dyn Fn(Slot) + Send + Sync>;

/// One node of a binding chain
pub enum Binding {
    Bind(BindStep),
    Done(ReturnHandler),
}

impl Binding {
    pub fn bind<F>(step: F) -> Self
    where
        F: Fn(Slot) -> Binding + Send + Sync + 'static,
    {
        Self::Bind(Box::new(step))
    }

    pub fn done<F>(handler: F) -> Self
    where
        F: Fn(Slot) + Send + Sync + 'static,
    {
        Self::Done(Box::new(handler))
    }

    fn tag(&self) -> &'static str {
        match self {
            Self::Bind(_) => "Bind",
            Self::Done(_) => "Done",
        }
    }
}

impl core::fmt::Debug for Binding {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Binding::{}", self.tag())
    }
}

/// Walk `chain` over `args` in order, then hand `ret` to the final handler
///
/// Fails if the chain ends before the arguments do or outlasts them.
pub fn walk_chain<I>(chain: &Binding, args: I, ret: Slot) -> Result<()>
where
    I: IntoIterator<Item = Slot>,
{
    let mut owned: Option<Binding> = None;
    for (index, arg) in args.into_iter().enumerate() {
        let current = owned.as_ref().unwrap_or(chain);
        let next = match current {
            Binding::Bind(step) => step(arg),
            Binding::Done(_) => {
                return Err(FfiError::DesignInvariantViolation {
                    operation: "trampoline",
                    detail: format!("binding chain finished before argument {}", index),
                })
            }
        };
        owned = Some(next);
    }

    match owned.as_ref().unwrap_or(chain) {
        Binding::Done(handler) => {
            handler(ret);
            Ok(())
        }
        Binding::Bind(_) => Err(FfiError::DesignInvariantViolation {
            operation: "trampoline",
            detail: "binding chain expects more arguments than the signature has".into(),
        }),
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Retention registry: every live trampoline's closure, descriptor and chain
static REGISTRY: Lazy<DashMap<u64, ClosureRecord>> = Lazy::new(DashMap::new);

/// Handler state reachable from native code through `user_data`
struct TrampolineContext {
    id: u64,
    /// Holds the `ffi_cif` the closure was prepared against
    _descriptor: Arc<CallDescriptor>,
    chain: Binding,
}

struct ClosureRecord {
    closure: *mut raw::ffi_closure,
    context: Box<TrampolineContext>,
}

// Safety: the closure is only freed from Drop, after the record leaves the
// registry; the context is immutable and its steps are Send + Sync.
unsafe impl Send for ClosureRecord {}
unsafe impl Sync for ClosureRecord {}

impl Drop for ClosureRecord {
    fn drop(&mut self) {
        trace!(target: "trampoline", id = self.context.id, "closure freed");
        // SAFETY: allocated by ffi_closure_alloc and freed exactly once.
        unsafe { raw::ffi_closure_free(self.closure.cast()) }
    }
}

/// Owning handle for a live trampoline
///
/// The handle does not release on drop; call `release` once native code can
/// no longer invoke the function pointer.
#[must_use = "a trampoline must be released explicitly or it leaks"]
#[derive(Debug)]
pub struct Trampoline {
    id: u64,
    code: *mut c_void,
}

// SAFETY: the handle is an id and a code address; all shared state is in the registry.
unsafe impl Send for Trampoline {}
unsafe impl Sync for Trampoline {}

impl Trampoline {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Native entry point
    #[inline]
    pub fn code_ptr(&self) -> CodePtr {
        CodePtr::from_ptr(self.code)
    }

    /// Native entry point as a raw address
    #[inline]
    pub fn as_ptr(&self) -> *const c_void {
        self.code
    }

    /// End the trampoline's lifetime
    ///
    /// Native code must not call the function pointer afterward.
    pub fn release(self) {
        release_trampoline(self)
    }
}

/// Build a native-callable function pointer that runs `chain` on each call
pub fn make_trampoline(descriptor: Arc<CallDescriptor>, chain: Binding) -> Result<Trampoline> {
    let cif = descriptor
        .cif_ptr()
        .ok_or_else(|| FfiError::wrong_state("make_trampoline", descriptor.state()))?;
    let abi = descriptor.abi();
    let arity = descriptor.arity();

    let mut code: *mut c_void = ptr::null_mut();
    // SAFETY: ffi_closure_alloc writes the executable address into `code`.
    let closure = unsafe { raw::ffi_closure_alloc(mem::size_of::<raw::ffi_closure>(), &mut code) }
        .cast::<raw::ffi_closure>();
    if closure.is_null() || code.is_null() {
        return Err(FfiError::OutOfMemory("trampoline closure"));
    }

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let record = ClosureRecord {
        closure,
        context: Box::new(TrampolineContext {
            id,
            _descriptor: descriptor,
            chain,
        }),
    };

    let user_data = ptr::addr_of!(*record.context).cast_mut().cast::<c_void>();
    // SAFETY: `cif` and `user_data` are kept alive by the record, which the
    // registry owns until release; on failure the record frees the closure.
    let status =
        unsafe { raw::ffi_prep_closure_loc(closure, cif, Some(dispatch), user_data, code) };
    check_status(status, abi)?;

    REGISTRY.insert(id, record);
    COUNTERS.trampolines_created.fetch_add(1, Ordering::Relaxed);
    debug!(target: "trampoline", id, arity, code = ?code, "trampoline created");

    Ok(Trampoline { id, code })
}

/// Remove a trampoline from the registry and free its closure
pub fn release_trampoline(trampoline: Trampoline) {
    match REGISTRY.remove(&trampoline.id) {
        Some(_) => debug!(target: "trampoline", id = trampoline.id, "trampoline released"),
        None => error!(target: "trampoline", id = trampoline.id, "trampoline was not registered"),
    }
}

/// Trampolines currently retained
pub fn live_trampolines() -> usize {
    REGISTRY.len()
}

#[cfg(test)]
pub(crate) fn is_registered(id: u64) -> bool {
    REGISTRY.contains_key(&id)
}

pub(crate) fn init_registry() {
    Lazy::force(&REGISTRY);
}

/// Wrap the `arity` argument pointers libffi hands the handler
///
/// A null entry is reported rather than skipped, so later arguments never
/// shift onto the wrong binding step.
///
/// # Safety
/// `args` must point at `arity` readable pointers.
pub(crate) unsafe fn argument_slots(args: *mut *mut c_void, arity: usize) -> Result<Vec<Slot>> {
    (0..arity)
        .map(|index| {
            Slot::new(*args.add(index)).ok_or_else(|| FfiError::DesignInvariantViolation {
                operation: "trampoline",
                detail: format!("native caller passed a null pointer for argument {}", index),
            })
        })
        .collect()
}

/// Fixed native handler shared by every trampoline
unsafe extern "C" fn dispatch(
    cif: *mut raw::ffi_cif,
    ret: *mut c_void,
    args: *mut *mut c_void,
    user_data: *mut c_void,
) {
    let context = &*user_data.cast::<TrampolineContext>();
    let arity = (*cif).nargs as usize;
    COUNTERS.trampoline_invocations.fetch_add(1, Ordering::Relaxed);
    trace!(target: "trampoline", id = context.id, arity, "trampoline invoked");

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let ret = Slot::new(ret).ok_or_else(|| FfiError::DesignInvariantViolation {
            operation: "trampoline",
            detail: "native caller passed a null return slot".into(),
        })?;
        walk_chain(&context.chain, argument_slots(args, arity)?, ret)
    }));

    // Unwinding into the native caller is impossible, so any failure is fatal.
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(target: "trampoline", id = context.id, error = %err, "aborting");
            std::process::abort();
        }
        Err(_) => {
            error!(target: "trampoline", id = context.id, "binding step panicked; aborting");
            std::process::abort();
        }
    }
}

use core::ffi::c_void;
use core::mem;
use dynffi::interop;
use dynffi::{
    invoke, make_trampoline, release_trampoline, Binding, CallDescriptor, CodePtr, Primitive,
};
use std::sync::Arc;
use std::thread;

extern "C" fn add_i32(a: i32, b: i32) -> i32 {
    a + b
}

fn binary_i32() -> Arc<CallDescriptor> {
    let mut descriptor = CallDescriptor::new();
    descriptor.add_element(&Primitive::I32.descriptor()).unwrap();
    descriptor.add_element(&Primitive::I32.descriptor()).unwrap();
    descriptor.prepare(&Primitive::I32.descriptor()).unwrap();
    Arc::new(descriptor)
}

fn curried(op: fn(i32, i32) -> i32) -> Binding {
    Binding::bind(move |a| {
        let a: i32 = unsafe { a.read() };
        Binding::bind(move |b| {
            let b: i32 = unsafe { b.read() };
            Binding::done(move |ret| unsafe { ret.write(op(a, b)) })
        })
    })
}

#[test]
fn test_trampoline_from_many_threads() {
    let trampoline = make_trampoline(binary_i32(), curried(|a, b| a * b)).unwrap();
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { mem::transmute(trampoline.as_ptr()) };

    let handles: Vec<_> = (1..=8)
        .map(|t| {
            thread::spawn(move || {
                for i in 0..200 {
                    assert_eq!(f(t, i), t * i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    release_trampoline(trampoline);
}

#[test]
fn test_reentrant_trampoline() {
    // The handler calls back out to native code before returning
    let descriptor = binary_i32();
    let outbound = Arc::clone(&descriptor);
    let chain = Binding::bind(move |a| {
        let a: i32 = unsafe { a.read() };
        let outbound = Arc::clone(&outbound);
        Binding::bind(move |b| {
            let b: i32 = unsafe { b.read() };
            let outbound = Arc::clone(&outbound);
            Binding::done(move |ret| {
                let sum: i32 = unsafe {
                    invoke(
                        CodePtr::from_ptr(add_i32 as *const c_void),
                        &outbound,
                        |args| {
                            args.write_at(0, a);
                            args.write_at(4, b);
                        },
                        |slot| slot.read(),
                    )
                }
                .unwrap_or(-1);
                unsafe { ret.write(sum * 2) }
            })
        })
    });

    let trampoline = make_trampoline(descriptor, chain).unwrap();
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { mem::transmute(trampoline.as_ptr()) };
    assert_eq!(f(3, 4), 14);
    trampoline.release();
}

#[test]
fn test_release_drops_chain_state() {
    let marker = Arc::new(());
    let held = Arc::clone(&marker);
    let chain = Binding::bind(move |a| {
        let _ = Arc::strong_count(&held);
        let a: i32 = unsafe { a.read() };
        Binding::bind(move |b| {
            let b: i32 = unsafe { b.read() };
            Binding::done(move |ret| unsafe { ret.write(a + b) })
        })
    });

    let trampoline = make_trampoline(binary_i32(), chain).unwrap();
    assert_eq!(Arc::strong_count(&marker), 2);
    trampoline.release();
    assert_eq!(Arc::strong_count(&marker), 1);
}

#[test]
fn test_trampoline_stats() {
    let before = interop::stats();
    let trampoline = make_trampoline(binary_i32(), curried(|a, b| a - b)).unwrap();
    let f: extern "C" fn(i32, i32) -> i32 = unsafe { mem::transmute(trampoline.as_ptr()) };
    assert_eq!(f(9, 4), 5);

    let after = interop::stats();
    assert!(after.trampolines_created > before.trampolines_created);
    assert!(after.trampoline_invocations > before.trampoline_invocations);
    assert!(after.trampolines_live >= 1);
    trampoline.release();
}

#[cfg(unix)]
#[test]
fn test_trampoline_as_qsort_comparator() {
    use dynffi::interop::Library;

    let pointer = Primitive::Pointer.descriptor();
    let mut compare = CallDescriptor::new();
    compare.add_element(&pointer).unwrap();
    compare.add_element(&pointer).unwrap();
    compare.prepare(&Primitive::I32.descriptor()).unwrap();

    let chain = Binding::bind(|a| {
        let a: i32 = unsafe { *a.read::<*const i32>() };
        Binding::bind(move |b| {
            let b: i32 = unsafe { *b.read::<*const i32>() };
            Binding::done(move |ret| unsafe { ret.write(a.cmp(&b) as i32) })
        })
    });
    let comparator = make_trampoline(Arc::new(compare), chain).unwrap();

    let mut sort = CallDescriptor::new();
    let base = sort.add_element(&pointer).unwrap();
    let count = sort.add_element(&Primitive::Usize.descriptor()).unwrap();
    let width = sort.add_element(&Primitive::Usize.descriptor()).unwrap();
    let callback = sort.add_element(&pointer).unwrap();
    sort.prepare(&Primitive::Void.descriptor()).unwrap();

    let libc = Library::open_self().unwrap();
    let qsort = libc.symbol("qsort").unwrap();

    let mut values = [5i32, -3, 12, 0, 7, 7, -40, 1];
    let values_ptr = values.as_mut_ptr();
    let len = values.len();
    unsafe {
        invoke(
            qsort,
            &sort,
            |args| {
                args.write_at(base, values_ptr);
                args.write_at(count, len);
                args.write_at(width, mem::size_of::<i32>());
                args.write_at(callback, comparator.as_ptr());
            },
            |_| (),
        )
    }
    .unwrap();

    assert_eq!(values, [-40, -3, 0, 1, 5, 7, 7, 12]);
    comparator.release();
}

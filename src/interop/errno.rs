//! Thread-local C `errno` access

use core::ffi::c_int;

#[cfg(any(target_os = "linux", target_os = "emscripten", target_os = "redox"))]
unsafe fn location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
unsafe fn location() -> *mut c_int {
    libc::__error()
}

#[cfg(any(target_os = "android", target_os = "netbsd", target_os = "openbsd"))]
unsafe fn location() -> *mut c_int {
    libc::__errno()
}

#[cfg(windows)]
unsafe fn location() -> *mut c_int {
    extern "C" {
        fn _errno() -> *mut c_int;
    }
    _errno()
}

/// Current value of the calling thread's `errno`
#[inline]
pub fn get() -> i32 {
    // SAFETY: the location is valid for the lifetime of the calling thread.
    unsafe { *location() }
}

/// Overwrite the calling thread's `errno`
#[inline]
pub fn set(code: i32) {
    // SAFETY: as for `get`.
    unsafe { *location() = code }
}

//! Dynamic library loading and symbol resolution
//!
//! Platform-agnostic wrapper around dlopen/LoadLibrary, producing the
//! native function addresses that descriptors are invoked against.

use core::ffi::c_void;
use core::ptr::NonNull;
use libffi::middle::CodePtr;
use std::ffi::CString;
use thiserror::Error;
use tracing::debug;

/// Handle to dynamically loaded library
pub struct Library {
    handle: NonNull<c_void>,
    name: String,
    /// False for the running program's own handle on Windows
    #[cfg_attr(not(windows), allow(dead_code))]
    owned: bool,
}

impl Library {
    /// Load library by name or path
    pub fn open(name: &str) -> Result<Self, LoadError> {
        let library = Self::open_impl(Some(name))?;
        debug!(target: "ffi", library = name, "library loaded");
        Ok(library)
    }

    /// Handle to the running program and everything already linked into it
    pub fn open_self() -> Result<Self, LoadError> {
        Self::open_impl(None)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(unix)]
    fn open_impl(name: Option<&str>) -> Result<Self, LoadError> {
        let cname = name
            .map(CString::new)
            .transpose()
            .map_err(|_| LoadError::InvalidName)?;
        let filename = cname.as_ref().map_or(core::ptr::null(), |c| c.as_ptr());

        unsafe {
            let handle = libc::dlopen(filename, libc::RTLD_NOW);
            NonNull::new(handle)
                .map(|handle| Self {
                    handle,
                    name: name.unwrap_or("<self>").to_owned(),
                    owned: true,
                })
                .ok_or_else(|| LoadError::LoadFailed(last_dl_error()))
        }
    }

    #[cfg(windows)]
    fn open_impl(name: Option<&str>) -> Result<Self, LoadError> {
        use std::ffi::OsStr;
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::errhandlingapi::GetLastError;
        use winapi::um::libloaderapi::{GetModuleHandleW, LoadLibraryW};

        unsafe {
            let handle = match name {
                Some(name) => {
                    let wide: Vec<u16> = OsStr::new(name).encode_wide().chain(Some(0)).collect();
                    LoadLibraryW(wide.as_ptr())
                }
                None => GetModuleHandleW(core::ptr::null()),
            };
            NonNull::new(handle.cast::<c_void>())
                .map(|handle| Self {
                    handle,
                    name: name.unwrap_or("<self>").to_owned(),
                    owned: name.is_some(),
                })
                .ok_or_else(|| LoadError::LoadFailed(format!("Error code: {}", GetLastError())))
        }
    }

    /// Get function pointer by symbol name
    pub fn symbol(&self, name: &str) -> Result<CodePtr, SymbolError> {
        let cname = CString::new(name).map_err(|_| SymbolError::InvalidName)?;
        let ptr = self.symbol_impl(&cname);
        if ptr.is_null() {
            Err(SymbolError::NotFound(name.to_owned()))
        } else {
            Ok(CodePtr::from_ptr(ptr))
        }
    }

    #[cfg(unix)]
    fn symbol_impl(&self, name: &CString) -> *mut c_void {
        unsafe { libc::dlsym(self.handle.as_ptr(), name.as_ptr()) }
    }

    #[cfg(windows)]
    fn symbol_impl(&self, name: &CString) -> *mut c_void {
        use winapi::um::libloaderapi::GetProcAddress;

        unsafe { GetProcAddress(self.handle.as_ptr().cast(), name.as_ptr()).cast() }
    }
}

impl Drop for Library {
    #[cfg(unix)]
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle.as_ptr());
        }
    }

    #[cfg(windows)]
    fn drop(&mut self) {
        use winapi::um::libloaderapi::FreeLibrary;

        // Module handles from GetModuleHandleW are not reference counted.
        if self.owned {
            unsafe {
                FreeLibrary(self.handle.as_ptr().cast());
            }
        }
    }
}

unsafe impl Send for Library {}
unsafe impl Sync for Library {}

impl core::fmt::Debug for Library {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Library").field("name", &self.name).finish()
    }
}

#[cfg(unix)]
fn last_dl_error() -> String {
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "Unknown error".into()
        } else {
            std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Library loading errors
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Invalid library name")]
    InvalidName,
    #[error("Failed to load library: {0}")]
    LoadFailed(String),
}

/// Symbol lookup errors
#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("Invalid symbol name")]
    InvalidName,
    #[error("Symbol not found: {0}")]
    NotFound(String),
}

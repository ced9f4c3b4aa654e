//! ABI (Application Binary Interface) selection
//!
//! libffi owns the per-platform calling-convention knowledge; this module
//! only picks which of its conventions a call interface is prepared for and
//! maps libffi's status codes onto `FfiError`.

use crate::error::{FfiError, Result};
use libffi::raw;

/// Calling convention a call interface is prepared for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    /// libffi's `FFI_DEFAULT_ABI` for the target (C calling convention)
    #[default]
    Default,
    /// A numeric libffi ABI tag, e.g. `FFI_WIN64` on x86-64
    Raw(u32),
}

impl CallingConvention {
    /// libffi ABI tag for this convention
    #[inline]
    pub fn as_raw(self) -> raw::ffi_abi {
        match self {
            Self::Default => raw::ffi_abi_FFI_DEFAULT_ABI,
            Self::Raw(tag) => tag as raw::ffi_abi,
        }
    }
}

/// Translate a libffi status into the crate's error taxonomy
pub(crate) fn check_status(status: raw::ffi_status, abi: raw::ffi_abi) -> Result<()> {
    match status {
        raw::ffi_status_FFI_OK => Ok(()),
        raw::ffi_status_FFI_BAD_ABI => Err(FfiError::BadAbi(abi as u32)),
        _ => Err(FfiError::BadCallingConvention),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_convention() {
        assert_eq!(CallingConvention::default(), CallingConvention::Default);
        assert_eq!(
            CallingConvention::Default.as_raw(),
            raw::ffi_abi_FFI_DEFAULT_ABI
        );
    }

    #[test]
    fn test_status_mapping() {
        let abi = CallingConvention::Default.as_raw();
        assert!(check_status(raw::ffi_status_FFI_OK, abi).is_ok());
        assert!(matches!(
            check_status(raw::ffi_status_FFI_BAD_TYPEDEF, abi),
            Err(FfiError::BadCallingConvention)
        ));
        assert!(matches!(
            check_status(raw::ffi_status_FFI_BAD_ABI, abi),
            Err(FfiError::BadAbi(_))
        ));
    }
}

//! # OSAL Errors
//!
//! One closed error taxonomy shared by every primitive, and the translator
//! that folds backend-native result codes into it.
//!
//! Success is `Ok(..)`; every failure is one of the [`OsalError`] kinds. No
//! operation retries on its own: a `Timeout` or `Resource` goes straight
//! back to the caller.

use core::fmt;

use crate::port::PortError;

/// Result type for OSAL operations
pub type OsalResult<T> = Result<T, OsalError>;

/// OSAL errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsalError {
    /// Generic or backend-specific failure
    Fail,
    /// A blocking operation's deadline elapsed first
    Timeout,
    /// Well-formed, but currently inadmissible
    Resource,
    /// Malformed handle, reserved bits, out-of-range value
    InvalidArg,
    /// Not allowed from interrupt context
    Isr,
}

impl OsalError {
    /// Numeric code of a successful operation
    pub const OK_CODE: i32 = 0;

    /// Stable numeric code for this error
    pub const fn code(self) -> i32 {
        match self {
            OsalError::Fail => -1,
            OsalError::Timeout => -2,
            OsalError::Resource => -3,
            OsalError::InvalidArg => -4,
            OsalError::Isr => -6,
        }
    }

    /// Inverse of [`code`](Self::code)
    pub const fn from_code(code: i32) -> OsalResult<()> {
        match code {
            0 => Ok(()),
            -2 => Err(OsalError::Timeout),
            -3 => Err(OsalError::Resource),
            -4 => Err(OsalError::InvalidArg),
            -6 => Err(OsalError::Isr),
            _ => Err(OsalError::Fail),
        }
    }
}

impl fmt::Display for OsalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            OsalError::Fail => "generic failure",
            OsalError::Timeout => "timed out",
            OsalError::Resource => "resource not available",
            OsalError::InvalidArg => "invalid argument",
            OsalError::Isr => "not allowed in interrupt context",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for OsalError {}

/// Native status codes in the CMSIS-RTOS2 numbering most RTOS ports use.
pub mod native {
    /// Operation completed successfully
    pub const OK: i32 = 0;
    /// Unspecified error
    pub const ERROR: i32 = -1;
    /// Timeout expired
    pub const ERROR_TIMEOUT: i32 = -2;
    /// Resource not available
    pub const ERROR_RESOURCE: i32 = -3;
    /// Parameter error
    pub const ERROR_PARAMETER: i32 = -4;
    /// Out of memory
    pub const ERROR_NO_MEMORY: i32 = -5;
    /// Not allowed in ISR context
    pub const ERROR_ISR: i32 = -6;

    /// Flag-returning calls report errors with the top bit set
    pub const FLAGS_ERROR: u32 = 0x8000_0000;
}

/// Map a native status code into the taxonomy.
#[inline]
pub fn status_to_result(status: i32) -> OsalResult<()> {
    match status {
        native::OK => Ok(()),
        native::ERROR_TIMEOUT => Err(OsalError::Timeout),
        native::ERROR_RESOURCE => Err(OsalError::Resource),
        native::ERROR_PARAMETER => Err(OsalError::InvalidArg),
        native::ERROR_ISR => Err(OsalError::Isr),
        // no-memory and anything unknown collapse to FAIL
        _ => Err(OsalError::Fail),
    }
}

/// Map the result of a flag-returning native call.
///
/// Values with [`native::FLAGS_ERROR`] set carry a negated status code in
/// the low bits; anything else is the flag word itself.
#[inline]
pub fn flags_to_result(value: u32) -> OsalResult<u32> {
    if value & native::FLAGS_ERROR == 0 {
        return Ok(value);
    }
    match status_to_result(value as i32) {
        Ok(()) => Err(OsalError::Fail),
        Err(e) => Err(e),
    }
}

impl From<PortError> for OsalError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::UnknownThread => OsalError::Fail,
            PortError::NotSupported => OsalError::Fail,
            PortError::Native(code) => match status_to_result(code) {
                Ok(()) => OsalError::Fail,
                Err(e) => e,
            },
        }
    }
}

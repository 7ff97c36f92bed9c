//! Host interface error codes
//!
//! Every call into the host interface yields either a success payload or one
//! of these codes. The numeric values follow the libusb error convention so
//! they can be handed straight back to an OS-backend caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes reported by the host interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum HostError {
    /// Input/output error
    #[error("Input/output error")]
    Io,

    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam,

    /// Access denied (insufficient permissions)
    #[error("Access denied")]
    Access,

    /// No such device (it may have been disconnected)
    #[error("No such device")]
    NoDevice,

    /// Entity not found
    #[error("Entity not found")]
    NotFound,

    /// Resource busy
    #[error("Resource busy")]
    Busy,

    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,

    /// Device sent more data than requested
    #[error("Overflow")]
    Overflow,

    /// Endpoint stalled
    #[error("Pipe error")]
    Pipe,

    /// Operation interrupted (cancelled)
    #[error("Interrupted")]
    Interrupted,

    /// Buffer allocation failed
    #[error("Insufficient memory")]
    NoMem,

    /// Capability not offered by the host
    #[error("Operation not supported")]
    NotSupported,

    /// Anything the host could not classify
    #[error("Other error")]
    Other,
}

impl HostError {
    /// Convert a raw libusb error value into a `HostError`.
    ///
    /// Unknown codes collapse into [`HostError::Other`].
    pub fn from_raw(value: i32) -> Self {
        match value {
            -1 => HostError::Io,
            -2 => HostError::InvalidParam,
            -3 => HostError::Access,
            -4 => HostError::NoDevice,
            -5 => HostError::NotFound,
            -6 => HostError::Busy,
            -7 => HostError::Timeout,
            -8 => HostError::Overflow,
            -9 => HostError::Pipe,
            -10 => HostError::Interrupted,
            -11 => HostError::NoMem,
            -12 => HostError::NotSupported,
            _ => HostError::Other,
        }
    }

    /// Raw (negative) libusb error value
    pub fn code(self) -> i32 {
        match self {
            HostError::Io => -1,
            HostError::InvalidParam => -2,
            HostError::Access => -3,
            HostError::NoDevice => -4,
            HostError::NotFound => -5,
            HostError::Busy => -6,
            HostError::Timeout => -7,
            HostError::Overflow => -8,
            HostError::Pipe => -9,
            HostError::Interrupted => -10,
            HostError::NoMem => -11,
            HostError::NotSupported => -12,
            HostError::Other => -99,
        }
    }
}

/// Type alias for host interface results
pub type HostResult<T> = std::result::Result<T, HostError>;

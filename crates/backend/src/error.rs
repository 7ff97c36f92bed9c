//! Bridge error types
//!
//! Errors fall into four groups: contract violations (the caller misused a
//! handle or a transfer's state machine), device-level failures forwarded
//! from the host, unsupported capabilities, and invalid arguments. Contract
//! violations never change registry or transfer state.

use crate::engine::TransferState;
use host::HostError;
use thiserror::Error;

/// Caller misuse of the bridge's handles or state machines
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// Handle was never issued or has already been released
    #[error("{kind} handle not found (stale or already released)")]
    NotFound { kind: &'static str },

    /// Transfer was already submitted
    #[error("transfer already submitted")]
    Busy,

    /// A second await on a transfer that is already being awaited
    #[error("transfer is already being awaited")]
    AlreadyAwaiting,

    /// Operation not valid in the transfer's current state
    #[error("cannot {operation} a transfer in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TransferState,
    },

    /// Destroying a transfer that is still in flight
    #[error("transfer is still in flight; cancel and await it first")]
    TransferInFlight,

    /// Closing a handle that still has transfers in flight
    #[error("device handle still has transfers in flight")]
    HandleBusy,
}

impl ContractViolation {
    fn code(&self) -> i32 {
        match self {
            ContractViolation::NotFound { .. } => HostError::NotFound.code(),
            ContractViolation::Busy
            | ContractViolation::AlreadyAwaiting
            | ContractViolation::HandleBusy => HostError::Busy.code(),
            ContractViolation::InvalidState { .. } | ContractViolation::TransferInFlight => {
                HostError::InvalidParam.code()
            }
        }
    }
}

/// Error returned by every bridge operation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),

    /// The device left; only cleanup operations are still accepted
    #[error("device disconnected")]
    DeviceDisconnected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Capability absent from the host interface
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("host error: {0}")]
    Host(#[from] HostError),
}

impl BackendError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BackendError::InvalidArgument(message.into())
    }

    pub fn not_found(kind: &'static str) -> Self {
        BackendError::Contract(ContractViolation::NotFound { kind })
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(self, BackendError::Contract(_))
    }

    /// Negative libusb-style return code
    pub fn code(&self) -> i32 {
        match self {
            BackendError::Contract(violation) => violation.code(),
            BackendError::DeviceDisconnected => HostError::NoDevice.code(),
            BackendError::InvalidArgument(_) => HostError::InvalidParam.code(),
            BackendError::Unsupported(_) => HostError::NotSupported.code(),
            BackendError::Host(error) => error.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;

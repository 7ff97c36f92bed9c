//! Transfer lifecycle engine
//!
//! Every transfer moves through `Created -> Submitted -> {Completed,
//! Cancelled, Errored}`. The host's [`Completion`] for a submitted transfer
//! lives in its record until either an await takes it out or the
//! event-processing step finds it resolved.

use crate::error::{BackendError, ContractViolation, Result};
use crate::registry::{HandleId, TransferId};
use bytes::Bytes;
use host::{
    Completion, HostError, HostResult, SETUP_PACKET_SIZE, SetupPacket, TransferKind,
    TransferOptions, TransferRequest,
};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Largest buffer a control transfer can describe (`wLength`)
pub const MAX_CONTROL_BUFFER: u32 = 0xFFFF;

/// Lifecycle state of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TransferState {
    Created,
    Submitted,
    Completed,
    Cancelled,
    Errored,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Errored
        )
    }
}

/// Completion status of a terminal transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Success,
    /// Endpoint halted (STALL)
    Stall,
    TimedOut,
    NoDevice,
    Overflow,
    Cancelled,
    /// Any other host failure
    Error(HostError),
}

/// Result of a terminal transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub state: TransferState,
    pub status: TransferStatus,
    /// Received bytes for IN transfers; empty otherwise
    pub data: Bytes,
    /// IN transfer returned fewer bytes than requested
    pub short: bool,
}

impl TransferOutcome {
    pub fn actual_length(&self) -> usize {
        self.data.len()
    }

    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Success
    }

    fn failed(state: TransferState, status: TransferStatus) -> Self {
        Self {
            state,
            status,
            data: Bytes::new(),
            short: false,
        }
    }
}

/// Transfer finished by the event-processing step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub id: TransferId,
    pub state: TransferState,
    pub status: TransferStatus,
    pub actual_length: usize,
    pub short: bool,
}

impl CompletedTransfer {
    pub fn new(id: TransferId, outcome: &TransferOutcome) -> Self {
        Self {
            id,
            state: outcome.state,
            status: outcome.status,
            actual_length: outcome.actual_length(),
            short: outcome.short,
        }
    }
}

/// libusb-shaped transfer description
///
/// For control transfers the buffer starts with the 8-byte setup packet and
/// the data stage follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransfer {
    pub kind: TransferKind,
    pub endpoint: u8,
    pub timeout_ms: u32,
    pub stream_id: u32,
    pub iso_packets: u32,
    pub buffer: Vec<u8>,
}

impl RawTransfer {
    /// Split into a transfer request and the OUT payload to submit
    pub fn decode(&self) -> Result<(TransferRequest, &[u8])> {
        let options = TransferOptions {
            endpoint: self.endpoint,
            timeout_ms: self.timeout_ms,
            stream_id: self.stream_id,
            iso_packets: self.iso_packets,
        };

        let (request, payload) = match self.kind {
            TransferKind::Control => {
                let packet = SetupPacket::decode(&self.buffer).ok_or_else(|| {
                    BackendError::invalid_argument(format!(
                        "control buffer of {} bytes has no setup packet",
                        self.buffer.len()
                    ))
                })?;
                let data_stage = &self.buffer[SETUP_PACKET_SIZE..];
                let length = packet.w_length as usize;
                if length > data_stage.len() {
                    return Err(BackendError::invalid_argument(format!(
                        "wLength {} exceeds the {} byte data stage",
                        length,
                        data_stage.len()
                    )));
                }

                let request = TransferRequest {
                    kind: TransferKind::Control,
                    setup: Some(packet.setup),
                    buffer_size: u32::from(packet.w_length),
                    options,
                };
                (request, &data_stage[..length])
            }
            kind => {
                let buffer_size = u32::try_from(self.buffer.len())
                    .map_err(|_| BackendError::invalid_argument("transfer buffer too large"))?;
                let request = TransferRequest {
                    kind,
                    setup: None,
                    buffer_size,
                    options,
                };
                (request, self.buffer.as_slice())
            }
        };

        let payload = if request.is_in() { &[][..] } else { payload };
        Ok((request, payload))
    }
}

/// Check a transfer description before any host resource is allocated
pub fn validate_request(request: &TransferRequest) -> Result<()> {
    match request.kind {
        TransferKind::Control => {
            if request.setup.is_none() {
                return Err(BackendError::invalid_argument(
                    "control transfer requires a setup record",
                ));
            }
            if request.buffer_size > MAX_CONTROL_BUFFER {
                return Err(BackendError::invalid_argument(format!(
                    "control buffer of {} bytes exceeds {}",
                    request.buffer_size, MAX_CONTROL_BUFFER
                )));
            }
        }
        TransferKind::Isochronous if request.options.iso_packets == 0 => {
            return Err(BackendError::invalid_argument(
                "isochronous transfer requires at least one packet",
            ));
        }
        TransferKind::BulkStream if request.options.stream_id == 0 => {
            return Err(BackendError::invalid_argument(
                "bulk stream transfer requires a non-zero stream id",
            ));
        }
        _ => {}
    }
    Ok(())
}

/// Translate a host completion into a terminal outcome
pub fn map_result(
    request: &TransferRequest,
    cancel_requested: bool,
    result: HostResult<Vec<u8>>,
) -> TransferOutcome {
    match result {
        Ok(data) if data.len() > request.buffer_size as usize => {
            TransferOutcome::failed(TransferState::Errored, TransferStatus::Overflow)
        }
        Ok(data) => {
            let short = request.is_in() && data.len() < request.buffer_size as usize;
            TransferOutcome {
                state: TransferState::Completed,
                status: TransferStatus::Success,
                data: Bytes::from(data),
                short,
            }
        }
        Err(HostError::Interrupted) => {
            TransferOutcome::failed(TransferState::Cancelled, TransferStatus::Cancelled)
        }
        Err(_) if cancel_requested => {
            TransferOutcome::failed(TransferState::Cancelled, TransferStatus::Cancelled)
        }
        Err(HostError::Pipe) => {
            TransferOutcome::failed(TransferState::Completed, TransferStatus::Stall)
        }
        Err(HostError::Timeout) => {
            TransferOutcome::failed(TransferState::Errored, TransferStatus::TimedOut)
        }
        Err(HostError::NoDevice) => {
            TransferOutcome::failed(TransferState::Errored, TransferStatus::NoDevice)
        }
        Err(HostError::Overflow) => {
            TransferOutcome::failed(TransferState::Errored, TransferStatus::Overflow)
        }
        Err(error) => TransferOutcome::failed(TransferState::Errored, TransferStatus::Error(error)),
    }
}

/// What an await finds when it starts
pub enum AwaitStart {
    /// Transfer already terminal
    Ready(TransferOutcome),
    /// Completion handed to the awaiting caller
    Pending(Completion),
}

/// One transfer and its lifecycle bookkeeping
pub struct TransferRecord<T> {
    pub resource: T,
    pub handle: HandleId,
    pub request: TransferRequest,
    state: TransferState,
    completion: Option<Completion>,
    awaiting: bool,
    cancel_requested: bool,
    outcome: Option<TransferOutcome>,
}

impl<T> TransferRecord<T> {
    pub fn new(resource: T, handle: HandleId, request: TransferRequest) -> Self {
        Self {
            resource,
            handle,
            request,
            state: TransferState::Created,
            completion: None,
            awaiting: false,
            cancel_requested: false,
            outcome: None,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn outcome(&self) -> Option<&TransferOutcome> {
        self.outcome.as_ref()
    }

    /// Check that the transfer may be submitted with `data`
    pub fn check_submit(&self, data: &[u8]) -> Result<()> {
        if self.state != TransferState::Created {
            return Err(ContractViolation::Busy.into());
        }
        if self.request.is_in() {
            if !data.is_empty() {
                return Err(BackendError::invalid_argument(
                    "IN transfer takes no OUT payload",
                ));
            }
        } else if data.len() > self.request.buffer_size as usize {
            return Err(BackendError::invalid_argument(format!(
                "payload of {} bytes exceeds the {} byte buffer",
                data.len(),
                self.request.buffer_size
            )));
        }
        Ok(())
    }

    pub fn mark_submitted(&mut self, completion: Completion) {
        self.state = TransferState::Submitted;
        self.completion = Some(completion);
    }

    /// Start an await; at most one may be outstanding
    pub fn begin_await(&mut self) -> Result<AwaitStart> {
        match self.state {
            TransferState::Created => Err(ContractViolation::InvalidState {
                operation: "await",
                state: self.state,
            }
            .into()),
            TransferState::Submitted => {
                if self.awaiting {
                    return Err(ContractViolation::AlreadyAwaiting.into());
                }
                let completion = self
                    .completion
                    .take()
                    .ok_or(ContractViolation::AlreadyAwaiting)?;
                self.awaiting = true;
                Ok(AwaitStart::Pending(completion))
            }
            _ => match &self.outcome {
                Some(outcome) => Ok(AwaitStart::Ready(outcome.clone())),
                None => Err(ContractViolation::InvalidState {
                    operation: "await",
                    state: self.state,
                }
                .into()),
            },
        }
    }

    /// Hand the completion back after an abandoned await
    pub fn abandon_await(&mut self, completion: Completion) {
        self.awaiting = false;
        if self.state == TransferState::Submitted {
            self.completion = Some(completion);
        }
    }

    /// Record the host's result and move to the terminal state
    pub fn finish(&mut self, result: HostResult<Vec<u8>>) -> TransferOutcome {
        let outcome = map_result(&self.request, self.cancel_requested, result);
        self.state = outcome.state;
        self.completion = None;
        self.awaiting = false;
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Finish the transfer if its completion has resolved
    ///
    /// Transfers being awaited are left to their awaiting caller.
    pub fn try_complete(&mut self) -> Option<TransferOutcome> {
        if self.state != TransferState::Submitted || self.awaiting {
            return None;
        }
        let result = self.completion.as_mut()?.try_take()?;
        Some(self.finish(result))
    }

    /// Poll the stored completion, registering the task's waker
    pub fn poll_complete(&mut self, cx: &mut Context<'_>) -> Poll<TransferOutcome> {
        if self.state != TransferState::Submitted || self.awaiting {
            return Poll::Pending;
        }
        let Some(completion) = self.completion.as_mut() else {
            return Poll::Pending;
        };
        match Pin::new(completion).poll(cx) {
            Poll::Ready(result) => Poll::Ready(self.finish(result)),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Check that a cancel may be forwarded to the host
    pub fn check_cancel(&self) -> Result<()> {
        if self.state != TransferState::Submitted {
            return Err(ContractViolation::InvalidState {
                operation: "cancel",
                state: self.state,
            }
            .into());
        }
        Ok(())
    }

    pub fn mark_cancel_requested(&mut self) {
        self.cancel_requested = true;
    }

    /// Check that the record may be released
    pub fn check_destroy(&self) -> Result<()> {
        if self.state == TransferState::Submitted {
            return Err(ContractViolation::TransferInFlight.into());
        }
        Ok(())
    }
}

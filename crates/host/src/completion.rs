//! Asynchronous transfer completion
//!
//! A submitted transfer is represented on the caller's side by a
//! [`Completion`] future. The host keeps the matching [`Completer`] and
//! resolves it exactly once, from whichever thread finishes the transfer.
//! Cancellation and normal completion race through the same slot, so the
//! first one to arrive wins and the other becomes a no-op.

use crate::error::{HostError, HostResult};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

type Slot = Arc<Mutex<Option<oneshot::Sender<HostResult<Vec<u8>>>>>>;

/// Host side of a pending transfer
#[derive(Clone)]
pub struct Completer {
    slot: Slot,
}

impl Completer {
    /// Resolve the transfer
    ///
    /// Returns `false` when the transfer was already resolved or its
    /// [`Completion`] is gone.
    pub fn complete(&self, result: HostResult<Vec<u8>>) -> bool {
        let sender = match self.slot.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        match sender {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    /// Whether the transfer has already been resolved
    pub fn is_resolved(&self) -> bool {
        match self.slot.lock() {
            Ok(slot) => slot.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Caller side of a pending transfer
///
/// Resolves to the received bytes (empty for OUT transfers) or the host
/// error that ended the transfer. A host that drops every [`Completer`]
/// without resolving it yields [`HostError::Io`].
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<HostResult<Vec<u8>>>,
}

impl Completion {
    /// Non-blocking check used by the event-processing step
    pub fn try_take(&mut self) -> Option<HostResult<Vec<u8>>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(HostError::Io)),
        }
    }
}

impl Future for Completion {
    type Output = HostResult<Vec<u8>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(HostError::Io)))
    }
}

/// Create a connected completer/completion pair
pub fn completion_pair() -> (Completer, Completion) {
    let (tx, rx) = oneshot::channel();
    (
        Completer {
            slot: Arc::new(Mutex::new(Some(tx))),
        },
        Completion { rx },
    )
}

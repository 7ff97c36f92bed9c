//! Blocking transfer execution
//!
//! rusb exposes control, bulk and interrupt transfers as blocking calls.
//! Each submitted transfer runs one of them on its own thread and reports
//! the result through the transfer's [`Completer`].
//!
//! The blocking call is issued in slices of at most [`TRANSFER_SLICE`]. Between
//! slices the thread drops its read guard on the handle and checks the
//! transfer's cancel flag, so a cancelled transfer stops within one slice even
//! when its own timeout is infinite. A slice that times out after moving part
//! of its data loses that part: libusb reports only the timeout.

use host::{Completer, HostError, HostResult, TransferKind, TransferRequest};
use rusb::{Context, DeviceHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest single blocking call a transfer thread makes
pub const TRANSFER_SLICE: Duration = Duration::from_millis(100);

/// Run `request` on a dedicated thread and resolve `completer` with the result
pub fn spawn_transfer(
    handle: Arc<RwLock<DeviceHandle<Context>>>,
    request: TransferRequest,
    data: Vec<u8>,
    cancel: Arc<AtomicBool>,
    completer: Completer,
) -> HostResult<()> {
    std::thread::Builder::new()
        .name("usb-transfer".to_string())
        .spawn(move || {
            let result = execute_transfer(&handle, &request, data, &cancel);
            if !completer.complete(result) {
                debug!("Transfer result discarded (cancelled or abandoned)");
            }
        })
        .map(|_| ())
        .map_err(|e| {
            warn!("Failed to spawn transfer thread: {}", e);
            HostError::NoMem
        })
}

/// Repeat `attempt` in bounded slices until it finishes, `timeout` runs out
/// or `cancel` is raised
///
/// A zero timeout waits forever. Slice timeouts are retried; any other error
/// ends the transfer.
pub fn run_sliced<F>(timeout: Duration, cancel: &AtomicBool, mut attempt: F) -> HostResult<usize>
where
    F: FnMut(Duration) -> rusb::Result<usize>,
{
    let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

    loop {
        if cancel.load(Ordering::Acquire) {
            return Err(HostError::Interrupted);
        }

        let slice = match deadline {
            None => TRANSFER_SLICE,
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(HostError::Timeout);
                }
                remaining.min(TRANSFER_SLICE)
            }
        };

        match attempt(slice) {
            Ok(len) => return Ok(len),
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return Err(map_rusb_error(e)),
        }
    }
}

/// Execute a transfer and return the received bytes (empty for OUT)
///
/// A zero timeout waits forever, or until `cancel` is raised.
pub fn execute_transfer(
    handle: &RwLock<DeviceHandle<Context>>,
    request: &TransferRequest,
    data: Vec<u8>,
    cancel: &AtomicBool,
) -> HostResult<Vec<u8>> {
    let timeout = Duration::from_millis(u64::from(request.options.timeout_ms));
    let endpoint = request.options.endpoint;
    let is_in = request.is_in();
    let mut buffer = if is_in {
        vec![0u8; request.buffer_size as usize]
    } else {
        Vec::new()
    };

    debug!(
        "{:?} transfer: endpoint={:#04x}, in={}, buffer={}, payload={}, timeout={}ms",
        request.kind,
        endpoint,
        is_in,
        request.buffer_size,
        data.len(),
        timeout.as_millis()
    );

    let setup = match request.kind {
        TransferKind::Control => Some(request.setup.ok_or(HostError::InvalidParam)?),
        TransferKind::Bulk | TransferKind::Interrupt => None,
        TransferKind::Isochronous | TransferKind::BulkStream => {
            return Err(HostError::NotSupported);
        }
    };

    let result = run_sliced(timeout, cancel, |slice| {
        let handle = handle.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        match (setup, is_in) {
            (Some(setup), true) => handle.read_control(
                setup.bm_request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                &mut buffer,
                slice,
            ),
            (Some(setup), false) => handle.write_control(
                setup.bm_request_type,
                setup.b_request,
                setup.w_value,
                setup.w_index,
                &data,
                slice,
            ),
            (None, true) if request.kind == TransferKind::Bulk => {
                handle.read_bulk(endpoint, &mut buffer, slice)
            }
            (None, false) if request.kind == TransferKind::Bulk => {
                handle.write_bulk(endpoint, &data, slice)
            }
            (None, true) => handle.read_interrupt(endpoint, &mut buffer, slice),
            (None, false) => handle.write_interrupt(endpoint, &data, slice),
        }
    });

    match result {
        Ok(len) => {
            debug!("{:?} transfer succeeded: {} bytes", request.kind, len);
            if is_in {
                buffer.truncate(len);
                Ok(buffer)
            } else {
                Ok(Vec::new())
            }
        }
        Err(e) => {
            debug!("{:?} transfer ended: {}", request.kind, e);
            Err(e)
        }
    }
}

/// Map rusb::Error to the host error enumeration
pub fn map_rusb_error(err: rusb::Error) -> HostError {
    match err {
        rusb::Error::Io => HostError::Io,
        rusb::Error::InvalidParam => HostError::InvalidParam,
        rusb::Error::Access => HostError::Access,
        rusb::Error::NoDevice => HostError::NoDevice,
        rusb::Error::NotFound => HostError::NotFound,
        rusb::Error::Busy => HostError::Busy,
        rusb::Error::Timeout => HostError::Timeout,
        rusb::Error::Overflow => HostError::Overflow,
        rusb::Error::Pipe => HostError::Pipe,
        rusb::Error::Interrupted => HostError::Interrupted,
        rusb::Error::NoMem => HostError::NoMem,
        rusb::Error::NotSupported => HostError::NotSupported,
        _ => HostError::Other,
    }
}

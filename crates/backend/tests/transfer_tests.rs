//! Transfer engine integration tests
//!
//! Drives transfers through the backend facade against the scripted mock
//! host:
//! - Submit/await for control, bulk and interrupt transfers
//! - Status mapping (short reads, stalls, timeouts, overflow)
//! - Cancellation and the single-await rule
//! - Event processing for transfers nobody awaits
//!
//! Run with: `cargo test -p backend --test transfer_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockHost, MockResponse, MockStats, create_mock_bulk_data,
    create_mock_device_descriptor, create_mock_device_info, create_mock_setup_packet,
    with_timeout,
};
use host::{HostError, TransferKind, TransferOptions, TransferSetup};
use std::sync::Arc;
use std::time::Duration;
use usb_bridge::{
    Backend, BackendError, BackendSettings, ContractViolation, HandleId, RawTransfer,
    TransferState, TransferStatus,
};

const GET_DEVICE_DESCRIPTOR: TransferSetup = TransferSetup {
    bm_request_type: 0x80,
    b_request: 0x06,
    w_value: 0x0100,
    w_index: 0,
};

fn open_backend() -> (Arc<MockHost>, Backend<MockHost>, HandleId) {
    let host = Arc::new(MockHost::new());
    host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));

    let backend = Backend::new(Arc::clone(&host), BackendSettings::default());
    backend.init().unwrap();
    let device = backend.get_device_list().unwrap()[0];
    let handle = backend.open(device).unwrap();
    (host, backend, handle)
}

fn bulk(endpoint: u8) -> TransferOptions {
    TransferOptions {
        endpoint,
        timeout_ms: 1000,
        ..Default::default()
    }
}

// ============================================================================
// Submit and await
// ============================================================================

#[tokio::test]
async fn test_get_descriptor_short_read() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Complete(Ok(create_mock_device_descriptor())));

    let transfer = backend
        .new_transfer(
            handle,
            TransferKind::Control,
            Some(GET_DEVICE_DESCRIPTOR),
            64,
            TransferOptions::default(),
        )
        .unwrap();
    assert_eq!(backend.transfer_state(transfer).unwrap(), TransferState::Created);

    backend.submit_transfer(transfer, &[]).unwrap();
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, backend.await_transfer(transfer))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.state, TransferState::Completed);
    assert_eq!(outcome.status, TransferStatus::Success);
    assert_eq!(outcome.actual_length(), 18);
    assert!(outcome.short);
    assert_eq!(outcome.data[0], 18);
    assert_eq!(outcome.data[1], 0x01);

    backend.destroy_transfer(transfer).unwrap();
    assert_eq!(
        MockStats::get(&host.stats().transfers_freed),
        MockStats::get(&host.stats().transfers_allocated)
    );
}

#[tokio::test]
async fn test_bulk_out_sends_payload() {
    let (host, backend, handle) = open_backend();
    let payload = create_mock_bulk_data(512);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 512, bulk(0x02))
        .unwrap();
    backend.submit_transfer(transfer, &payload).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();

    assert!(outcome.is_success());
    assert!(!outcome.short);
    assert_eq!(host.out_data(), vec![payload]);
}

#[tokio::test]
async fn test_interrupt_in_fills_buffer() {
    let (_host, backend, handle) = open_backend();

    let transfer = backend
        .new_transfer(handle, TransferKind::Interrupt, None, 8, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.actual_length(), 8);
    assert!(!outcome.short);
}

#[tokio::test]
async fn test_await_after_completion_returns_stored_outcome() {
    let (_host, backend, handle) = open_backend();
    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    let first = backend.await_transfer(transfer).await.unwrap();
    let second = backend.await_transfer(transfer).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.transfer_outcome(transfer).unwrap(), Some(first));
}

// ============================================================================
// Status mapping
// ============================================================================

#[tokio::test]
async fn test_stall_completes_with_stall_status() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Complete(Err(HostError::Pipe)));

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 64, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();

    assert_eq!(outcome.state, TransferState::Completed);
    assert_eq!(outcome.status, TransferStatus::Stall);
    assert_eq!(outcome.actual_length(), 0);
}

#[tokio::test]
async fn test_timeout_is_terminal_and_destroyable() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Complete(Err(HostError::Timeout)));

    let transfer = backend
        .new_transfer(handle, TransferKind::Interrupt, None, 8, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();

    assert_eq!(outcome.state, TransferState::Errored);
    assert_eq!(outcome.status, TransferStatus::TimedOut);
    backend.destroy_transfer(transfer).unwrap();
    assert!(matches!(
        backend.transfer_state(transfer),
        Err(BackendError::Contract(ContractViolation::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_oversized_host_data_is_overflow() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Complete(Ok(vec![0xAA; 32])));

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 16, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();

    assert_eq!(outcome.state, TransferState::Errored);
    assert_eq!(outcome.status, TransferStatus::Overflow);
}

#[tokio::test]
async fn test_other_host_errors_are_reported() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Complete(Err(HostError::Io)));

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 16, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();

    assert_eq!(outcome.state, TransferState::Errored);
    assert_eq!(outcome.status, TransferStatus::Error(HostError::Io));
}

// ============================================================================
// Contract checks
// ============================================================================

#[tokio::test]
async fn test_second_await_is_rejected() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Pending);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 64, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    let mut first = Box::pin(backend.await_transfer(transfer));
    assert!(
        tokio::time::timeout(Duration::from_millis(20), &mut first)
            .await
            .is_err()
    );

    assert_eq!(
        backend.await_transfer(transfer).await,
        Err(ContractViolation::AlreadyAwaiting.into())
    );

    assert!(host.complete_pending(Ok(vec![1, 2, 3])));
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&outcome.data[..], &[1, 2, 3]);
    assert!(outcome.short);
}

#[tokio::test]
async fn test_dropped_await_can_be_retried() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Pending);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(20),
        backend.await_transfer(transfer),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(
        backend.transfer_state(transfer).unwrap(),
        TransferState::Submitted
    );

    host.complete_pending(Ok(vec![9; 4]));
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, backend.await_transfer(transfer))
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_success());
}

#[tokio::test]
async fn test_await_unsubmitted_is_invalid_state() {
    let (_host, backend, handle) = open_backend();
    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();

    let err = backend.await_transfer(transfer).await.unwrap_err();
    assert_eq!(
        err,
        ContractViolation::InvalidState {
            operation: "await",
            state: TransferState::Created,
        }
        .into()
    );
}

#[tokio::test]
async fn test_resubmit_is_busy() {
    let (_host, backend, handle) = open_backend();
    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    assert_eq!(
        backend.submit_transfer(transfer, &[]),
        Err(ContractViolation::Busy.into())
    );
    backend.await_transfer(transfer).await.unwrap();
    assert_eq!(
        backend.submit_transfer(transfer, &[]),
        Err(ContractViolation::Busy.into())
    );
}

#[tokio::test]
async fn test_destroy_in_flight_is_refused() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Pending);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    assert_eq!(
        backend.destroy_transfer(transfer),
        Err(ContractViolation::TransferInFlight.into())
    );
    assert_eq!(
        backend.close(handle),
        Err(ContractViolation::HandleBusy.into())
    );

    host.complete_pending(Ok(vec![0; 4]));
    backend.await_transfer(transfer).await.unwrap();
    backend.destroy_transfer(transfer).unwrap();
    backend.close(handle).unwrap();
}

#[test]
fn test_invalid_transfer_arguments() {
    let (_host, backend, handle) = open_backend();

    let missing_setup =
        backend.new_transfer(handle, TransferKind::Control, None, 8, TransferOptions::default());
    assert!(matches!(missing_setup, Err(BackendError::InvalidArgument(_))));

    let oversized = backend.new_transfer(
        handle,
        TransferKind::Control,
        Some(GET_DEVICE_DESCRIPTOR),
        0x1_0000,
        TransferOptions::default(),
    );
    assert!(matches!(oversized, Err(BackendError::InvalidArgument(_))));

    let largest = backend.new_transfer(
        handle,
        TransferKind::Control,
        Some(GET_DEVICE_DESCRIPTOR),
        0xFFFF,
        TransferOptions::default(),
    );
    assert!(largest.is_ok());

    let no_packets =
        backend.new_transfer(handle, TransferKind::Isochronous, None, 64, bulk(0x83));
    assert!(matches!(no_packets, Err(BackendError::InvalidArgument(_))));

    let no_stream = backend.new_transfer(handle, TransferKind::BulkStream, None, 64, bulk(0x81));
    assert!(matches!(no_stream, Err(BackendError::InvalidArgument(_))));

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x02))
        .unwrap();
    assert!(matches!(
        backend.submit_transfer(transfer, &[0; 5]),
        Err(BackendError::InvalidArgument(_))
    ));

    let transfer_in = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();
    assert!(matches!(
        backend.submit_transfer(transfer_in, &[1]),
        Err(BackendError::InvalidArgument(_))
    ));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancel_submitted_transfer() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Pending);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 64, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    backend.cancel_transfer(transfer).unwrap();

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, backend.await_transfer(transfer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, TransferState::Cancelled);
    assert_eq!(outcome.status, TransferStatus::Cancelled);
    assert_eq!(MockStats::get(&host.stats().cancels), 1);
}

#[test]
fn test_cancel_created_is_invalid_state() {
    let (_host, backend, handle) = open_backend();
    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 64, bulk(0x81))
        .unwrap();

    assert_eq!(
        backend.cancel_transfer(transfer),
        Err(ContractViolation::InvalidState {
            operation: "cancel",
            state: TransferState::Created,
        }
        .into())
    );
}

#[tokio::test]
async fn test_cancel_after_host_completion_keeps_result() {
    let (_host, backend, handle) = open_backend();
    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 4, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    // The mock already resolved the completion; the host no longer knows it
    backend.cancel_transfer(transfer).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();
    assert_eq!(outcome.state, TransferState::Completed);
}

#[tokio::test]
async fn test_refused_cancel_keeps_real_status() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Pending);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 64, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    host.fail_next_cancel(HostError::Io);
    assert_eq!(
        backend.cancel_transfer(transfer),
        Err(BackendError::Host(HostError::Io))
    );
    assert_eq!(backend.transfer_state(transfer).unwrap(), TransferState::Submitted);

    assert!(host.complete_pending(Err(HostError::Timeout)));
    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, backend.await_transfer(transfer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, TransferState::Errored);
    assert_eq!(outcome.status, TransferStatus::TimedOut);
    assert_eq!(MockStats::get(&host.stats().cancels), 0);
}

// ============================================================================
// Raw transfers
// ============================================================================

#[tokio::test]
async fn test_submit_raw_control() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Complete(Ok(create_mock_device_descriptor())));

    let mut buffer = create_mock_setup_packet(0x80, 0x06, 0x0100, 0x0000, 0x0012).to_vec();
    buffer.resize(8 + 18, 0);
    let raw = RawTransfer {
        kind: TransferKind::Control,
        endpoint: 0,
        timeout_ms: 500,
        stream_id: 0,
        iso_packets: 0,
        buffer,
    };

    let transfer = backend.submit_raw(handle, &raw).unwrap();
    let outcome = backend.await_transfer(transfer).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.actual_length(), 18);
    assert!(!outcome.short);
    assert!(host.out_data().is_empty());
}

#[test]
fn test_submit_raw_rejects_truncated_setup() {
    let (host, backend, handle) = open_backend();
    let raw = RawTransfer {
        kind: TransferKind::Control,
        endpoint: 0,
        timeout_ms: 0,
        stream_id: 0,
        iso_packets: 0,
        buffer: vec![0x80, 0x06, 0x00],
    };

    assert!(matches!(
        backend.submit_raw(handle, &raw),
        Err(BackendError::InvalidArgument(_))
    ));
    assert_eq!(MockStats::get(&host.stats().transfers_allocated), 0);
}

#[tokio::test]
async fn test_submit_raw_bulk_out() {
    let (host, backend, handle) = open_backend();
    let raw = RawTransfer {
        kind: TransferKind::Bulk,
        endpoint: 0x02,
        timeout_ms: 0,
        stream_id: 0,
        iso_packets: 0,
        buffer: vec![1, 2, 3],
    };

    let transfer = backend.submit_raw(handle, &raw).unwrap();
    assert!(backend.await_transfer(transfer).await.unwrap().is_success());
    assert_eq!(host.out_data(), vec![vec![1, 2, 3]]);
}

// ============================================================================
// Event processing
// ============================================================================

#[tokio::test]
async fn test_handle_events_finishes_unawaited_transfers() {
    let (_host, backend, handle) = open_backend();
    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 16, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    let completed = backend.handle_events();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, transfer);
    assert_eq!(completed[0].status, TransferStatus::Success);
    assert_eq!(completed[0].actual_length, 16);

    assert!(backend.handle_events().is_empty());
    assert_eq!(
        backend.transfer_state(transfer).unwrap(),
        TransferState::Completed
    );
}

#[tokio::test]
async fn test_wait_for_events_wakes_on_completion() {
    let (host, backend, handle) = open_backend();
    host.push_response(MockResponse::Pending);

    let transfer = backend
        .new_transfer(handle, TransferKind::Bulk, None, 16, bulk(0x81))
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();
    assert!(backend.handle_events().is_empty());

    let completer = Arc::clone(&host);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        completer.complete_pending(Ok(vec![7; 16]));
    });

    let completed = backend.wait_for_events(DEFAULT_TEST_TIMEOUT).await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, transfer);
    assert_eq!(completed[0].state, TransferState::Completed);
}

#[tokio::test]
async fn test_wait_for_events_times_out_empty() {
    let (_host, backend, _handle) = open_backend();
    let completed = backend.wait_for_events(Duration::from_millis(20)).await;
    assert!(completed.is_empty());
}

//! Hotplug integration tests
//!
//! Arrivals and removals flowing from the mock host through the hotplug
//! bridge into the device table, for both push and poll delivery.
//!
//! Run with: `cargo test -p backend --test hotplug_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, MockHost, MockResponse, create_mock_device_info, with_timeout,
};
use host::{HostError, HotplugDelivery, HotplugKind, TransferKind, TransferOptions};
use std::sync::Arc;
use usb_bridge::{
    Backend, BackendError, BackendOption, BackendSettings, ContractViolation, TransferState,
    TransferStatus,
};

fn hotplug_backend(delivery: HotplugDelivery) -> (Arc<MockHost>, Backend<MockHost>) {
    let host = Arc::new(MockHost::with_delivery(delivery));
    let backend = Backend::new(Arc::clone(&host), BackendSettings::default());
    backend.init().unwrap();
    (host, backend)
}

#[test]
fn test_arrival_then_departure() {
    let (host, backend) = hotplug_backend(HotplugDelivery::Push);
    let resource = host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));

    let events = backend.poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, HotplugKind::Arrived);
    assert_eq!(events[0].info.vendor_id, 0x1234);
    assert_eq!(events[0].info.product_id, 0x5678);
    let device = events[0].device;

    let handle = backend.open(device).unwrap();
    backend.claim_interface(handle, 0).unwrap();

    assert!(host.unplug(resource));
    let events = backend.poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, HotplugKind::Left);
    assert_eq!(events[0].device, device);
    assert_eq!(events[0].info.bus_number, 1);
    assert_eq!(events[0].info.device_address, 2);

    assert_eq!(
        backend.claim_interface(handle, 1),
        Err(BackendError::DeviceDisconnected)
    );
    assert_eq!(
        backend.get_configuration(handle),
        Err(BackendError::DeviceDisconnected)
    );
    assert_eq!(backend.open(device), Err(BackendError::DeviceDisconnected));
    assert!(backend.is_disconnected(device).unwrap());
    assert_eq!(backend.device_info(device).unwrap().vendor_id, 0x1234);

    // The open handle kept the device alive; closing it lets it go
    backend.close(handle).unwrap();
    assert!(matches!(
        backend.device_info(device),
        Err(BackendError::Contract(ContractViolation::NotFound { .. }))
    ));
    assert_eq!(backend.counts().devices, 0);
}

#[test]
fn test_rearrival_gets_new_identity() {
    let (host, backend) = hotplug_backend(HotplugDelivery::Push);
    let info = create_mock_device_info(1, 2, 0x1234, 0x5678);

    let first = host.plug(info.clone());
    host.unplug(first);
    host.plug(info);

    let events = backend.poll_events();
    let kinds: Vec<_> = events.iter().map(|event| event.kind).collect();
    assert_eq!(
        kinds,
        vec![HotplugKind::Arrived, HotplugKind::Left, HotplugKind::Arrived]
    );
    assert_eq!(events[0].device, events[1].device);
    assert_ne!(events[0].device, events[2].device);
}

#[test]
fn test_poll_delivery() {
    let (host, backend) = hotplug_backend(HotplugDelivery::Poll);
    let resource = host.plug(create_mock_device_info(2, 7, 0xABCD, 0x0001));

    let events = backend.poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, HotplugKind::Arrived);

    host.unplug(resource);
    let events = backend.poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, HotplugKind::Left);
    assert!(backend.poll_events().is_empty());
}

#[test]
fn test_both_delivery_reports_each_event_once() {
    let (host, backend) = hotplug_backend(HotplugDelivery::Both);
    host.plug(create_mock_device_info(1, 4, 0x1234, 0x5678));

    assert_eq!(backend.poll_events().len(), 1);
    assert!(backend.poll_events().is_empty());
}

#[test]
fn test_filtered_arrivals_are_ignored() {
    let host = Arc::new(MockHost::new());
    let backend = Backend::new(
        Arc::clone(&host),
        BackendSettings {
            filters: vec!["0x1234:*".to_string()],
            hotplug: true,
        },
    );
    backend.init().unwrap();

    let ignored = host.plug(create_mock_device_info(1, 3, 0xABCD, 0x0001));
    host.plug(create_mock_device_info(1, 2, 0x1234, 0x9999));
    host.unplug(ignored);

    let events = backend.poll_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].info.product_id, 0x9999);
}

#[test]
fn test_hotplug_disabled_by_settings() {
    let host = Arc::new(MockHost::new());
    let backend = Backend::new(
        Arc::clone(&host),
        BackendSettings {
            filters: Vec::new(),
            hotplug: false,
        },
    );
    backend.init().unwrap();

    host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));
    assert!(backend.poll_events().is_empty());

    // Enabling later only reports what happens afterwards
    backend.enable_hotplug().unwrap();
    backend.enable_hotplug().unwrap();
    host.plug(create_mock_device_info(1, 3, 0x1234, 0x5678));
    assert_eq!(backend.poll_events().len(), 1);
}

#[test]
fn test_no_device_discovery_lists_hotplugged_devices() {
    let (host, backend) = hotplug_backend(HotplugDelivery::Push);
    backend.set_option(BackendOption::NoDeviceDiscovery).unwrap();

    let resource = host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));
    let listed = backend.get_device_list().unwrap();
    assert_eq!(listed.len(), 1);
    backend.unref_device(listed[0]).unwrap();

    host.unplug(resource);
    assert!(backend.get_device_list().unwrap().is_empty());
}

#[test]
fn test_enumeration_marks_missing_devices() {
    let host = Arc::new(MockHost::with_delivery(HotplugDelivery::Unsupported));
    let backend = Backend::new(Arc::clone(&host), BackendSettings::default());
    backend.init().unwrap();

    let resource = host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));
    let device = backend.get_device_list().unwrap()[0];

    host.unplug(resource);
    assert!(backend.get_device_list().unwrap().is_empty());
    assert!(backend.is_disconnected(device).unwrap());

    backend.unref_device(device).unwrap();
    assert_eq!(backend.counts().devices, 0);
}

#[tokio::test]
async fn test_in_flight_transfer_ends_with_no_device() {
    let (host, backend) = hotplug_backend(HotplugDelivery::Push);
    let resource = host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));
    let device = backend.poll_events()[0].device;
    let handle = backend.open(device).unwrap();

    host.push_response(MockResponse::Pending);
    let transfer = backend
        .new_transfer(
            handle,
            TransferKind::Bulk,
            None,
            64,
            TransferOptions {
                endpoint: 0x81,
                ..Default::default()
            },
        )
        .unwrap();
    backend.submit_transfer(transfer, &[]).unwrap();

    host.unplug(resource);
    backend.poll_events();

    let outcome = with_timeout(DEFAULT_TEST_TIMEOUT, backend.await_transfer(transfer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, TransferState::Errored);
    assert_eq!(outcome.status, TransferStatus::NoDevice);

    // New work on the departed device is refused
    assert_eq!(
        backend.new_transfer(
            handle,
            TransferKind::Bulk,
            None,
            64,
            TransferOptions::default()
        ),
        Err(BackendError::DeviceDisconnected)
    );
    backend.destroy_transfer(transfer).unwrap();
    backend.close(handle).unwrap();
}

#[test]
fn test_enable_failure_is_reported() {
    let host = Arc::new(MockHost::with_delivery(HotplugDelivery::Unsupported));
    let backend = Backend::new(host, BackendSettings::default());

    let err = backend.enable_hotplug().unwrap_err();
    assert_eq!(err, BackendError::Unsupported("hotplug"));
    assert_eq!(err.code(), HostError::NotSupported.code());
}

//! Test utilities for usb-bridge
//!
//! Provides a scripted in-memory [`UsbHost`] and helper functions for
//! testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockHost, create_mock_device_info};
//! use host::UsbHost;
//!
//! let host = MockHost::new();
//! host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));
//! assert_eq!(host.list_devices().unwrap().len(), 1);
//! ```

use host::{
    Completer, Completion, ConfigDescriptor, ConfigValue, DeviceInfo, DeviceSpeed, HostDevice,
    HostError, HostHotplugEvent, HostResult, HotplugDelivery, HotplugSink, ResourceId,
    TransferRequest, UsbHost, completion_pair,
};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock DeviceInfo for testing
///
/// # Example
/// ```
/// use common::test_utils::create_mock_device_info;
///
/// let device = create_mock_device_info(1, 2, 0x1234, 0x5678);
/// assert_eq!(device.bus_number, 1);
/// assert_eq!(device.vendor_id, 0x1234);
/// ```
pub fn create_mock_device_info(bus: u8, address: u8, vendor_id: u16, product_id: u16) -> DeviceInfo {
    DeviceInfo {
        bus_number: bus,
        device_address: address,
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        speed: DeviceSpeed::High,
        num_configurations: 1,
    }
}

/// Create a mock HID device (class 0x03)
pub fn create_mock_hid_device(bus: u8, address: u8) -> DeviceInfo {
    DeviceInfo {
        class: 0x03,
        speed: DeviceSpeed::Full,
        ..create_mock_device_info(bus, address, 0x046d, 0xc52b)
    }
}

/// Create a mock USB descriptor response (GET_DESCRIPTOR Device)
///
/// Returns a standard 18-byte device descriptor
pub fn create_mock_device_descriptor() -> Vec<u8> {
    vec![
        0x12, // bLength
        0x01, // bDescriptorType (Device)
        0x00, 0x02, // bcdUSB (2.00)
        0x00, // bDeviceClass
        0x00, // bDeviceSubClass
        0x00, // bDeviceProtocol
        0x40, // bMaxPacketSize0 (64 bytes)
        0x34, 0x12, // idVendor (0x1234)
        0x78, 0x56, // idProduct (0x5678)
        0x00, 0x01, // bcdDevice (1.00)
        0x01, // iManufacturer
        0x02, // iProduct
        0x03, // iSerialNumber
        0x01, // bNumConfigurations
    ]
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Create a control transfer setup packet
pub fn create_mock_setup_packet(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; 8] {
    [
        request_type,
        request,
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (index & 0xFF) as u8,
        ((index >> 8) & 0xFF) as u8,
        (length & 0xFF) as u8,
        ((length >> 8) & 0xFF) as u8,
    ]
}

/// Run a future with a timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

// ============================================================================
// Mock host
// ============================================================================

/// How the mock answers the next submitted transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockResponse {
    /// Resolve the completion immediately at submit
    Complete(HostResult<Vec<u8>>),
    /// Keep the transfer in flight until resolved or cancelled
    Pending,
}

/// Call counters, shared with every resource the mock hands out
#[derive(Debug, Default)]
pub struct MockStats {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub claims: AtomicUsize,
    pub releases: AtomicUsize,
    pub transfers_allocated: AtomicUsize,
    pub transfers_freed: AtomicUsize,
    pub submits: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl MockStats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

/// Device resource handed out by [`MockHost`]
#[derive(Debug)]
pub struct MockDevice {
    pub id: ResourceId,
}

/// Handle resource handed out by [`MockHost`]
#[derive(Debug)]
pub struct MockHandle {
    pub device: ResourceId,
}

/// Transfer resource handed out by [`MockHost`]
#[derive(Debug)]
pub struct MockTransfer {
    pub device: ResourceId,
    pub request: TransferRequest,
    completer: Option<Completer>,
    stats: Arc<MockStats>,
}

impl Drop for MockTransfer {
    fn drop(&mut self) {
        MockStats::bump(&self.stats.transfers_freed);
    }
}

struct MockState {
    next_resource: u64,
    attached: BTreeMap<ResourceId, DeviceInfo>,
    sink: Option<HotplugSink<MockDevice>>,
    polled: VecDeque<HostHotplugEvent<MockDevice>>,
    hotplug_enabled: bool,
    responses: VecDeque<MockResponse>,
    pending: VecDeque<(ResourceId, Completer)>,
    out_data: Vec<Vec<u8>>,
    configuration: u8,
    kernel_drivers: HashSet<u8>,
    fail_next: Option<HostError>,
    fail_cancel: Option<HostError>,
}

/// Scripted in-memory host
///
/// Devices are attached with [`plug`](MockHost::plug) and detached with
/// [`unplug`](MockHost::unplug); both emit hotplug events once hotplug is
/// enabled. Transfers answer from a response script, defaulting to a
/// zero-filled buffer for IN transfers and an empty success for OUT.
pub struct MockHost {
    state: Mutex<MockState>,
    delivery: HotplugDelivery,
    stats: Arc<MockStats>,
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHost {
    /// Mock host with push hotplug delivery
    pub fn new() -> Self {
        Self::with_delivery(HotplugDelivery::Push)
    }

    pub fn with_delivery(delivery: HotplugDelivery) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_resource: 1,
                attached: BTreeMap::new(),
                sink: None,
                polled: VecDeque::new(),
                hotplug_enabled: false,
                responses: VecDeque::new(),
                pending: VecDeque::new(),
                out_data: Vec::new(),
                configuration: 1,
                kernel_drivers: HashSet::from([0]),
                fail_next: None,
                fail_cancel: None,
            }),
            delivery,
            stats: Arc::new(MockStats::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> &MockStats {
        &self.stats
    }

    /// Attach a device, emitting an arrival when hotplug is enabled
    pub fn plug(&self, info: DeviceInfo) -> ResourceId {
        let mut state = self.lock();
        let id = ResourceId(state.next_resource);
        state.next_resource += 1;
        state.attached.insert(id, info.clone());

        let event = HostHotplugEvent::Arrived(HostDevice {
            id,
            info,
            device: MockDevice { id },
        });
        Self::emit(&mut state, self.delivery, event);
        id
    }

    /// Detach a device, emitting a removal when hotplug is enabled
    pub fn unplug(&self, id: ResourceId) -> bool {
        let mut state = self.lock();
        let Some(info) = state.attached.remove(&id) else {
            return false;
        };

        // In-flight transfers on a vanished device end with NoDevice
        for (_, completer) in state.pending.iter().filter(|(device, _)| *device == id) {
            completer.complete(Err(HostError::NoDevice));
        }
        Self::emit(&mut state, self.delivery, HostHotplugEvent::Left { id, info });
        true
    }

    fn emit(state: &mut MockState, delivery: HotplugDelivery, event: HostHotplugEvent<MockDevice>) {
        if !state.hotplug_enabled {
            return;
        }
        match delivery {
            HotplugDelivery::Push | HotplugDelivery::Both => {
                if let Some(sink) = &state.sink {
                    sink.push(event);
                }
            }
            HotplugDelivery::Poll => state.polled.push_back(event),
            HotplugDelivery::Unsupported => {}
        }
    }

    /// Refuse the next cancel with `err`, leaving the transfer in flight
    pub fn fail_next_cancel(&self, err: HostError) {
        self.lock().fail_cancel = Some(err);
    }

    /// Script the answer to the next submitted transfer
    pub fn push_response(&self, response: MockResponse) {
        self.lock().responses.push_back(response);
    }

    /// Resolve the oldest transfer still held in flight
    pub fn complete_pending(&self, result: HostResult<Vec<u8>>) -> bool {
        let mut state = self.lock();
        while let Some((_, completer)) = state.pending.pop_front() {
            if !completer.is_resolved() {
                return completer.complete(result);
            }
        }
        false
    }

    /// Number of transfers held in flight that have not been resolved
    pub fn pending_count(&self) -> usize {
        self.lock()
            .pending
            .iter()
            .filter(|(_, completer)| !completer.is_resolved())
            .count()
    }

    /// OUT payloads received so far, in submit order
    pub fn out_data(&self) -> Vec<Vec<u8>> {
        self.lock().out_data.clone()
    }

    /// Make the next non-transfer call fail with `error`
    pub fn fail_next(&self, error: HostError) {
        self.lock().fail_next = Some(error);
    }

    fn check(&self, device: ResourceId) -> HostResult<()> {
        let mut state = self.lock();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if state.attached.contains_key(&device) {
            Ok(())
        } else {
            Err(HostError::NoDevice)
        }
    }

    fn descriptor() -> ConfigDescriptor {
        ConfigDescriptor {
            configuration_value: 1,
            num_interfaces: 1,
            max_power_ma: 100,
            self_powered: false,
            remote_wakeup: false,
        }
    }
}

impl UsbHost for MockHost {
    type Device = MockDevice;
    type Handle = MockHandle;
    type Transfer = MockTransfer;

    fn list_devices(&self) -> HostResult<Vec<HostDevice<MockDevice>>> {
        let state = self.lock();
        Ok(state
            .attached
            .iter()
            .map(|(id, info)| HostDevice {
                id: *id,
                info: info.clone(),
                device: MockDevice { id: *id },
            })
            .collect())
    }

    fn open(&self, device: &MockDevice) -> HostResult<MockHandle> {
        self.check(device.id)?;
        MockStats::bump(&self.stats.opens);
        Ok(MockHandle { device: device.id })
    }

    fn close(&self, _handle: MockHandle) {
        MockStats::bump(&self.stats.closes);
    }

    fn config_descriptor(&self, device: &MockDevice, index: u8) -> HostResult<ConfigDescriptor> {
        self.check(device.id)?;
        match index {
            0 => Ok(Self::descriptor()),
            _ => Err(HostError::NotFound),
        }
    }

    fn config_descriptor_by_value(
        &self,
        device: &MockDevice,
        value: u8,
    ) -> HostResult<ConfigDescriptor> {
        self.check(device.id)?;
        match value {
            1 => Ok(Self::descriptor()),
            _ => Err(HostError::NotFound),
        }
    }

    fn active_config_descriptor(&self, device: &MockDevice) -> HostResult<ConfigDescriptor> {
        self.check(device.id)?;
        match self.lock().configuration {
            1 => Ok(Self::descriptor()),
            _ => Err(HostError::NotFound),
        }
    }

    fn get_configuration(&self, handle: &MockHandle) -> HostResult<u8> {
        self.check(handle.device)?;
        Ok(self.lock().configuration)
    }

    fn set_configuration(&self, handle: &MockHandle, config: ConfigValue) -> HostResult<()> {
        self.check(handle.device)?;
        self.lock().configuration = config.raw();
        Ok(())
    }

    fn claim_interface(&self, handle: &MockHandle, _interface: u8) -> HostResult<()> {
        self.check(handle.device)?;
        MockStats::bump(&self.stats.claims);
        Ok(())
    }

    fn release_interface(&self, handle: &MockHandle, _interface: u8) -> HostResult<()> {
        // Releasing on a vanished device still counts: the claim is gone
        MockStats::bump(&self.stats.releases);
        self.check(handle.device)
    }

    fn set_interface_altsetting(
        &self,
        handle: &MockHandle,
        _interface: u8,
        _alt_setting: u8,
    ) -> HostResult<()> {
        self.check(handle.device)
    }

    fn clear_halt(&self, handle: &MockHandle, _endpoint: u8) -> HostResult<()> {
        self.check(handle.device)
    }

    fn reset_device(&self, handle: &MockHandle) -> HostResult<()> {
        self.check(handle.device)
    }

    fn alloc_streams(
        &self,
        handle: &MockHandle,
        num_streams: u32,
        endpoints: &[u8],
    ) -> HostResult<u32> {
        self.check(handle.device)?;
        if endpoints.is_empty() {
            return Err(HostError::InvalidParam);
        }
        Ok(num_streams)
    }

    fn free_streams(&self, handle: &MockHandle, _endpoints: &[u8]) -> HostResult<()> {
        self.check(handle.device)
    }

    fn kernel_driver_active(&self, handle: &MockHandle, interface: u8) -> HostResult<bool> {
        self.check(handle.device)?;
        Ok(self.lock().kernel_drivers.contains(&interface))
    }

    fn detach_kernel_driver(&self, handle: &MockHandle, interface: u8) -> HostResult<()> {
        self.check(handle.device)?;
        if self.lock().kernel_drivers.remove(&interface) {
            Ok(())
        } else {
            Err(HostError::NotFound)
        }
    }

    fn attach_kernel_driver(&self, handle: &MockHandle, interface: u8) -> HostResult<()> {
        self.check(handle.device)?;
        if self.lock().kernel_drivers.insert(interface) {
            Ok(())
        } else {
            Err(HostError::Busy)
        }
    }

    fn new_transfer(
        &self,
        handle: &MockHandle,
        request: &TransferRequest,
    ) -> HostResult<MockTransfer> {
        self.check(handle.device)?;
        MockStats::bump(&self.stats.transfers_allocated);
        Ok(MockTransfer {
            device: handle.device,
            request: *request,
            completer: None,
            stats: Arc::clone(&self.stats),
        })
    }

    fn submit_transfer(&self, transfer: &mut MockTransfer, data: &[u8]) -> HostResult<Completion> {
        let mut state = self.lock();
        if !state.attached.contains_key(&transfer.device) {
            return Err(HostError::NoDevice);
        }
        MockStats::bump(&self.stats.submits);

        let (completer, completion) = completion_pair();
        if !data.is_empty() {
            state.out_data.push(data.to_vec());
        }

        let response = state.responses.pop_front().unwrap_or_else(|| {
            if transfer.request.is_in() {
                MockResponse::Complete(Ok(vec![0; transfer.request.buffer_size as usize]))
            } else {
                MockResponse::Complete(Ok(Vec::new()))
            }
        });

        match response {
            MockResponse::Complete(result) => {
                completer.complete(result);
            }
            MockResponse::Pending => state
                .pending
                .push_back((transfer.device, completer.clone())),
        }

        transfer.completer = Some(completer);
        Ok(completion)
    }

    fn cancel_transfer(&self, transfer: &mut MockTransfer) -> HostResult<()> {
        if let Some(err) = self.lock().fail_cancel.take() {
            return Err(err);
        }
        match &transfer.completer {
            Some(completer) if !completer.is_resolved() => {
                MockStats::bump(&self.stats.cancels);
                completer.complete(Err(HostError::Interrupted));
                Ok(())
            }
            _ => Err(HostError::NotFound),
        }
    }

    fn hotplug_delivery(&self) -> HotplugDelivery {
        self.delivery
    }

    fn enable_hotplug(&self, sink: HotplugSink<MockDevice>) -> HostResult<()> {
        if !self.delivery.is_supported() {
            return Err(HostError::NotSupported);
        }
        let mut state = self.lock();
        state.sink = Some(sink);
        state.hotplug_enabled = true;
        Ok(())
    }

    fn poll_hotplug(&self) -> Vec<HostHotplugEvent<MockDevice>> {
        self.lock().polled.drain(..).collect()
    }
}

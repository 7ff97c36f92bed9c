//! Backend facade
//!
//! [`Backend`] is the OS-backend-shaped surface a USB client library drives.
//! Each entry point resolves client handles through the registries, makes at
//! most one call into the [`UsbHost`] and translates the result back. The
//! shared state sits behind a `std::sync::Mutex` that is never held across
//! an `.await`.

use crate::config::{BridgeConfig, check_filter};
use crate::device::{DeviceTable, HandleEntry, check_interface};
use crate::engine::{
    AwaitStart, CompletedTransfer, RawTransfer, TransferOutcome, TransferRecord, TransferState,
    validate_request,
};
use crate::error::{BackendError, ContractViolation, Result};
use crate::hotplug::{HotplugBridge, HotplugEvent};
use crate::registry::{DeviceId, HandleId, Registry, TransferId};
use host::{
    Completion, ConfigDescriptor, ConfigValue, DeviceInfo, HostError, TransferKind,
    TransferOptions, TransferRequest, TransferSetup, UsbHost,
};
use std::collections::HashSet;
use std::future::poll_fn;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend settings taken from the configuration file
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// VID:PID allow-list applied to enumeration and arrivals
    pub filters: Vec<String>,
    /// Enable hotplug at init when the host offers it
    pub hotplug: bool,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            hotplug: true,
        }
    }
}

impl From<&BridgeConfig> for BackendSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            filters: config.usb.filters.clone(),
            hotplug: config.usb.hotplug,
        }
    }
}

/// Client library verbosity, as passed through `set_option`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    None,
    Error,
    Warning,
    #[default]
    Info,
    Debug,
}

/// Options a client may set on the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendOption {
    LogLevel(LogLevel),
    /// Skip host enumeration; only devices seen through hotplug are listed
    NoDeviceDiscovery,
    /// Windows UsbDk driver selection
    UseUsbDk,
}

/// Live resource counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceCounts {
    pub devices: usize,
    pub handles: usize,
    pub transfers: usize,
}

struct Inner<H: UsbHost> {
    devices: DeviceTable<H::Device>,
    handles: Registry<HandleId, HandleEntry<H::Handle>>,
    transfers: Registry<TransferId, TransferRecord<H::Transfer>>,
    hotplug: HotplugBridge<H::Device>,
    settings: BackendSettings,
    log_level: LogLevel,
    no_device_discovery: bool,
}

fn lock<H: UsbHost>(inner: &Mutex<Inner<H>>) -> MutexGuard<'_, Inner<H>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolve a handle whose device is still attached
fn connected_handle<'a, D, Hd>(
    devices: &DeviceTable<D>,
    handles: &'a mut Registry<HandleId, HandleEntry<Hd>>,
    id: HandleId,
) -> Result<&'a mut HandleEntry<Hd>> {
    let entry = handles.resolve_mut(id)?;
    devices.connected(entry.device)?;
    Ok(entry)
}

/// Report a capability the host lacks as `Unsupported`
fn capability(what: &'static str) -> impl Fn(HostError) -> BackendError {
    move |error| match error {
        HostError::NotSupported => BackendError::Unsupported(what),
        error => BackendError::Host(error),
    }
}

fn release_claims<H: UsbHost>(host: &H, id: HandleId, entry: &HandleEntry<H::Handle>) {
    for interface in &entry.claimed {
        match host.release_interface(&entry.resource, *interface) {
            Ok(()) => debug!("Released interface {} on {:?}", interface, id),
            Err(e) => debug!(
                "Could not release interface {} on {:?} (device may be gone): {}",
                interface, id, e
            ),
        }
    }
}

/// Hands an abandoned await's completion back to its transfer record
struct AwaitGuard<H: UsbHost> {
    inner: Arc<Mutex<Inner<H>>>,
    id: TransferId,
    completion: Option<Completion>,
}

impl<H: UsbHost> Drop for AwaitGuard<H> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            let mut inner = lock(&self.inner);
            if let Ok(record) = inner.transfers.resolve_mut(self.id) {
                debug!("Await on {:?} abandoned", self.id);
                record.abandon_await(completion);
            }
        }
    }
}

/// OS-backend adapter over a [`UsbHost`]
pub struct Backend<H: UsbHost> {
    host: Arc<H>,
    inner: Arc<Mutex<Inner<H>>>,
}

impl<H: UsbHost> Backend<H> {
    pub fn new(host: Arc<H>, settings: BackendSettings) -> Self {
        Self {
            host,
            inner: Arc::new(Mutex::new(Inner {
                devices: DeviceTable::new(),
                handles: Registry::new(),
                transfers: Registry::new(),
                hotplug: HotplugBridge::default(),
                settings,
                log_level: LogLevel::default(),
                no_device_discovery: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<H>> {
        lock(&self.inner)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Prepare the host and, when configured, start hotplug delivery
    pub fn init(&self) -> Result<()> {
        self.host.init()?;

        let want_hotplug = self.lock().settings.hotplug;
        if want_hotplug && self.host.hotplug_delivery().is_supported() {
            self.enable_hotplug()?;
        }

        info!(
            "Backend initialized (hotplug: {:?})",
            self.host.hotplug_delivery()
        );
        Ok(())
    }

    /// Cancel outstanding transfers and release every resource
    pub fn exit(self) {
        let Backend { host, inner } = self;
        let mut guard = lock(&inner);
        let inner = &mut *guard;

        inner.hotplug.disable();

        for (id, record) in inner.transfers.iter_mut() {
            if record.state() == TransferState::Submitted
                && let Err(e) = host.cancel_transfer(&mut record.resource)
            {
                debug!("Cancel of {:?} during exit failed: {}", id, e);
            }
        }
        let transfers = inner.transfers.drain().len();

        let handles = inner.handles.drain();
        let handle_count = handles.len();
        for (id, entry) in handles {
            release_claims(&*host, id, &entry);
            host.close(entry.resource);
        }

        let devices = inner.devices.drain().len();
        info!(
            "Backend exited: released {} transfer(s), {} handle(s), {} device(s)",
            transfers, handle_count, devices
        );
    }

    pub fn set_option(&self, option: BackendOption) -> Result<()> {
        let mut inner = self.lock();
        match option {
            BackendOption::LogLevel(level) => {
                debug!("Client log level set to {:?}", level);
                inner.log_level = level;
                Ok(())
            }
            BackendOption::NoDeviceDiscovery => {
                inner.no_device_discovery = true;
                Ok(())
            }
            BackendOption::UseUsbDk => Err(BackendError::Unsupported("UsbDk backend")),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        self.lock().log_level
    }

    pub fn counts(&self) -> ResourceCounts {
        let inner = self.lock();
        ResourceCounts {
            devices: inner.devices.len(),
            handles: inner.handles.len(),
            transfers: inner.transfers.len(),
        }
    }

    // ------------------------------------------------------------------
    // Hotplug
    // ------------------------------------------------------------------

    /// Start hotplug delivery; enabling twice is a no-op
    pub fn enable_hotplug(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.hotplug.is_enabled() {
            return Ok(());
        }

        let delivery = self.host.hotplug_delivery();
        if !delivery.is_supported() {
            return Err(BackendError::Unsupported("hotplug"));
        }

        let sink = inner.hotplug.enable(delivery);
        if let Err(e) = self.host.enable_hotplug(sink) {
            inner.hotplug.disable();
            return Err(capability("hotplug")(e));
        }

        info!("Hotplug enabled ({:?} delivery)", delivery);
        Ok(())
    }

    /// Arrivals and removals since the previous call, in order
    pub fn poll_events(&self) -> Vec<HotplugEvent> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .hotplug
            .pump(&*self.host, &mut inner.devices, &inner.settings.filters);
        inner.hotplug.drain()
    }

    // ------------------------------------------------------------------
    // Devices
    // ------------------------------------------------------------------

    /// Enumerate attached devices
    ///
    /// Every returned id carries one reference taken on the caller's
    /// behalf; drop it with [`unref_device`](Self::unref_device).
    pub fn get_device_list(&self) -> Result<Vec<DeviceId>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .hotplug
            .pump(&*self.host, &mut inner.devices, &inner.settings.filters);

        let ids = if inner.no_device_discovery {
            inner.devices.connected_ids()
        } else {
            let listed = self.host.list_devices()?;
            let mut present = HashSet::new();
            let mut ids = Vec::with_capacity(listed.len());

            for device in listed {
                if !check_filter(
                    device.info.vendor_id,
                    device.info.product_id,
                    &inner.settings.filters,
                ) {
                    continue;
                }
                present.insert(device.id);
                ids.push(inner.devices.observe(device));
            }

            for gone in inner.devices.retain_present(&present) {
                debug!("Device {:?} missing from listing, marked disconnected", gone);
            }
            ids
        };

        for id in &ids {
            inner.devices.add_ref(*id)?;
        }
        debug!("Enumerated {} device(s)", ids.len());
        Ok(ids)
    }

    pub fn ref_device(&self, device: DeviceId) -> Result<()> {
        self.lock().devices.add_ref(device)
    }

    pub fn unref_device(&self, device: DeviceId) -> Result<()> {
        self.lock().devices.remove_ref(device)
    }

    /// Cached descriptor snapshot; available after disconnection
    pub fn device_info(&self, device: DeviceId) -> Result<DeviceInfo> {
        Ok(self.lock().devices.get(device)?.info.clone())
    }

    pub fn is_disconnected(&self, device: DeviceId) -> Result<bool> {
        Ok(self.lock().devices.get(device)?.disconnected)
    }

    pub fn wrap_sys_device(&self, _sys_device: isize) -> Result<HandleId> {
        Err(BackendError::Unsupported("wrapping platform device handles"))
    }

    pub fn config_descriptor(&self, device: DeviceId, index: u8) -> Result<ConfigDescriptor> {
        let inner = self.lock();
        let entry = inner.devices.connected(device)?;
        Ok(self.host.config_descriptor(&entry.resource, index)?)
    }

    pub fn config_descriptor_by_value(
        &self,
        device: DeviceId,
        value: u8,
    ) -> Result<ConfigDescriptor> {
        let inner = self.lock();
        let entry = inner.devices.connected(device)?;
        Ok(self.host.config_descriptor_by_value(&entry.resource, value)?)
    }

    pub fn active_config_descriptor(&self, device: DeviceId) -> Result<ConfigDescriptor> {
        let inner = self.lock();
        let entry = inner.devices.connected(device)?;
        Ok(self.host.active_config_descriptor(&entry.resource)?)
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    pub fn open(&self, device: DeviceId) -> Result<HandleId> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let entry = inner.devices.connected(device)?;
        let resource = self.host.open(&entry.resource)?;
        inner.devices.add_ref(device)?;
        let id = inner.handles.register(HandleEntry::new(resource, device));

        debug!("Opened {:?} as {:?}", device, id);
        Ok(id)
    }

    /// Close a handle, releasing every interface it claimed
    ///
    /// Works on handles of departed devices; refused while any of the
    /// handle's transfers is in flight.
    pub fn close(&self, handle: HandleId) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        inner.handles.resolve(handle)?;
        let busy = inner
            .transfers
            .iter()
            .any(|(_, record)| record.handle == handle && record.state() == TransferState::Submitted);
        if busy {
            return Err(ContractViolation::HandleBusy.into());
        }

        let entry = inner.handles.release(handle)?;
        release_claims(&*self.host, handle, &entry);
        let device = entry.device;
        self.host.close(entry.resource);

        if let Err(e) = inner.devices.remove_ref(device) {
            warn!("Dropping device reference of {:?} failed: {}", handle, e);
        }
        debug!("Closed {:?}", handle);
        Ok(())
    }

    pub fn get_configuration(&self, handle: HandleId) -> Result<u8> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;

        let value = self.host.get_configuration(&entry.resource)?;
        entry.configuration = Some(value);
        Ok(value)
    }

    /// Select a configuration; refused with `Busy` while interfaces are
    /// claimed
    pub fn set_configuration(&self, handle: HandleId, config: ConfigValue) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;

        if !entry.claimed.is_empty() {
            return Err(HostError::Busy.into());
        }
        self.host.set_configuration(&entry.resource, config)?;
        entry.configuration = Some(config.raw());
        debug!("Set configuration {} on {:?}", config.raw(), handle);
        Ok(())
    }

    /// Claim an interface; claiming a held interface again is a no-op
    pub fn claim_interface(&self, handle: HandleId, interface: u8) -> Result<()> {
        check_interface(interface)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;

        if entry.is_claimed(interface) {
            return Ok(());
        }
        self.host.claim_interface(&entry.resource, interface)?;
        entry.claimed.insert(interface);
        debug!("Claimed interface {} on {:?}", interface, handle);
        Ok(())
    }

    pub fn release_interface(&self, handle: HandleId, interface: u8) -> Result<()> {
        check_interface(interface)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;

        if !entry.is_claimed(interface) {
            return Err(HostError::NotFound.into());
        }
        self.host.release_interface(&entry.resource, interface)?;
        entry.claimed.remove(&interface);
        debug!("Released interface {} on {:?}", interface, handle);
        Ok(())
    }

    pub fn set_interface_altsetting(
        &self,
        handle: HandleId,
        interface: u8,
        alt_setting: u8,
    ) -> Result<()> {
        check_interface(interface)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;

        if !entry.is_claimed(interface) {
            return Err(HostError::NotFound.into());
        }
        Ok(self
            .host
            .set_interface_altsetting(&entry.resource, interface, alt_setting)?)
    }

    pub fn clear_halt(&self, handle: HandleId, endpoint: u8) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        Ok(self.host.clear_halt(&entry.resource, endpoint)?)
    }

    pub fn reset_device(&self, handle: HandleId) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        self.host.reset_device(&entry.resource)?;
        debug!("Reset {:?}", handle);
        Ok(())
    }

    /// Allocate bulk streams; returns how many the host granted
    pub fn alloc_streams(&self, handle: HandleId, num_streams: u32, endpoints: &[u8]) -> Result<u32> {
        if num_streams == 0 || endpoints.is_empty() {
            return Err(BackendError::invalid_argument(
                "stream allocation needs at least one stream and one endpoint",
            ));
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        self.host
            .alloc_streams(&entry.resource, num_streams, endpoints)
            .map_err(capability("bulk streams"))
    }

    pub fn free_streams(&self, handle: HandleId, endpoints: &[u8]) -> Result<()> {
        if endpoints.is_empty() {
            return Err(BackendError::invalid_argument(
                "freeing streams needs at least one endpoint",
            ));
        }
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        self.host
            .free_streams(&entry.resource, endpoints)
            .map_err(capability("bulk streams"))
    }

    pub fn kernel_driver_active(&self, handle: HandleId, interface: u8) -> Result<bool> {
        check_interface(interface)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        self.host
            .kernel_driver_active(&entry.resource, interface)
            .map_err(capability("kernel driver queries"))
    }

    pub fn detach_kernel_driver(&self, handle: HandleId, interface: u8) -> Result<()> {
        check_interface(interface)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        self.host
            .detach_kernel_driver(&entry.resource, interface)
            .map_err(capability("kernel driver detach"))
    }

    pub fn attach_kernel_driver(&self, handle: HandleId, interface: u8) -> Result<()> {
        check_interface(interface)?;
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;
        self.host
            .attach_kernel_driver(&entry.resource, interface)
            .map_err(capability("kernel driver attach"))
    }

    // ------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------

    pub fn new_transfer(
        &self,
        handle: HandleId,
        kind: TransferKind,
        setup: Option<TransferSetup>,
        buffer_size: u32,
        options: TransferOptions,
    ) -> Result<TransferId> {
        let request = TransferRequest {
            kind,
            setup,
            buffer_size,
            options,
        };
        validate_request(&request)?;

        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = connected_handle(&inner.devices, &mut inner.handles, handle)?;

        let resource = self
            .host
            .new_transfer(&entry.resource, &request)
            .map_err(capability("transfer type"))?;
        let id = inner
            .transfers
            .register(TransferRecord::new(resource, handle, request));

        debug!(
            "Created {:?} on {:?}: {:?}, {} byte buffer",
            id, handle, kind, buffer_size
        );
        Ok(id)
    }

    /// Start a transfer; `data` is the OUT payload and must be empty for IN
    pub fn submit_transfer(&self, transfer: TransferId, data: &[u8]) -> Result<()> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let record = inner.transfers.resolve_mut(transfer)?;
        record.check_submit(data)?;
        let handle = inner.handles.resolve(record.handle)?;
        inner.devices.connected(handle.device)?;

        let completion = self
            .host
            .submit_transfer(&mut record.resource, data)
            .map_err(capability("transfer type"))?;
        record.mark_submitted(completion);

        debug!("Submitted {:?} ({} byte payload)", transfer, data.len());
        Ok(())
    }

    /// Create and submit a libusb-shaped transfer in one step
    pub fn submit_raw(&self, handle: HandleId, raw: &RawTransfer) -> Result<TransferId> {
        let (request, payload) = raw.decode()?;
        let id = self.new_transfer(
            handle,
            request.kind,
            request.setup,
            request.buffer_size,
            request.options,
        )?;

        if let Err(e) = self.submit_transfer(id, payload) {
            let _ = self.destroy_transfer(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Suspend until the transfer reaches a terminal state
    ///
    /// Only one await per transfer may be outstanding. Dropping the returned
    /// future before it resolves leaves the transfer submitted and
    /// awaitable again.
    pub async fn await_transfer(&self, transfer: TransferId) -> Result<TransferOutcome> {
        let completion = {
            let mut inner = self.lock();
            match inner.transfers.resolve_mut(transfer)?.begin_await()? {
                AwaitStart::Ready(outcome) => return Ok(outcome),
                AwaitStart::Pending(completion) => completion,
            }
        };

        let mut pending = AwaitGuard {
            inner: Arc::clone(&self.inner),
            id: transfer,
            completion: Some(completion),
        };
        let result = match pending.completion.as_mut() {
            Some(completion) => completion.await,
            None => Err(HostError::Io),
        };
        pending.completion = None;
        drop(pending);

        let mut inner = self.lock();
        let outcome = inner.transfers.resolve_mut(transfer)?.finish(result);
        debug!(
            "{:?} finished: {:?}/{:?}, {} byte(s)",
            transfer,
            outcome.state,
            outcome.status,
            outcome.actual_length()
        );
        Ok(outcome)
    }

    /// Ask the host to abort a submitted transfer
    ///
    /// The transfer still has to be awaited (or collected by
    /// [`handle_events`](Self::handle_events)) to observe `Cancelled`.
    pub fn cancel_transfer(&self, transfer: TransferId) -> Result<()> {
        let mut inner = self.lock();
        let record = inner.transfers.resolve_mut(transfer)?;
        record.check_cancel()?;

        match self.host.cancel_transfer(&mut record.resource) {
            // Already finished on the host side; the completion is waiting
            Ok(()) | Err(HostError::NotFound) => {
                record.mark_cancel_requested();
                debug!("Cancel requested for {:?}", transfer);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Release a transfer that is not in flight
    pub fn destroy_transfer(&self, transfer: TransferId) -> Result<()> {
        let mut inner = self.lock();
        inner.transfers.resolve(transfer)?.check_destroy()?;
        inner.transfers.release(transfer)?;
        debug!("Destroyed {:?}", transfer);
        Ok(())
    }

    pub fn transfer_state(&self, transfer: TransferId) -> Result<TransferState> {
        Ok(self.lock().transfers.resolve(transfer)?.state())
    }

    /// Outcome of a terminal transfer
    pub fn transfer_outcome(&self, transfer: TransferId) -> Result<Option<TransferOutcome>> {
        Ok(self.lock().transfers.resolve(transfer)?.outcome().cloned())
    }

    // ------------------------------------------------------------------
    // Event processing
    // ------------------------------------------------------------------

    /// Non-blocking event step
    ///
    /// Pumps the hotplug queue and finishes every submitted transfer nobody
    /// is awaiting whose completion has arrived.
    pub fn handle_events(&self) -> Vec<CompletedTransfer> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner
            .hotplug
            .pump(&*self.host, &mut inner.devices, &inner.settings.filters);

        inner
            .transfers
            .iter_mut()
            .filter_map(|(id, record)| {
                record
                    .try_complete()
                    .map(|outcome| CompletedTransfer::new(id, &outcome))
            })
            .collect()
    }

    /// Wait up to `timeout` for at least one un-awaited transfer to finish
    pub async fn wait_for_events(&self, timeout: Duration) -> Vec<CompletedTransfer> {
        let ready = self.handle_events();
        if !ready.is_empty() {
            return ready;
        }

        let inner = Arc::clone(&self.inner);
        let wait = poll_fn(move |cx| {
            let mut guard = lock(&inner);
            let done: Vec<CompletedTransfer> = guard
                .transfers
                .iter_mut()
                .filter_map(|(id, record)| match record.poll_complete(cx) {
                    Poll::Ready(outcome) => Some(CompletedTransfer::new(id, &outcome)),
                    Poll::Pending => None,
                })
                .collect();

            if done.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(done)
            }
        });

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_default()
    }
}

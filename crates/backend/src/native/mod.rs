//! Native USB host backed by libusb
//!
//! [`NativeHost`] implements the host interface over `rusb`. Device
//! management calls run inline; transfers run on their own blocking threads
//! and report back through their completions. Open handles are shared
//! between those threads behind an `RwLock`: transfer slices take the read
//! side, configuration changes the write side. Writers wait at most
//! [`WRITE_LOCK_WAIT`] for running slices before giving up with `Busy`.

pub mod device;
pub mod hotplug;
pub mod transfers;

use device::{Identities, attachment, device_info, summarize_config};
use host::{
    Completer, Completion, ConfigDescriptor, ConfigValue, HostDevice, HostError, HostResult,
    HotplugDelivery, HotplugSink, TransferKind, TransferRequest, UsbHost, completion_pair,
};
use hotplug::EventThread;
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use transfers::{map_rusb_error, spawn_transfer};

/// Longest a configuration change waits for in-flight transfer slices
pub const WRITE_LOCK_WAIT: Duration = Duration::from_millis(250);

/// Take the write side of `lock`, giving up with `Busy` after `wait`
fn lock_for_write<T>(lock: &RwLock<T>, wait: Duration) -> HostResult<RwLockWriteGuard<'_, T>> {
    let started = Instant::now();
    loop {
        match lock.try_write() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) if started.elapsed() < wait => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(TryLockError::WouldBlock) => {
                warn!("Device handle still in use by transfers after {:?}", wait);
                return Err(HostError::Busy);
            }
        }
    }
}

/// Open device session
pub struct NativeHandle {
    handle: Arc<RwLock<DeviceHandle<Context>>>,
}

impl NativeHandle {
    fn read(&self) -> RwLockReadGuard<'_, DeviceHandle<Context>> {
        self.handle.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> HostResult<RwLockWriteGuard<'_, DeviceHandle<Context>>> {
        lock_for_write(&self.handle, WRITE_LOCK_WAIT)
    }
}

/// Allocated transfer
pub struct NativeTransfer {
    handle: Arc<RwLock<DeviceHandle<Context>>>,
    request: TransferRequest,
    cancel: Arc<AtomicBool>,
    completer: Option<Completer>,
}

/// libusb host
pub struct NativeHost {
    context: Context,
    identities: Identities,
    events: Mutex<Option<EventThread>>,
}

impl NativeHost {
    pub fn new() -> HostResult<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self {
            context,
            identities: Identities::default(),
            events: Mutex::new(None),
        })
    }

    fn find_config_by_value(
        &self,
        device: &Device<Context>,
        value: u8,
    ) -> HostResult<ConfigDescriptor> {
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;
        for index in 0..descriptor.num_configurations() {
            let config = device.config_descriptor(index).map_err(map_rusb_error)?;
            if config.number() == value {
                return Ok(summarize_config(&config));
            }
        }
        Err(HostError::NotFound)
    }
}

impl UsbHost for NativeHost {
    type Device = Device<Context>;
    type Handle = NativeHandle;
    type Transfer = NativeTransfer;

    fn list_devices(&self) -> HostResult<Vec<HostDevice<Device<Context>>>> {
        let devices = self.context.devices().map_err(map_rusb_error)?;
        let mut listed = Vec::new();
        let mut present = Vec::new();

        for device in devices.iter() {
            let info = match device_info(&device) {
                Ok(info) => info,
                Err(e) => {
                    warn!(
                        "Skipping device without descriptor (bus={}, addr={}): {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };
            let key = attachment(&device);
            present.push(key);
            let id = self.identities.resolve(key, &info, || device.clone());
            listed.push(HostDevice { id, info, device });
        }

        self.identities.retain(&present);
        debug!("Enumerated {} devices", listed.len());
        Ok(listed)
    }

    fn open(&self, device: &Device<Context>) -> HostResult<NativeHandle> {
        let handle = device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        debug!(
            "Opened device (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        Ok(NativeHandle {
            handle: Arc::new(RwLock::new(handle)),
        })
    }

    fn close(&self, handle: NativeHandle) {
        // In-flight transfer threads keep their own reference; libusb
        // closes the handle when the last one is dropped
        drop(handle);
        debug!("Closed device handle");
    }

    fn config_descriptor(
        &self,
        device: &Device<Context>,
        index: u8,
    ) -> HostResult<ConfigDescriptor> {
        device
            .config_descriptor(index)
            .map(|config| summarize_config(&config))
            .map_err(map_rusb_error)
    }

    fn config_descriptor_by_value(
        &self,
        device: &Device<Context>,
        value: u8,
    ) -> HostResult<ConfigDescriptor> {
        self.find_config_by_value(device, value)
    }

    fn active_config_descriptor(&self, device: &Device<Context>) -> HostResult<ConfigDescriptor> {
        device
            .active_config_descriptor()
            .map(|config| summarize_config(&config))
            .map_err(map_rusb_error)
    }

    fn get_configuration(&self, handle: &NativeHandle) -> HostResult<u8> {
        handle.read().active_configuration().map_err(map_rusb_error)
    }

    fn set_configuration(&self, handle: &NativeHandle, config: ConfigValue) -> HostResult<()> {
        let mut handle = handle.write()?;
        let result = match config {
            ConfigValue::Unconfigured => handle.unconfigure(),
            ConfigValue::Value(value) => handle.set_active_configuration(value),
        };
        result.map_err(map_rusb_error)
    }

    fn claim_interface(&self, handle: &NativeHandle, interface: u8) -> HostResult<()> {
        handle
            .write()?
            .claim_interface(interface)
            .map_err(map_rusb_error)?;
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn release_interface(&self, handle: &NativeHandle, interface: u8) -> HostResult<()> {
        handle
            .write()?
            .release_interface(interface)
            .map_err(map_rusb_error)?;
        debug!("Released interface {}", interface);
        Ok(())
    }

    fn set_interface_altsetting(
        &self,
        handle: &NativeHandle,
        interface: u8,
        alt_setting: u8,
    ) -> HostResult<()> {
        handle
            .write()?
            .set_alternate_setting(interface, alt_setting)
            .map_err(map_rusb_error)
    }

    fn clear_halt(&self, handle: &NativeHandle, endpoint: u8) -> HostResult<()> {
        handle.write()?.clear_halt(endpoint).map_err(map_rusb_error)
    }

    fn reset_device(&self, handle: &NativeHandle) -> HostResult<()> {
        handle.write()?.reset().map_err(map_rusb_error)?;
        debug!("Reset device");
        Ok(())
    }

    fn alloc_streams(
        &self,
        _handle: &NativeHandle,
        _num_streams: u32,
        _endpoints: &[u8],
    ) -> HostResult<u32> {
        Err(HostError::NotSupported)
    }

    fn free_streams(&self, _handle: &NativeHandle, _endpoints: &[u8]) -> HostResult<()> {
        Err(HostError::NotSupported)
    }

    fn kernel_driver_active(&self, handle: &NativeHandle, interface: u8) -> HostResult<bool> {
        handle
            .read()
            .kernel_driver_active(interface)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, handle: &NativeHandle, interface: u8) -> HostResult<()> {
        handle
            .write()?
            .detach_kernel_driver(interface)
            .map_err(map_rusb_error)?;
        debug!("Detached kernel driver from interface {}", interface);
        Ok(())
    }

    fn attach_kernel_driver(&self, handle: &NativeHandle, interface: u8) -> HostResult<()> {
        handle
            .write()?
            .attach_kernel_driver(interface)
            .map_err(map_rusb_error)?;
        debug!("Reattached kernel driver to interface {}", interface);
        Ok(())
    }

    fn new_transfer(
        &self,
        handle: &NativeHandle,
        request: &TransferRequest,
    ) -> HostResult<NativeTransfer> {
        // rusb has no asynchronous isochronous or stream API
        if matches!(
            request.kind,
            TransferKind::Isochronous | TransferKind::BulkStream
        ) {
            return Err(HostError::NotSupported);
        }

        Ok(NativeTransfer {
            handle: Arc::clone(&handle.handle),
            request: *request,
            cancel: Arc::new(AtomicBool::new(false)),
            completer: None,
        })
    }

    fn submit_transfer(&self, transfer: &mut NativeTransfer, data: &[u8]) -> HostResult<Completion> {
        let (completer, completion) = completion_pair();
        // Fresh flag per submission; earlier threads keep their own
        let cancel = Arc::new(AtomicBool::new(false));
        spawn_transfer(
            Arc::clone(&transfer.handle),
            transfer.request,
            data.to_vec(),
            Arc::clone(&cancel),
            completer.clone(),
        )?;
        transfer.cancel = cancel;
        transfer.completer = Some(completer);
        Ok(completion)
    }

    fn cancel_transfer(&self, transfer: &mut NativeTransfer) -> HostResult<()> {
        match &transfer.completer {
            Some(completer) if completer.complete(Err(HostError::Interrupted)) => {
                // The transfer thread stops at its next slice boundary
                transfer.cancel.store(true, Ordering::Release);
                debug!("Cancelled {:?} transfer", transfer.request.kind);
                Ok(())
            }
            _ => Err(HostError::NotFound),
        }
    }

    fn hotplug_delivery(&self) -> HotplugDelivery {
        if rusb::has_hotplug() {
            HotplugDelivery::Push
        } else {
            HotplugDelivery::Unsupported
        }
    }

    fn enable_hotplug(&self, sink: HotplugSink<Device<Context>>) -> HostResult<()> {
        if !rusb::has_hotplug() {
            return Err(HostError::NotSupported);
        }

        let mut events = self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if events.is_some() {
            return Ok(());
        }

        *events = Some(EventThread::start(
            self.context.clone(),
            sink,
            self.identities.clone(),
        )?);
        info!("Hot-plug callbacks registered");
        Ok(())
    }
}

impl Drop for NativeHost {
    fn drop(&mut self) {
        // Stop the event thread before the context goes away
        let events = self
            .events
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(events);
    }
}

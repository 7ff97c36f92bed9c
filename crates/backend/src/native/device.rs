//! Device snapshots and identities for the native host

use super::transfers::map_rusb_error;
use host::{ConfigDescriptor, DeviceInfo, DeviceSpeed, HostResult, ResourceId};
use rusb::{Context, Device, UsbContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Build a descriptor snapshot of a rusb device
pub fn device_info<T: UsbContext>(device: &Device<T>) -> HostResult<DeviceInfo> {
    let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

    Ok(DeviceInfo {
        bus_number: device.bus_number(),
        device_address: device.address(),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        speed: map_device_speed(device.speed()),
        num_configurations: descriptor.num_configurations(),
    })
}

/// Map rusb device speed to DeviceSpeed
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

pub fn summarize_config(config: &rusb::ConfigDescriptor) -> ConfigDescriptor {
    ConfigDescriptor {
        configuration_value: config.number(),
        num_interfaces: config.num_interfaces(),
        max_power_ma: config.max_power(),
        self_powered: config.self_powered(),
        remote_wakeup: config.remote_wakeup(),
    }
}

/// Attachment key of a listed device: its libusb device record
///
/// The record is only unique while referenced, so [`Identities`] pins it.
pub fn attachment<T: UsbContext>(device: &Device<T>) -> usize {
    device.as_raw() as usize
}

struct Identity<P> {
    id: ResourceId,
    info: DeviceInfo,
    _pin: P,
}

struct IdentityState<P> {
    next: u64,
    by_attachment: HashMap<usize, Identity<P>>,
}

/// Stable [`ResourceId`]s for attached devices
///
/// Identities follow libusb's per-attachment device record, not bus and
/// address: a device replugged at the same location between two listings
/// gets a fresh record and so a fresh id. Each entry holds `P` (a device
/// reference) so libusb cannot free and reuse the record while it is known.
pub struct Identities<P = Device<Context>> {
    state: Arc<Mutex<IdentityState<P>>>,
}

impl<P> Clone for Identities<P> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<P> Default for Identities<P> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(IdentityState {
                next: 0,
                by_attachment: HashMap::new(),
            })),
        }
    }
}

impl<P> Identities<P> {
    fn lock(&self) -> MutexGuard<'_, IdentityState<P>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Identity of the attachment, assigning one on first sight
    pub fn resolve(
        &self,
        attachment: usize,
        info: &DeviceInfo,
        pin: impl FnOnce() -> P,
    ) -> ResourceId {
        let mut state = self.lock();
        if let Some(known) = state.by_attachment.get(&attachment) {
            return known.id;
        }

        state.next += 1;
        let id = ResourceId(state.next);
        state.by_attachment.insert(
            attachment,
            Identity {
                id,
                info: info.clone(),
                _pin: pin(),
            },
        );
        id
    }

    /// Retire the identity of a departed attachment
    pub fn retire(&self, attachment: usize) -> Option<(ResourceId, DeviceInfo)> {
        self.lock()
            .by_attachment
            .remove(&attachment)
            .map(|identity| (identity.id, identity.info))
    }

    /// Retire every identity whose attachment is not in `present`
    pub fn retain(&self, present: &[usize]) {
        self.lock()
            .by_attachment
            .retain(|attachment, _| present.contains(attachment));
    }
}

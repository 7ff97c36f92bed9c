//! Host interface record types
//!
//! Strongly typed inputs and outputs of the host interface: device
//! snapshots, transfer descriptions, configuration values and hotplug
//! records.

use serde::{Deserialize, Serialize};

/// Host-assigned identity of one physical arrival of a device
///
/// Two listings of the same attached device report the same `ResourceId`.
/// A device that leaves and comes back gets a fresh one, even when the
/// platform reuses its bus number and address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

/// Snapshot of a device's identifying descriptor fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Bus number on the host
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// USB device class
    pub class: u8,
    /// USB device subclass
    pub subclass: u8,
    /// USB device protocol
    pub protocol: u8,
    /// Device speed
    pub speed: DeviceSpeed,
    /// Number of configurations
    pub num_configurations: u8,
}

impl DeviceInfo {
    /// Minimal snapshot carrying only bus/address and VID:PID
    pub fn new(bus_number: u8, device_address: u8, vendor_id: u16, product_id: u16) -> Self {
        Self {
            bus_number,
            device_address,
            vendor_id,
            product_id,
            class: 0,
            subclass: 0,
            protocol: 0,
            speed: DeviceSpeed::Unknown,
            num_configurations: 1,
        }
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSpeed {
    /// Not reported by the host
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// A device as listed by the host: identity, snapshot and owned resource
#[derive(Debug)]
pub struct HostDevice<D> {
    /// Identity of this arrival
    pub id: ResourceId,
    /// Descriptor snapshot
    pub info: DeviceInfo,
    /// Opaque host resource
    pub device: D,
}

/// Kind of USB transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Control transfer (needs a setup record)
    Control,
    /// Bulk transfer
    Bulk,
    /// Interrupt transfer
    Interrupt,
    /// Isochronous transfer (needs at least one packet)
    Isochronous,
    /// USB 3 bulk stream transfer (needs a stream id)
    BulkStream,
}

/// Control transfer setup record (without `wLength`, which is the buffer size)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSetup {
    /// bmRequestType
    pub bm_request_type: u8,
    /// bRequest
    pub b_request: u8,
    /// wValue
    pub w_value: u16,
    /// wIndex
    pub w_index: u16,
}

impl TransferSetup {
    /// Whether the data stage flows device-to-host
    pub fn is_in(&self) -> bool {
        self.bm_request_type & 0x80 != 0
    }
}

/// Per-transfer options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOptions {
    /// Endpoint address (bit 7 set for IN)
    pub endpoint: u8,
    /// Timeout in milliseconds, 0 waits forever
    pub timeout_ms: u32,
    /// Stream id for bulk stream transfers
    pub stream_id: u32,
    /// Number of isochronous packets
    pub iso_packets: u32,
}

/// Everything the host needs to allocate a transfer resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRequest {
    pub kind: TransferKind,
    pub setup: Option<TransferSetup>,
    pub buffer_size: u32,
    pub options: TransferOptions,
}

impl TransferRequest {
    /// Whether data flows device-to-host
    ///
    /// Control transfers take the direction from `bmRequestType`, every
    /// other kind from the endpoint address.
    pub fn is_in(&self) -> bool {
        match (self.kind, self.setup) {
            (TransferKind::Control, Some(setup)) => setup.is_in(),
            _ => self.options.endpoint & 0x80 != 0,
        }
    }
}

/// Value passed to set-configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigValue {
    /// Put the device in the unconfigured state
    Unconfigured,
    /// Select the configuration with this `bConfigurationValue`
    Value(u8),
}

impl ConfigValue {
    /// Raw value as understood by set-configuration (0 = unconfigured)
    pub fn raw(self) -> u8 {
        match self {
            ConfigValue::Unconfigured => 0,
            ConfigValue::Value(value) => value,
        }
    }
}

/// Summary of a configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDescriptor {
    /// bConfigurationValue
    pub configuration_value: u8,
    /// bNumInterfaces
    pub num_interfaces: u8,
    /// Maximum power draw in mA
    pub max_power_ma: u16,
    pub self_powered: bool,
    pub remote_wakeup: bool,
}

/// Direction of a hotplug notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HotplugKind {
    Arrived,
    Left,
}

/// Hotplug notification as produced by the host
#[derive(Debug)]
pub enum HostHotplugEvent<D> {
    /// A device was attached
    Arrived(HostDevice<D>),
    /// A device was detached
    Left {
        /// Identity of the departed arrival
        id: ResourceId,
        /// Last known snapshot
        info: DeviceInfo,
    },
}

impl<D> HostHotplugEvent<D> {
    pub fn kind(&self) -> HotplugKind {
        match self {
            HostHotplugEvent::Arrived(_) => HotplugKind::Arrived,
            HostHotplugEvent::Left { .. } => HotplugKind::Left,
        }
    }
}

/// How the host delivers hotplug notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HotplugDelivery {
    /// No hotplug support at all
    Unsupported,
    /// Host invokes the sink spontaneously
    Push,
    /// Host must be polled
    Poll,
    /// Host does both
    Both,
}

impl HotplugDelivery {
    pub fn is_supported(self) -> bool {
        self != HotplugDelivery::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_direction_from_request_type() {
        let request = TransferRequest {
            kind: TransferKind::Control,
            setup: Some(TransferSetup {
                bm_request_type: 0x80,
                b_request: 0x06,
                w_value: 0x0100,
                w_index: 0,
            }),
            buffer_size: 18,
            // Endpoint bit is ignored for control transfers
            options: TransferOptions::default(),
        };
        assert!(request.is_in());
    }

    #[test]
    fn test_endpoint_direction() {
        let mut request = TransferRequest {
            kind: TransferKind::Bulk,
            setup: None,
            buffer_size: 512,
            options: TransferOptions {
                endpoint: 0x81,
                ..Default::default()
            },
        };
        assert!(request.is_in());

        request.options.endpoint = 0x01;
        assert!(!request.is_in());
    }

    #[test]
    fn test_config_value_raw() {
        assert_eq!(ConfigValue::Unconfigured.raw(), 0);
        assert_eq!(ConfigValue::Value(2).raw(), 2);
    }

    #[test]
    fn test_hotplug_delivery() {
        assert!(!HotplugDelivery::Unsupported.is_supported());
        assert!(HotplugDelivery::Push.is_supported());
        assert!(HotplugDelivery::Both.is_supported());
    }
}

//! usb-bridge
//!
//! Runs a conventional OS-USB-backend contract (enumerate, open/close,
//! claim/release, submit/cancel, process events) against a capability-style
//! asynchronous [`UsbHost`](host::UsbHost).
//!
//! The pieces, leaves first:
//!
//! - [`registry`]: generation-checked tables mapping client handles to host
//!   resources
//! - [`engine`]: the per-transfer state machine
//! - [`hotplug`]: one ordered queue over push and poll hotplug delivery
//! - [`backend`]: the [`Backend`] facade tying them together
//! - [`native`]: a libusb host built on `rusb`
//!
//! # Example
//!
//! ```
//! use common::test_utils::{MockHost, create_mock_device_info};
//! use std::sync::Arc;
//! use usb_bridge::{Backend, BackendSettings};
//!
//! let host = Arc::new(MockHost::new());
//! host.plug(create_mock_device_info(1, 2, 0x1234, 0x5678));
//!
//! let backend = Backend::new(host, BackendSettings::default());
//! backend.init().unwrap();
//!
//! let devices = backend.get_device_list().unwrap();
//! let handle = backend.open(devices[0]).unwrap();
//! backend.claim_interface(handle, 0).unwrap();
//! backend.close(handle).unwrap();
//! backend.exit();
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod hotplug;
pub mod native;
pub mod registry;

pub use backend::{Backend, BackendOption, BackendSettings, LogLevel, ResourceCounts};
pub use config::BridgeConfig;
pub use engine::{
    CompletedTransfer, RawTransfer, TransferOutcome, TransferState, TransferStatus,
};
pub use error::{BackendError, ContractViolation, Result};
pub use hotplug::HotplugEvent;
pub use native::NativeHost;
pub use registry::{DeviceId, HandleId, TransferId};

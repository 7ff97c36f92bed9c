//! Host interface contract for usb-bridge
//!
//! This crate defines the capability-based USB host interface the bridge
//! binds to: the [`UsbHost`] trait, its typed request/response records, the
//! fixed [`HostError`] enumeration and the [`Completion`] future through which
//! a host reports that a submitted transfer has finished.
//!
//! # Example
//!
//! ```
//! use host::{completion_pair, HostError};
//!
//! let (completer, mut completion) = completion_pair();
//! assert!(completion.try_take().is_none());
//!
//! completer.complete(Err(HostError::Timeout));
//! assert_eq!(completion.try_take(), Some(Err(HostError::Timeout)));
//! ```

pub mod completion;
pub mod error;
pub mod interface;
pub mod setup;
pub mod types;

pub use completion::{Completer, Completion, completion_pair};
pub use error::{HostError, HostResult};
pub use interface::{HotplugSink, UsbHost};
pub use setup::{SETUP_PACKET_SIZE, SetupPacket};
pub use types::{
    ConfigDescriptor, ConfigValue, DeviceInfo, DeviceSpeed, HostDevice, HostHotplugEvent,
    HotplugDelivery, HotplugKind, ResourceId, TransferKind, TransferOptions, TransferRequest,
    TransferSetup,
};

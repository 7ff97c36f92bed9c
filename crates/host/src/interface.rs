//! The host interface contract
//!
//! A host hands out three kinds of opaque owned resources: devices, open
//! device handles and transfers. Dropping a resource releases it on the
//! host side; [`UsbHost::close`] consumes a handle explicitly.
//!
//! All methods take `&self`: hosts keep whatever interior state they need
//! and may be shared between the facade and the threads they run.

use crate::completion::Completion;
use crate::error::HostResult;
use crate::types::{
    ConfigDescriptor, ConfigValue, HostDevice, HostHotplugEvent, HotplugDelivery,
    TransferRequest,
};
use async_channel::{Receiver, Sender};

/// Push side of the hotplug queue handed to the host
pub struct HotplugSink<D> {
    tx: Sender<HostHotplugEvent<D>>,
}

impl<D> HotplugSink<D> {
    /// Sink backed by a fresh unbounded queue, with its receiving end
    pub fn unbounded() -> (Self, Receiver<HostHotplugEvent<D>>) {
        let (tx, rx) = async_channel::unbounded();
        (Self { tx }, rx)
    }

    /// Enqueue an event; returns `false` once the receiving side is gone
    pub fn push(&self, event: HostHotplugEvent<D>) -> bool {
        self.tx.try_send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<D> Clone for HotplugSink<D> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Capability-style USB host interface
pub trait UsbHost: Send + Sync + 'static {
    /// Opaque device resource
    type Device: Send + 'static;
    /// Opaque open-handle resource
    type Handle: Send + 'static;
    /// Opaque transfer resource
    type Transfer: Send + 'static;

    /// Prepare the host for use
    fn init(&self) -> HostResult<()> {
        Ok(())
    }

    /// List the devices currently attached
    fn list_devices(&self) -> HostResult<Vec<HostDevice<Self::Device>>>;

    /// Open a session on a device
    fn open(&self, device: &Self::Device) -> HostResult<Self::Handle>;

    /// Close a session
    fn close(&self, handle: Self::Handle);

    fn config_descriptor(&self, device: &Self::Device, index: u8) -> HostResult<ConfigDescriptor>;

    fn config_descriptor_by_value(
        &self,
        device: &Self::Device,
        value: u8,
    ) -> HostResult<ConfigDescriptor>;

    fn active_config_descriptor(&self, device: &Self::Device) -> HostResult<ConfigDescriptor>;

    fn get_configuration(&self, handle: &Self::Handle) -> HostResult<u8>;

    fn set_configuration(&self, handle: &Self::Handle, config: ConfigValue) -> HostResult<()>;

    fn claim_interface(&self, handle: &Self::Handle, interface: u8) -> HostResult<()>;

    fn release_interface(&self, handle: &Self::Handle, interface: u8) -> HostResult<()>;

    fn set_interface_altsetting(
        &self,
        handle: &Self::Handle,
        interface: u8,
        alt_setting: u8,
    ) -> HostResult<()>;

    fn clear_halt(&self, handle: &Self::Handle, endpoint: u8) -> HostResult<()>;

    fn reset_device(&self, handle: &Self::Handle) -> HostResult<()>;

    /// Allocate bulk streams; returns the number actually allocated
    fn alloc_streams(
        &self,
        handle: &Self::Handle,
        num_streams: u32,
        endpoints: &[u8],
    ) -> HostResult<u32>;

    fn free_streams(&self, handle: &Self::Handle, endpoints: &[u8]) -> HostResult<()>;

    fn kernel_driver_active(&self, handle: &Self::Handle, interface: u8) -> HostResult<bool>;

    fn detach_kernel_driver(&self, handle: &Self::Handle, interface: u8) -> HostResult<()>;

    fn attach_kernel_driver(&self, handle: &Self::Handle, interface: u8) -> HostResult<()>;

    /// Allocate a transfer resource sized to `request.buffer_size`
    fn new_transfer(
        &self,
        handle: &Self::Handle,
        request: &TransferRequest,
    ) -> HostResult<Self::Transfer>;

    /// Start a transfer; `data` is the OUT payload (empty for IN)
    fn submit_transfer(&self, transfer: &mut Self::Transfer, data: &[u8])
    -> HostResult<Completion>;

    /// Ask the host to abort a submitted transfer
    ///
    /// The transfer's [`Completion`] still resolves, normally with
    /// [`HostError::Interrupted`](crate::HostError::Interrupted).
    fn cancel_transfer(&self, transfer: &mut Self::Transfer) -> HostResult<()>;

    /// Which hotplug delivery modes the host offers
    fn hotplug_delivery(&self) -> HotplugDelivery {
        HotplugDelivery::Unsupported
    }

    /// Register interest in hotplug events; push hosts keep the sink
    fn enable_hotplug(&self, sink: HotplugSink<Self::Device>) -> HostResult<()> {
        let _ = sink;
        Err(crate::HostError::NotSupported)
    }

    /// Drain events from a poll-mode host
    fn poll_hotplug(&self) -> Vec<HostHotplugEvent<Self::Device>> {
        Vec::new()
    }
}

//! Hotplug bridge
//!
//! Hosts deliver arrivals and removals either by pushing them into a
//! [`HotplugSink`] from their own threads or by being polled. Both paths end
//! up in one ordered queue here; the facade pumps it into the device table
//! and hands the resulting [`HotplugEvent`]s to the client.

use crate::config::check_filter;
use crate::device::DeviceTable;
use crate::registry::DeviceId;
use async_channel::Receiver;
use host::{DeviceInfo, HostHotplugEvent, HotplugDelivery, HotplugKind, HotplugSink, UsbHost};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

/// Arrival or removal as seen by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HotplugEvent {
    pub kind: HotplugKind,
    pub info: DeviceInfo,
    #[serde(skip)]
    pub device: DeviceId,
}

/// Hotplug queue state for one backend instance
pub struct HotplugBridge<D> {
    delivery: HotplugDelivery,
    rx: Option<Receiver<HostHotplugEvent<D>>>,
    pending: VecDeque<HotplugEvent>,
}

impl<D> Default for HotplugBridge<D> {
    fn default() -> Self {
        Self {
            delivery: HotplugDelivery::Unsupported,
            rx: None,
            pending: VecDeque::new(),
        }
    }
}

impl<D> HotplugBridge<D> {
    pub fn is_enabled(&self) -> bool {
        self.rx.is_some()
    }

    /// Create the queue; returns the sink to hand to the host
    pub fn enable(&mut self, delivery: HotplugDelivery) -> HotplugSink<D> {
        let (sink, rx) = HotplugSink::unbounded();
        self.delivery = delivery;
        self.rx = Some(rx);
        sink
    }

    pub fn disable(&mut self) {
        if let Some(rx) = self.rx.take() {
            rx.close();
        }
        self.pending.clear();
    }

    /// Collect raw host events in arrival order
    ///
    /// Hosts offering both deliveries are only read through the sink.
    fn collect<H>(&self, host: &H) -> Vec<HostHotplugEvent<D>>
    where
        H: UsbHost<Device = D>,
    {
        let Some(rx) = &self.rx else {
            return Vec::new();
        };

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        if self.delivery == HotplugDelivery::Poll {
            events.extend(host.poll_hotplug());
        }
        events
    }

    /// Apply every queued host event to the device table
    pub fn pump<H>(&mut self, host: &H, devices: &mut DeviceTable<D>, filters: &[String])
    where
        H: UsbHost<Device = D>,
    {
        for event in self.collect(host) {
            match event {
                HostHotplugEvent::Arrived(device) => {
                    let info = device.info.clone();
                    if !check_filter(info.vendor_id, info.product_id, filters) {
                        debug!(
                            "Arrival ignored by filter: bus={}, addr={}, vid={:#06x}, pid={:#06x}",
                            info.bus_number, info.device_address, info.vendor_id, info.product_id
                        );
                        continue;
                    }

                    let id = devices.observe(device);
                    debug!(
                        "Device arrived: {:?} (bus={}, addr={})",
                        id, info.bus_number, info.device_address
                    );
                    self.pending.push_back(HotplugEvent {
                        kind: HotplugKind::Arrived,
                        info,
                        device: id,
                    });
                }
                HostHotplugEvent::Left { id, info } => match devices.depart(id) {
                    Some((device, info)) => {
                        debug!(
                            "Device left: {:?} (bus={}, addr={})",
                            device, info.bus_number, info.device_address
                        );
                        self.pending.push_back(HotplugEvent {
                            kind: HotplugKind::Left,
                            info,
                            device,
                        });
                    }
                    None => {
                        debug!(
                            "Dropping removal of unobserved device (bus={}, addr={})",
                            info.bus_number, info.device_address
                        );
                    }
                },
            }
        }
    }

    /// Take every client event queued since the last call
    pub fn drain(&mut self) -> Vec<HotplugEvent> {
        self.pending.drain(..).collect()
    }
}

//! libusb hotplug delivery
//!
//! libusb only invokes hotplug callbacks from inside `handle_events`, so
//! enabling hotplug starts a dedicated event thread. The thread owns the
//! callback registration and keeps pumping libusb until the host shuts it
//! down.

use super::device::{Identities, attachment, device_info};
use super::transfers::map_rusb_error;
use host::{HostDevice, HostError, HostHotplugEvent, HostResult, HotplugSink};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Event loop timeout, bounding how long shutdown waits
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Forwards libusb hotplug callbacks into the bridge's sink
struct HotplugCallback {
    sink: HotplugSink<Device<Context>>,
    identities: Identities,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        let info = match device_info(&device) {
            Ok(info) => info,
            Err(e) => {
                debug!(
                    "Hot-plug: ignoring arrival without descriptor (bus={}, addr={}): {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                return;
            }
        };

        let id = self
            .identities
            .resolve(attachment(&device), &info, || device.clone());
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={}, id={:?})",
            info.bus_number, info.device_address, id
        );
        self.sink
            .push(HostHotplugEvent::Arrived(HostDevice { id, info, device }));
    }

    fn device_left(&mut self, device: Device<Context>) {
        let (bus, address) = (device.bus_number(), device.address());
        let Some((id, info)) = self.identities.retire(attachment(&device)) else {
            debug!(
                "Hot-plug callback: unknown device left (bus={}, addr={})",
                bus, address
            );
            return;
        };

        debug!(
            "Hot-plug callback: device left (bus={}, addr={}, id={:?})",
            bus, address, id
        );
        self.sink.push(HostHotplugEvent::Left { id, info });
    }
}

/// Running hotplug event thread
pub struct EventThread {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventThread {
    /// Register the hotplug callback and start pumping libusb events
    ///
    /// Returns once the registration has succeeded or failed.
    pub fn start(
        context: Context,
        sink: HotplugSink<Device<Context>>,
        identities: Identities,
    ) -> HostResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::clone(&shutdown);

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || {
                let callback = HotplugCallback { sink, identities };
                let registration = match HotplugBuilder::new()
                    .enumerate(false)
                    .register(&context, Box::new(callback))
                {
                    Ok(registration) => {
                        let _ = ready_tx.send(Ok(()));
                        registration
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(map_rusb_error(e)));
                        return;
                    }
                };

                info!("USB event thread started");
                run_event_loop(&context, &stop);
                drop(registration);
                info!("USB event thread stopped");
            })
            .map_err(|e| {
                warn!("Failed to spawn USB event thread: {}", e);
                HostError::NoMem
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shutdown,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(HostError::Other)
            }
        }
    }
}

impl Drop for EventThread {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("USB event thread panicked");
        }
    }
}

fn run_event_loop(context: &Context, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::SeqCst) {
        match context.handle_events(Some(EVENT_TIMEOUT)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }
}

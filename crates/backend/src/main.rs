//! usb-bridge
//!
//! Operator front end for the bridge: lists devices, reads their device
//! descriptors through control transfers and watches hotplug traffic, all
//! through the backend facade over the native libusb host.

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use common::setup_logging;
use host::{DeviceInfo, HotplugKind, TransferKind, TransferOptions, TransferSetup};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use usb_bridge::{
    Backend, BackendError, BackendSettings, BridgeConfig, DeviceId, NativeHost, TransferStatus,
};

/// GET_DESCRIPTOR(Device) request
const DEVICE_DESCRIPTOR_REQUEST: TransferSetup = TransferSetup {
    bm_request_type: 0x80,
    b_request: 0x06,
    w_value: 0x0100,
    w_index: 0,
};
const DEVICE_DESCRIPTOR_LENGTH: u32 = 18;

/// Hotplug queue poll interval in watch mode
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "usb-bridge")]
#[command(
    author,
    version,
    about = "USB bridge - drive an OS-backend USB contract over a host interface"
)]
#[command(long_about = "
Runs the bridge over the native libusb host and exercises it from the
command line.

EXAMPLES:
    # List USB devices
    usb-bridge --list-devices

    # List devices as JSON, including their device descriptors
    usb-bridge --list-devices --descriptor --json

    # Print arrivals and removals for 60 seconds
    usb-bridge --watch-hotplug 60

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-bridge/bridge.toml
    3. /etc/usb-bridge/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices (the default when not watching hotplug)
    #[arg(long)]
    list_devices: bool,

    /// Read each listed device's device descriptor
    #[arg(long)]
    descriptor: bool,

    /// Print output as JSON
    #[arg(long)]
    json: bool,

    /// Print hotplug events for SECS seconds (0 = until Ctrl+C)
    #[arg(long, value_name = "SECS")]
    watch_hotplug: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[derive(serde::Serialize)]
struct DeviceReport {
    #[serde(flatten)]
    info: DeviceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    descriptor: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        usb_bridge::config::load_config(path).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.bridge.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let host = NativeHost::new()
        .map_err(common::Error::from)
        .context("Failed to initialize libusb")?;
    let backend = Backend::new(Arc::new(host), BackendSettings::from(&config));
    backend.init().context("Failed to initialize backend")?;

    let mut result = Ok(());
    if args.list_devices || args.watch_hotplug.is_none() {
        result = list_devices_mode(
            &backend,
            args.descriptor,
            args.json,
            config.usb.default_timeout_ms,
        )
        .await;
    }
    if let Some(secs) = args.watch_hotplug
        && result.is_ok()
    {
        result = watch_hotplug_mode(&backend, secs, args.json).await;
    }

    info!("Shutting down backend...");
    backend.exit();
    result
}

/// List USB devices and exit
async fn list_devices_mode(
    backend: &Backend<NativeHost>,
    descriptor: bool,
    json: bool,
    timeout_ms: u32,
) -> Result<()> {
    info!("Listing USB devices...");
    let devices = backend
        .get_device_list()
        .context("Failed to enumerate devices")?;

    let mut reports = Vec::with_capacity(devices.len());
    for device in &devices {
        let info = backend.device_info(*device)?;
        let descriptor = if descriptor {
            match read_device_descriptor(backend, *device, timeout_ms).await {
                Ok(bytes) => Some(hex(&bytes)),
                Err(e) => {
                    warn!(
                        "Could not read descriptor of {:04x}:{:04x}: {}",
                        info.vendor_id, info.product_id, e
                    );
                    None
                }
            }
        } else {
            None
        };
        reports.push(DeviceReport { info, descriptor });
    }

    for device in devices {
        if let Err(e) = backend.unref_device(device) {
            warn!("Failed to release device reference: {}", e);
        }
    }

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&reports).context("Failed to serialize device list")?
        );
        return Ok(());
    }

    if reports.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", reports.len());
    for report in reports {
        let info = &report.info;
        println!(
            "  {:04x}:{:04x} class {:02x}/{:02x}/{:02x}",
            info.vendor_id, info.product_id, info.class, info.subclass, info.protocol
        );
        println!(
            "      Bus {:03} Device {:03} Speed: {:?}",
            info.bus_number, info.device_address, info.speed
        );
        if let Some(descriptor) = &report.descriptor {
            println!("      Descriptor: {}", descriptor);
        }
        println!();
    }

    Ok(())
}

/// Read the 18-byte device descriptor through a control transfer
async fn read_device_descriptor(
    backend: &Backend<NativeHost>,
    device: DeviceId,
    timeout_ms: u32,
) -> Result<Bytes> {
    let handle = backend.open(device).context("Failed to open device")?;

    let outcome: Result<_, BackendError> = async {
        let transfer = backend.new_transfer(
            handle,
            TransferKind::Control,
            Some(DEVICE_DESCRIPTOR_REQUEST),
            DEVICE_DESCRIPTOR_LENGTH,
            TransferOptions {
                timeout_ms,
                ..Default::default()
            },
        )?;

        if let Err(e) = backend.submit_transfer(transfer, &[]) {
            let _ = backend.destroy_transfer(transfer);
            return Err(e);
        }
        let outcome = backend.await_transfer(transfer).await;
        backend.destroy_transfer(transfer)?;
        outcome
    }
    .await;

    if let Err(e) = backend.close(handle) {
        warn!("Failed to close device: {}", e);
    }

    let outcome = outcome.context("Descriptor transfer failed")?;
    if outcome.status != TransferStatus::Success {
        anyhow::bail!("Descriptor transfer ended with {:?}", outcome.status);
    }
    Ok(outcome.data)
}

/// Print hotplug events until the deadline or Ctrl+C
async fn watch_hotplug_mode(backend: &Backend<NativeHost>, secs: u64, json: bool) -> Result<()> {
    backend
        .enable_hotplug()
        .context("Hotplug is not available on this host")?;

    if secs == 0 {
        info!("Watching hotplug events, press Ctrl+C to stop");
    } else {
        info!("Watching hotplug events for {} seconds", secs);
    }

    let deadline = async {
        if secs == 0 {
            std::future::pending::<()>().await
        } else {
            tokio::time::sleep(Duration::from_secs(secs)).await
        }
    };
    tokio::pin!(deadline);

    let mut ticker = tokio::time::interval(WATCH_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in backend.poll_events() {
                    if json {
                        match serde_json::to_string(&event) {
                            Ok(line) => println!("{}", line),
                            Err(e) => error!("Failed to serialize event: {}", e),
                        }
                        continue;
                    }
                    let verb = match event.kind {
                        HotplugKind::Arrived => "arrived",
                        HotplugKind::Left => "left",
                    };
                    println!(
                        "{:04x}:{:04x} {} (bus {:03} device {:03})",
                        event.info.vendor_id,
                        event.info.product_id,
                        verb,
                        event.info.bus_number,
                        event.info.device_address
                    );
                }
            }
            _ = &mut deadline => {
                info!("Watch period elapsed");
                break;
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                break;
            }
        }
    }

    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect::<Vec<_>>()
        .join(" ")
}

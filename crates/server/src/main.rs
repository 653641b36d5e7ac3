//! usbip-server-rs
//!
//! Exports Linux USB devices over the network using the USB/IP wire
//! protocol, so a remote `usbip attach` can claim them as if local.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use usbip_server::capture::{CaptureSink, FileCaptureSink, NullSink};
use usbip_server::registry::{DeviceFilter, DeviceRegistry, RusbDeviceRegistry};
use usbip_server::{config, net};

#[derive(Parser, Debug)]
#[command(name = "usbip-server")]
#[command(
    author,
    version,
    about = "USB/IP Server - export USB devices over the network"
)]
#[command(long_about = "
Exports Linux USB devices over the network using the USB/IP wire protocol.

EXAMPLES:
    # Run with default config
    usbip-server

    # Run with custom config
    usbip-server --config /path/to/config.toml

    # List exportable USB devices without starting the server
    usbip-server --list-devices

    # Run with debug logging
    usbip-server --log-level debug

    # Capture raw protocol traffic to a file for offline inspection
    usbip-server --capture /tmp/usbip-capture.bin

CONFIGURATION:
    The server looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbip-server-rs/server.toml
    3. /etc/usbip-server-rs/server.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Append raw protocol traffic to this file for offline inspection
    #[arg(long, value_name = "PATH")]
    capture: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::ServerConfig::load(Some(path.clone())).context("failed to load configuration")?
    } else {
        config::ServerConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("failed to set up logging")?;

    info!("usbip-server-rs v{}", env!("CARGO_PKG_VERSION"));
    info!("log level: {}", log_level);

    let filters: Vec<DeviceFilter> = config
        .usb
        .filters
        .iter()
        .filter_map(|spec| {
            let filter = DeviceFilter::parse(spec);
            if filter.is_none() {
                tracing::warn!(spec, "ignoring unparseable device filter");
            }
            filter
        })
        .collect();
    let registry: Arc<dyn DeviceRegistry> =
        Arc::new(RusbDeviceRegistry::new(filters).context("failed to initialize USB context")?);

    if args.list_devices {
        return list_devices_mode(registry.as_ref());
    }

    let capture_path = args.capture.or(config.capture.path.clone());
    let capture: Arc<dyn CaptureSink> = match capture_path {
        Some(path) => {
            info!(path = %path.display(), "capturing raw protocol traffic");
            Arc::new(FileCaptureSink::open(&path).context("failed to open capture file")?)
        }
        None => Arc::new(NullSink),
    };

    let bind_addr: std::net::SocketAddr = config
        .server
        .bind_addr
        .parse()
        .context("invalid bind_addr in configuration")?;

    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = net::serve(bind_addr, registry, capture, serve_shutdown).await {
            error!(error = %e, "server exited with error");
        }
    });

    match signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!(error = %e, "error waiting for Ctrl+C"),
    }

    shutdown.cancel();
    let _ = server_task.await;
    info!("server shutdown complete");
    Ok(())
}

/// List exportable USB devices and exit.
fn list_devices_mode(registry: &dyn DeviceRegistry) -> Result<()> {
    let devices = registry.list_shared();
    if devices.is_empty() {
        println!("No USB devices found.");
    } else {
        println!("Found {} USB device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {} - {:04x}:{:04x} (class {:02x}/{:02x}/{:02x})",
                device.bus_id,
                device.vendor_id,
                device.product_id,
                device.device_class,
                device.device_subclass,
                device.device_protocol,
            );
            println!(
                "      Bus {:03} Device {:03}, speed code {}",
                device.bus_num, device.dev_num, device.speed
            );
        }
    }
    Ok(())
}

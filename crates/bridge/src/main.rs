//! usb-bridge
//!
//! Relays locally attached USB devices to a remote controller: registers the
//! host, advertises devices and executes the controller's transfer commands.

use anyhow::{Context, Result};
use bridge::usb::{RusbPlatform, UsbPlatform};
use bridge::{BridgeConfig, ConnectionManager, ConnectionState, HttpGatewayFactory, service};
use clap::Parser;
use common::{UsbDevice, create_platform_channel, setup_logging};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-bridge")]
#[command(
    author,
    version,
    about = "USB bridge - relay local USB devices to a remote controller"
)]
#[command(long_about = "
Registers this host with a controller, advertises the USB devices attached to
it and executes the control and bulk transfers the controller queues for them.

EXAMPLES:
    # Run with default config
    usb-bridge

    # Point at a specific controller
    usb-bridge --server-url https://controller.example.com/api

    # List bridgeable USB devices without connecting
    usb-bridge --list-devices

    # Run as systemd service
    usb-bridge --service

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
    config: Option<std::path::PathBuf>,

    /// Controller API base URL (overrides the config file)
    #[arg(short, long, value_name = "URL")]
    server_url: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service
    #[arg(long)]
    service: bool,

    /// List bridgeable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = BridgeConfig::load(args.config.clone()).context("Failed to load configuration")?;
    if let Some(url) = &args.server_url {
        BridgeConfig::validate_server_url(url)?;
        config.bridge.server_url = url.clone();
    }

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.bridge.log_level.clone());
    setup_logging(&log_level).context("Failed to setup logging")?;

    info!("usb-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let platform = Arc::new(
        RusbPlatform::new(config.usb.filters.clone()).context("Failed to initialize libusb")?,
    );

    if args.list_devices {
        return list_devices(&platform);
    }

    let service_mode = args.service || config.bridge.service_mode;
    run(config, platform, service_mode).await
}

/// List bridgeable USB devices and exit
fn list_devices(platform: &RusbPlatform) -> Result<()> {
    let devices = platform
        .bridgeable_devices()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No bridgeable USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        let info = device.info();
        println!(
            "  {:04x}:{:04x} - {} {}",
            info.vendor_id,
            info.product_id,
            info.manufacturer.as_deref().unwrap_or("Unknown Manufacturer"),
            info.product_name.as_deref().unwrap_or("Unknown Product")
        );
        println!(
            "      Bus {:03} Device {:03} Class {:#04x} Interfaces: {}",
            device.bus_number(),
            device.device_address(),
            info.device_class,
            info.interface_count
        );
        if let Some(serial) = &info.serial_number {
            println!("      Serial: {}", serial);
        }
        println!();
    }
    Ok(())
}

async fn run(config: BridgeConfig, platform: Arc<RusbPlatform>, service_mode: bool) -> Result<()> {
    if service_mode && service::is_systemd() {
        info!("Running under systemd");
    }

    let (events_tx, events_rx) = create_platform_channel();
    let watcher = platform
        .watch(events_tx)
        .context("Failed to start USB hot-plug watcher")?;

    let manager = Arc::new(ConnectionManager::new(
        Arc::new(HttpGatewayFactory::new(config.polling.http_timeout)),
        platform.clone() as Arc<dyn UsbPlatform>,
        events_rx,
        config.connection_settings(),
    ));

    let shutdown = CancellationToken::new();
    let state_logger = tokio::spawn(log_state_changes(manager.clone(), shutdown.clone()));

    let bridge = match manager.connect(&config.bridge.server_url).await {
        Ok(bridge) => bridge,
        Err(e) => {
            shutdown.cancel();
            let _ = state_logger.await;
            if let Some(watcher) = watcher {
                watcher.stop();
            }
            return Err(e)
                .with_context(|| format!("Failed to connect to {}", config.bridge.server_url));
        }
    };
    info!("Bridge id: {}", bridge.id);

    let watchdog = if service_mode {
        service::notify_ready().context("Failed to notify systemd ready")?;
        service::notify_status(&format!("Connected to {}", config.bridge.server_url))
            .context("Failed to send status to systemd")?;
        service::spawn_watchdog(shutdown.clone())
    } else {
        None
    };

    info!("Press Ctrl+C to shutdown");
    if let Err(e) = signal::ctrl_c().await {
        error!("Error waiting for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");

    if service_mode {
        service::notify_stopping().context("Failed to notify systemd stopping")?;
    }

    manager.disconnect().await;
    shutdown.cancel();
    if let Some(watchdog) = watchdog
        && let Err(e) = watchdog.await
    {
        warn!("Watchdog task ended abnormally: {}", e);
    }
    let _ = state_logger.await;

    if let Some(watcher) = watcher {
        info!("Stopping USB hot-plug watcher...");
        watcher.stop();
    }

    info!("Bridge shutdown complete");
    Ok(())
}

async fn log_state_changes(manager: Arc<ConnectionManager>, shutdown: CancellationToken) {
    let mut states = manager.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if state == ConnectionState::Disconnected {
                    warn!("Connection state: {}", state);
                } else {
                    info!("Connection state: {}", state);
                }
            }
        }
    }
}

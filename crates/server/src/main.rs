//! eth2usb bridge
//!
//! Relays length-prefixed frames from one TCP client to an Active Servo USB
//! device and sends the device replies back over the same connection.

mod config;
mod relay;
mod usb;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{FramePool, LinkStatus, create_relay_channels, setup_logging};
use config::BridgeConfig;
use relay::{EthernetWorker, LogIndicator, StatusWorker, UsbWorker};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info};
use usb::{DeviceFilter, GatewaySlot, HostEvent, RusbPort, UsbHost, spawn_sof_ticker};

#[derive(Parser, Debug)]
#[command(name = "eth2usb")]
#[command(
    author,
    version,
    about = "Ethernet to Active Servo USB bridge"
)]
#[command(long_about = "
Bridges a single TCP client to an Active Servo USB device. Each frame the
client sends (a native-endian u32 payload size followed by the payload)
becomes one bulk command; device replies come back as frames.

EXAMPLES:
    # Run with default config (listens on 0.0.0.0:8000)
    eth2usb

    # Run with custom config
    eth2usb --config /path/to/bridge.toml

    # List matching USB devices and their Active Servo endpoints
    eth2usb --list-devices

    # Listen on another address with debug logging
    eth2usb --bind 127.0.0.1:9000 --log-level debug

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/eth2usb/bridge.toml
    3. /etc/eth2usb/bridge.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Listen address, overrides server.bind_addr
    #[arg(short, long, value_name = "ADDR")]
    bind: Option<String>,
}

/// Name and result of a worker thread that returned
type WorkerExit = (&'static str, common::Result<()>);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(level) = args.log_level {
        config.server.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.server.log_level).context("Failed to setup logging")?;

    info!("eth2usb v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.server.log_level);

    let filter = config.usb.device_filter()?;

    if args.list_devices {
        return list_devices(filter, config.usb.transfer_timeout());
    }

    run_bridge(config, filter).await
}

/// List USB devices matching the filter and exit
fn list_devices(filter: DeviceFilter, timeout: Duration) -> Result<()> {
    let port = RusbPort::new(filter, timeout).context("Failed to initialize libusb")?;
    let devices = port
        .list_devices()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No matching USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {:04x}:{:04x}  Bus {:03} Device {:03}",
            device.vendor_id, device.product_id, device.bus_number, device.address
        );
        match device.interface {
            Some(interface) => println!(
                "      Active Servo interface {}: OUT {:#04x} ({} bytes), IN {:#04x} ({} bytes)",
                interface.number,
                interface.out_ep.address,
                interface.out_ep.max_packet_size,
                interface.in_ep.address,
                interface.in_ep.max_packet_size
            ),
            None => println!(
                "      No Active Servo interface (class {:#04x})",
                filter.class_code
            ),
        }
        println!();
    }

    Ok(())
}

/// Start every worker and wait for Ctrl+C or a worker failure
async fn run_bridge(config: BridgeConfig, filter: DeviceFilter) -> Result<()> {
    let link = Arc::new(LinkStatus::new());
    let shutdown = Arc::new(AtomicBool::new(false));
    let slot = GatewaySlot::new();

    let inbound = FramePool::new("inbound", config.relay.pool_size)?;
    let outbound = FramePool::new("outbound", config.relay.pool_size)?;
    let (eth_relay, usb_relay) = create_relay_channels(config.relay.queue_size);

    let port =
        RusbPort::new(filter, config.usb.transfer_timeout()).context("Failed to initialize libusb")?;
    let host = UsbHost::new(
        port,
        config.usb.event_queue_size,
        config.usb.probe_every(),
        link.clone(),
        slot.clone(),
    );
    let host_events = host.events();

    let eth = EthernetWorker::bind(config.bind_addr()?, eth_relay, inbound, link.clone())
        .context("Failed to start Ethernet worker")?;
    let usb_worker = UsbWorker::new(
        usb_relay,
        outbound,
        slot,
        link.clone(),
        config.relay.attach_poll(),
    );
    let status = StatusWorker::new(
        link,
        LogIndicator::new("Ethernet"),
        LogIndicator::new("USB"),
        Duration::from_millis(config.status.ethernet_blink_ms),
        Duration::from_millis(config.status.usb_blink_ms),
    );

    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<WorkerExit>();
    let mut workers = Vec::new();

    workers.push(spawn_worker("usb-host", exit_tx.clone(), move || host.run())?);
    let ticker = spawn_sof_ticker(host_events.clone(), config.usb.host_tick())
        .context("Failed to spawn usb-sof thread")?;

    let eth_tick = config.relay.eth_tick();
    let flag = shutdown.clone();
    workers.push(spawn_worker("eth-worker", exit_tx.clone(), move || {
        eth.run(eth_tick, flag)
    })?);

    let flag = shutdown.clone();
    workers.push(spawn_worker("usb-worker", exit_tx.clone(), move || {
        usb_worker.run(flag)
    })?);

    let status_poll = Duration::from_millis(config.status.poll_ms);
    let flag = shutdown.clone();
    workers.push(spawn_worker("status-worker", exit_tx, move || {
        status.run(status_poll, flag)
    })?);

    info!("Bridge running, press Ctrl+C to stop");

    let result = tokio::select! {
        res = signal::ctrl_c() => {
            match res {
                Ok(()) => info!("Received Ctrl+C, shutting down"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
            Ok(())
        }
        Some((name, result)) = exit_rx.recv() => match result {
            Ok(()) => Err(anyhow!("{} exited unexpectedly", name)),
            Err(e) => Err(anyhow::Error::new(e).context(format!("{} failed", name))),
        },
    };

    // Cleanup: stop the workers, then the host (which destroys the handle)
    shutdown.store(true, Ordering::Relaxed);
    if host_events.send(HostEvent::Shutdown).await.is_err() {
        info!("USB host already stopped");
    }

    for worker in workers {
        if let Err(e) = worker.join() {
            error!("Worker thread panicked: {:?}", e);
        }
    }
    drop(host_events);
    if let Err(e) = ticker.join() {
        error!("usb-sof thread panicked: {:?}", e);
    }

    while let Ok((name, result)) = exit_rx.try_recv() {
        if let Err(e) = result {
            error!("{} stopped with error: {}", name, e);
        }
    }

    info!("Bridge stopped");
    result
}

/// Spawn a named worker thread that reports its result on `exits`
fn spawn_worker<F>(
    name: &'static str,
    exits: mpsc::UnboundedSender<WorkerExit>,
    work: F,
) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> common::Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let result = work();
            let _ = exits.send((name, result));
        })
        .with_context(|| format!("Failed to spawn {} thread", name))
}

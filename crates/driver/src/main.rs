//! ardu-usb
//!
//! Host-side driver for Arduino boards speaking a raw bulk protocol. Binds to
//! supported devices as they are plugged in, registers a node per device and
//! optionally streams one node's bulk-in data to stdout.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{UsbBridge, UsbCommand, UsbEvent, create_usb_bridge, setup_logging};
use driver::DriverError;
use driver::config::DriverConfig;
use driver::usb::{LifecycleController, spawn_usb_worker};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "ardu-usb")]
#[command(author, version, about = "Bulk-endpoint driver for Arduino boards")]
#[command(long_about = "
Binds to supported Arduino boards over libusb and exposes each one as a
node (ardu_device0, ardu_device1, ...) that can be read and written with
bulk transfers.

EXAMPLES:
    # Run with default config
    ardu-usb

    # List registered nodes and exit
    ardu-usb --list-devices

    # Stream everything ardu_device0 sends to stdout
    ardu-usb --cat ardu_device0

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/ardu-usb/driver.toml
    3. /etc/ardu-usb/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List registered device nodes and exit
    #[arg(long)]
    list_devices: bool,

    /// Copy bulk-in data from NODE to stdout once it is attached
    #[arg(long, value_name = "NODE")]
    cat: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config.as_deref() {
        Some(path) => DriverConfig::load(Some(DriverConfig::expand_path(path)))
            .context("Failed to load configuration")?,
        None => DriverConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("ardu-usb v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (usb_bridge, worker) = create_usb_bridge();
    let controller = Arc::new(
        LifecycleController::new(&config).with_events(worker.event_tx.clone()),
    );
    let usb_worker_handle = spawn_usb_worker(
        worker,
        Arc::clone(&controller),
        config.transfer.clone(),
    )
    .context("Failed to spawn USB worker thread")?;

    let result = if args.list_devices {
        list_devices_mode(&usb_bridge).await
    } else {
        run(&usb_bridge, controller, args.cat).await
    };

    info!("Shutting down USB subsystem...");
    if let Err(e) = shutdown_usb_worker(&usb_bridge).await {
        error!("Error shutting down USB worker: {:#}", e);
    }
    match tokio::task::spawn_blocking(move || usb_worker_handle.join()).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!("USB worker failed: {}", e),
        Ok(Err(e)) => error!("USB worker thread panicked: {:?}", e),
        Err(e) => error!("Failed to join USB worker: {}", e),
    }

    result
}

/// Print registered nodes and exit
async fn list_devices_mode(usb_bridge: &UsbBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    usb_bridge
        .send_command(UsbCommand::ListNodes { response: tx })
        .await
        .context("Failed to send ListNodes command")?;

    let nodes = rx.await.context("Failed to receive node list")?;

    if nodes.is_empty() {
        println!("No supported devices found.");
    } else {
        println!("Found {} device(s):\n", nodes.len());
        for node in nodes {
            println!(
                "  {} ({}) {:04x}:{:04x}",
                node.name, node.id, node.vendor_id, node.product_id
            );
            println!("      {} state: {}", node.address, node.state);
            println!();
        }
    }

    Ok(())
}

/// Log lifecycle events until Ctrl+C
async fn run(
    usb_bridge: &UsbBridge,
    controller: Arc<LifecycleController>,
    cat: Option<String>,
) -> Result<()> {
    info!("Press Ctrl+C to shutdown");

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            event = usb_bridge.recv_event() => {
                let event = event.map_err(|e| anyhow!("USB worker stopped: {}", e))?;
                handle_event(event, &controller, cat.as_deref());
            }
        }
    }
}

fn handle_event(event: UsbEvent, controller: &Arc<LifecycleController>, cat: Option<&str>) {
    match event {
        UsbEvent::DeviceAttached { node, .. } => {
            info!("{} attached at {}", node.name, node.address);
            if cat == Some(node.name.as_str()) {
                let controller = Arc::clone(controller);
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = cat_node(&controller, &node.name) {
                        warn!("Streaming {} stopped: {}", node.name, e);
                    }
                });
            }
        }
        UsbEvent::DeviceDetached {
            name,
            remaining_refs,
            ..
        } => {
            info!("{} detached ({} references outstanding)", name, remaining_refs);
        }
        UsbEvent::AttachRejected { address, reason } => {
            warn!("Device at {} rejected: {}", address, reason);
        }
    }
}

/// Copy bulk-in data from `name` to stdout until the device goes away
fn cat_node(controller: &LifecycleController, name: &str) -> Result<()> {
    let session = controller.open(name)?;
    let mut buf = vec![0u8; 4096];
    let mut stdout = std::io::stdout();

    loop {
        match session.read(&mut buf) {
            Ok(n) => {
                stdout.write_all(&buf[..n])?;
                stdout.flush()?;
            }
            Err(DriverError::Disconnected) => {
                info!("{} disconnected, stopping", name);
                return Ok(());
            }
            Err(e) if e.is_retryable() => {
                debug!("{}: {}", name, e);
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn shutdown_usb_worker(usb_bridge: &UsbBridge) -> Result<()> {
    usb_bridge
        .send_command(UsbCommand::Shutdown)
        .await
        .context("Failed to send Shutdown command")?;
    Ok(())
}

//! Bus worker thread
//!
//! Dedicated thread that owns the libusb context. It enumerates supported
//! devices at start-up, turns hot-plug arrivals and departures into
//! `on_attach`/`on_detach` calls on the [`LifecycleController`], and answers
//! commands from the Tokio runtime.

use crate::config::TransferSettings;
use crate::usb::device::{UsbDevice, matching_devices, read_descriptors};
use crate::usb::manager::LifecycleController;
use async_channel::{Receiver, Sender, unbounded};
use common::{UsbCommand, UsbEvent, UsbWorker};
use protocol::{BusAddress, DeviceDescriptors};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

/// Hot-plug notification forwarded out of the libusb callback
enum BusEvent {
    Arrived(Device<Context>),
    Left(BusAddress),
}

/// libusb forbids synchronous I/O inside hot-plug callbacks, so the
/// callback only forwards to the worker loop
struct HotplugForwarder {
    tx: Sender<BusEvent>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        if self.tx.try_send(BusEvent::Arrived(device)).is_err() {
            warn!("Hot-plug arrival dropped, worker is gone");
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let address = BusAddress::new(device.bus_number(), device.address());
        if self.tx.try_send(BusEvent::Left(address)).is_err() {
            warn!("Hot-plug departure dropped, worker is gone");
        }
    }
}

/// Bus worker
pub struct UsbWorkerThread {
    context: Context,
    controller: Arc<LifecycleController>,
    worker: UsbWorker,
    transfer: TransferSettings,
    bus_rx: Receiver<BusEvent>,
    _hotplug_registration: Option<Registration<Context>>,
}

impl UsbWorkerThread {
    pub fn new(
        worker: UsbWorker,
        controller: Arc<LifecycleController>,
        transfer: TransferSettings,
    ) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        let (bus_tx, bus_rx) = unbounded();

        let registration = if rusb::has_hotplug() {
            let registration = HotplugBuilder::new()
                .enumerate(false)
                .register(&context, Box::new(HotplugForwarder { tx: bus_tx }))?;
            debug!("Hot-plug callbacks registered");
            Some(registration)
        } else {
            warn!("libusb has no hot-plug support; only devices present at start-up are attached");
            None
        };

        Ok(Self {
            context,
            controller,
            worker,
            transfer,
            bus_rx,
            _hotplug_registration: registration,
        })
    }

    /// Run until a Shutdown command arrives or the runtime goes away
    ///
    /// Every registered device is detached before returning.
    pub fn run(self) -> Result<(), rusb::Error> {
        info!("Bus worker started");
        self.enumerate()?;

        loop {
            match self.worker.try_recv_command() {
                Some(UsbCommand::Shutdown) => {
                    info!("Bus worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_orphaned() => {
                    info!("Runtime went away, bus worker stopping");
                    break;
                }
                None => {}
            }

            match self.context.handle_events(Some(EVENT_TIMEOUT)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("USB event handling interrupted");
                }
                Err(e) => {
                    warn!("Error handling USB events: {}", e);
                    std::thread::sleep(EVENT_TIMEOUT);
                }
            }

            while let Ok(event) = self.bus_rx.try_recv() {
                match event {
                    BusEvent::Arrived(device) => self.device_arrived(&device),
                    BusEvent::Left(address) => {
                        self.controller.on_detach(address);
                    }
                }
            }
        }

        self.controller.shutdown();
        info!("Bus worker stopped");
        Ok(())
    }

    fn enumerate(&self) -> Result<(), rusb::Error> {
        let controller = Arc::clone(&self.controller);
        let devices = matching_devices(&self.context, |vid, pid| controller.supports(vid, pid))?;
        debug!("Found {} supported devices at start-up", devices.len());
        for (device, descriptors) in devices {
            self.attach(&device, descriptors);
        }
        Ok(())
    }

    fn device_arrived(&self, device: &Device<Context>) {
        let Ok(descriptor) = device.device_descriptor() else {
            return;
        };
        if !self
            .controller
            .supports(descriptor.vendor_id(), descriptor.product_id())
        {
            debug!(
                "Ignoring {:04x}:{:04x} on bus {} device {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                device.bus_number(),
                device.address()
            );
            return;
        }
        match read_descriptors(device) {
            Ok(descriptors) => self.attach(device, descriptors),
            Err(e) => warn!("Could not read descriptors of arriving device: {}", e),
        }
    }

    fn attach(&self, device: &Device<Context>, descriptors: DeviceDescriptors) {
        let address = descriptors.address;
        let Some(interface) = descriptors.bulk_interface().map(|iface| iface.number) else {
            warn!("{} has no bulk-in endpoint, not attaching", address);
            self.reject(address, "no bulk-in endpoint".to_string());
            return;
        };

        let transport = match UsbDevice::open(device, interface, self.transfer.write_timeout()) {
            Ok(transport) => transport,
            Err(e) => {
                self.reject(address, format!("cannot open device: {}", e));
                return;
            }
        };

        if let Err(e) = self.controller.on_attach(transport, descriptors) {
            debug!("{} not attached: {}", address, e);
        }
    }

    fn reject(&self, address: BusAddress, reason: String) {
        if let Err(e) = self
            .worker
            .event_tx
            .try_send(UsbEvent::AttachRejected { address, reason })
        {
            debug!("Dropping lifecycle event: {}", e);
        }
    }

    fn handle_command(&self, cmd: UsbCommand) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match cmd {
            UsbCommand::ListNodes { response } => {
                let nodes = self.controller.nodes();
                debug!("Listing {} nodes", nodes.len());
                let _ = response.send(nodes);
            }
            UsbCommand::Shutdown => {}
        }));

        if let Err(e) = result {
            error!("Panic in bus command handler: {:?}", e);
        }
    }
}

/// Spawn the bus worker thread
pub fn spawn_usb_worker(
    worker: UsbWorker,
    controller: Arc<LifecycleController>,
    transfer: TransferSettings,
) -> std::io::Result<std::thread::JoinHandle<Result<(), rusb::Error>>> {
    std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || UsbWorkerThread::new(worker, controller, transfer)?.run())
}

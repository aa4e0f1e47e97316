//! libusb-backed transport
//!
//! Wraps a `rusb::DeviceHandle` with its interfaces claimed and runs bulk
//! transfers on two I/O threads per device, one per direction, so a bulk-in
//! transfer waiting for data never holds up writes. Submissions are queued
//! on async channels and completions fire on the I/O threads.
//!
//! libusb's synchronous bulk API cannot be aborted, so a bulk-in transfer is
//! carried out as a series of short reads; cancelling bumps the endpoint's
//! epoch and the transfer completes as cancelled at the next slice boundary.

use crate::usb::transfers::{Completion, Rejected, UsbTransport};
use async_channel::{Receiver, Sender, unbounded};
use protocol::{
    BusAddress, DeviceDescriptors, DeviceSpeed, EndpointDescriptor, InterfaceDescriptor,
    TransferError,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Length of one bulk-in read slice
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Epoch counters, one per endpoint number and direction
const ENDPOINT_SLOTS: usize = 32;

fn slot(endpoint: u8) -> usize {
    let base = usize::from(endpoint & 0x0f);
    if endpoint & 0x80 != 0 { base + 16 } else { base }
}

enum Job {
    In {
        endpoint: u8,
        length: usize,
        epoch: u64,
        completion: Completion,
    },
    Out {
        endpoint: u8,
        data: Vec<u8>,
        epoch: u64,
        completion: Completion,
    },
}

impl Job {
    fn into_completion(self) -> Completion {
        match self {
            Job::In { completion, .. } | Job::Out { completion, .. } => completion,
        }
    }
}

/// Open handle plus the interfaces claimed on it
///
/// Shared by the device and its I/O threads; dropping the last reference
/// hands the interfaces back to the kernel.
struct ClaimedHandle {
    address: BusAddress,
    handle: DeviceHandle<Context>,
    claimed_interfaces: Vec<u8>,
    epochs: [AtomicU64; ENDPOINT_SLOTS],
    write_timeout: Duration,
}

impl ClaimedHandle {
    fn epoch(&self, endpoint: u8) -> u64 {
        self.epochs[slot(endpoint)].load(Ordering::Acquire)
    }

    fn read(&self, endpoint: u8, length: usize, epoch: u64, completion: Completion) {
        let mut buffer = vec![0u8; length];
        loop {
            if self.epoch(endpoint) != epoch {
                completion.complete(Err(TransferError::Cancelled));
                return;
            }
            match self.handle.read_bulk(endpoint, &mut buffer, POLL_SLICE) {
                Ok(n) => {
                    trace!("{}: read {} bytes from {:#04x}", self.address, n, endpoint);
                    completion.complete(Ok(&buffer[..n]));
                    return;
                }
                Err(rusb::Error::Timeout) => continue,
                Err(e) => {
                    debug!("{}: bulk read on {:#04x} failed: {}", self.address, endpoint, e);
                    completion.complete(Err(map_rusb_error(e)));
                    return;
                }
            }
        }
    }

    fn write(&self, endpoint: u8, data: &[u8], epoch: u64, completion: Completion) {
        if self.epoch(endpoint) != epoch {
            completion.complete(Err(TransferError::Cancelled));
            return;
        }
        match self.handle.write_bulk(endpoint, data, self.write_timeout) {
            Ok(n) if n < data.len() => {
                debug!("{}: short write {} of {}", self.address, n, data.len());
                completion.complete(Err(TransferError::ShortTransfer));
            }
            Ok(n) => completion.complete(Ok(&data[..n])),
            Err(e) => {
                debug!("{}: bulk write on {:#04x} failed: {}", self.address, endpoint, e);
                completion.complete(Err(map_rusb_error(e)));
            }
        }
    }
}

impl Drop for ClaimedHandle {
    fn drop(&mut self) {
        for interface in &self.claimed_interfaces {
            if let Err(e) = self.handle.release_interface(*interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }

            if let Err(e) = self.handle.attach_kernel_driver(*interface) {
                debug!(
                    "Could not reattach kernel driver to interface {} (may not have been detached): {}",
                    interface, e
                );
            } else {
                debug!("Reattached kernel driver to interface {} on {}", interface, self.address);
            }
        }
        debug!("Closed {}", self.address);
    }
}

/// One attached device as seen through libusb
pub struct UsbDevice {
    address: BusAddress,
    claimed: Arc<ClaimedHandle>,
    in_tx: Mutex<Option<Sender<Job>>>,
    out_tx: Mutex<Option<Sender<Job>>>,
}

impl UsbDevice {
    /// Open `device`, claim its bulk interface and start the I/O threads
    ///
    /// Only the interface carrying the bulk endpoints is claimed so that the
    /// kernel keeps serving any other function of a composite device.
    pub fn open(
        device: &Device<Context>,
        interface_number: u8,
        write_timeout: Duration,
    ) -> Result<Arc<Self>, rusb::Error> {
        let address = BusAddress::new(device.bus_number(), device.address());
        let handle = device.open().inspect_err(|e| {
            warn!("Failed to open {}: {}", address, e);
        })?;
        debug!("Opened {}", address);

        match handle.kernel_driver_active(interface_number) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {} on {}",
                    interface_number, address
                );
                if let Err(e) = handle.detach_kernel_driver(interface_number) {
                    // Claiming will most likely fail next and report it
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface_number, e
                    );
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface_number);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface_number, e
                );
            }
        }

        handle.claim_interface(interface_number).inspect_err(|e| {
            warn!("Failed to claim interface {}: {}", interface_number, e);
        })?;
        debug!("Claimed interface {} on {}", interface_number, address);

        let claimed = Arc::new(ClaimedHandle {
            address,
            handle,
            claimed_interfaces: vec![interface_number],
            epochs: std::array::from_fn(|_| AtomicU64::new(0)),
            write_timeout,
        });

        let (in_tx, in_rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let suffix = format!("{}-{}", address.bus_number, address.device_address);
        let queues = [
            (format!("ardu-in-{}", suffix), in_rx),
            (format!("ardu-out-{}", suffix), out_rx),
        ];
        for (name, jobs) in queues {
            spawn_io_thread(name, Arc::clone(&claimed), jobs).map_err(|e| {
                warn!("Failed to spawn I/O thread for {}: {}", address, e);
                rusb::Error::Other
            })?;
        }

        Ok(Arc::new(Self {
            address,
            claimed,
            in_tx: Mutex::new(Some(in_tx)),
            out_tx: Mutex::new(Some(out_tx)),
        }))
    }

    pub fn address(&self) -> BusAddress {
        self.address
    }

    fn queue(&self, tx: &Mutex<Option<Sender<Job>>>, job: Job) -> Result<(), Rejected> {
        let guard = tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(Rejected::new(TransferError::Shutdown, job.into_completion()));
        };
        sender
            .try_send(job)
            .map_err(|e| Rejected::new(TransferError::Shutdown, e.into_inner().into_completion()))
    }
}

impl UsbTransport for UsbDevice {
    fn submit_bulk_in(
        &self,
        endpoint: u8,
        length: usize,
        completion: Completion,
    ) -> Result<(), Rejected> {
        let epoch = self.claimed.epoch(endpoint);
        self.queue(
            &self.in_tx,
            Job::In {
                endpoint,
                length,
                epoch,
                completion,
            },
        )
    }

    fn submit_bulk_out(
        &self,
        endpoint: u8,
        data: Vec<u8>,
        completion: Completion,
    ) -> Result<(), Rejected> {
        let epoch = self.claimed.epoch(endpoint);
        self.queue(
            &self.out_tx,
            Job::Out {
                endpoint,
                data,
                epoch,
                completion,
            },
        )
    }

    fn cancel(&self, endpoint: u8) {
        self.claimed.epochs[slot(endpoint)].fetch_add(1, Ordering::AcqRel);
        trace!("{}: cancelled transfers on {:#04x}", self.address, endpoint);
    }

    fn resume(&self) -> Result<(), TransferError> {
        self.claimed
            .handle
            .active_configuration()
            .map(|_| ())
            .map_err(map_rusb_error)
    }

    fn release(&self) {
        // May run on one of our own I/O threads, so never join them here
        for tx in [&self.in_tx, &self.out_tx] {
            tx.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
        }
        info!("Released {}", self.address);
    }
}

fn spawn_io_thread(
    name: String,
    claimed: Arc<ClaimedHandle>,
    jobs: Receiver<Job>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name(name).spawn(move || {
        while let Ok(job) = jobs.recv_blocking() {
            match job {
                Job::In {
                    endpoint,
                    length,
                    epoch,
                    completion,
                } => claimed.read(endpoint, length, epoch, completion),
                Job::Out {
                    endpoint,
                    data,
                    epoch,
                    completion,
                } => claimed.write(endpoint, &data, epoch, completion),
            }
        }
        debug!("{}: I/O thread exiting", claimed.address);
    })
}

/// Read the descriptors of `device`'s active configuration
pub fn read_descriptors(device: &Device<Context>) -> Result<DeviceDescriptors, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))?;

    let interfaces = config
        .interfaces()
        .filter_map(|interface| interface.descriptors().next())
        .map(|iface| InterfaceDescriptor {
            number: iface.interface_number(),
            alternate_setting: iface.setting_number(),
            class: iface.class_code(),
            subclass: iface.sub_class_code(),
            protocol: iface.protocol_code(),
            description_index: iface.description_string_index(),
            endpoints: iface
                .endpoint_descriptors()
                .map(|ep| EndpointDescriptor {
                    address: ep.address(),
                    attributes: transfer_type_bits(ep.transfer_type()),
                    max_packet_size: ep.max_packet_size(),
                    interval: ep.interval(),
                })
                .collect(),
        })
        .collect();

    Ok(DeviceDescriptors {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        address: BusAddress::new(device.bus_number(), device.address()),
        speed: map_device_speed(device.speed()),
        interfaces,
    })
}

fn transfer_type_bits(kind: rusb::TransferType) -> u8 {
    match kind {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    }
}

/// Map rusb device speed to protocol DeviceSpeed
fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Full,
    }
}

/// Map a libusb error to the completion status it stands for
pub fn map_rusb_error(err: rusb::Error) -> TransferError {
    match err {
        rusb::Error::Timeout => TransferError::Timeout,
        rusb::Error::Pipe => TransferError::Stall,
        rusb::Error::NoDevice | rusb::Error::NotFound => TransferError::NoDevice,
        rusb::Error::Overflow => TransferError::Overflow,
        rusb::Error::Interrupted => TransferError::Cancelled,
        _ => TransferError::Io,
    }
}

/// Enumerate devices on `context` whose descriptors satisfy `filter`
pub fn matching_devices(
    context: &Context,
    filter: impl Fn(u16, u16) -> bool,
) -> Result<Vec<(Device<Context>, DeviceDescriptors)>, rusb::Error> {
    let mut found = Vec::new();
    for device in context.devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if !filter(descriptor.vendor_id(), descriptor.product_id()) {
            continue;
        }
        match read_descriptors(&device) {
            Ok(descriptors) => found.push((device, descriptors)),
            Err(e) => warn!(
                "Could not read descriptors of bus {} device {}: {}",
                device.bus_number(),
                device.address(),
                e
            ),
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::Full), DeviceSpeed::Full);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), DeviceSpeed::Super);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
    }

    #[test]
    fn test_map_rusb_error() {
        assert_eq!(map_rusb_error(rusb::Error::Timeout), TransferError::Timeout);
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferError::Stall);
        assert_eq!(map_rusb_error(rusb::Error::NoDevice), TransferError::NoDevice);
        assert_eq!(map_rusb_error(rusb::Error::Overflow), TransferError::Overflow);
        assert_eq!(map_rusb_error(rusb::Error::Access), TransferError::Io);
    }

    #[test]
    fn test_endpoint_slots_are_distinct() {
        assert_eq!(slot(0x03), 3);
        assert_eq!(slot(0x83), 19);
        assert_ne!(slot(0x01), slot(0x81));
        assert!(slot(0x8f) < ENDPOINT_SLOTS);
    }

    #[test]
    fn test_transfer_type_bits_round_trip() {
        let ep = EndpointDescriptor {
            address: 0x83,
            attributes: transfer_type_bits(rusb::TransferType::Bulk),
            max_packet_size: 64,
            interval: 0,
        };
        assert!(ep.is_bulk_in());
    }
}

//! Device lifecycle controller
//!
//! Reacts to attach and detach notifications from the bus, owns the node
//! registry, and hands out sessions for registered nodes. Attach and detach
//! may run concurrently with any number of open sessions; the ordering on
//! detach (mark disconnected, cancel transfers, unregister, release) is what
//! guarantees a blocked reader wakes up and the device is torn down only
//! after its last session closes.

use crate::config::{DriverConfig, UsbSettings};
use crate::usb::handle::{DeviceHandle, DeviceSpec, lock};
use crate::usb::session::{FileSession, OpenOptions};
use crate::usb::transfers::{TransferEngine, UsbTransport};
use common::UsbEvent;
use protocol::{
    BusAddress, DeviceDescriptors, DeviceState, DriverError, NodeId, NodeInfo, Result,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Registered nodes, keyed by the bus location of their device
///
/// Each entry holds the registration's own counted reference.
struct NodeRegistry {
    prefix: String,
    major: u32,
    max_devices: u32,
    nodes: Mutex<HashMap<BusAddress, DeviceHandle>>,
}

impl NodeRegistry {
    fn new(config: &DriverConfig) -> Self {
        Self {
            prefix: config.driver.node_prefix.clone(),
            major: config.driver.major,
            max_devices: config.driver.max_devices,
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the lowest free minor, build the device and register it
    fn register(
        &self,
        descriptors: DeviceDescriptors,
        transport: Arc<dyn UsbTransport>,
        build: impl FnOnce(String, NodeId, DeviceDescriptors) -> Result<DeviceSpec>,
    ) -> Result<DeviceHandle> {
        let mut nodes = lock(&self.nodes);
        let address = descriptors.address;
        if nodes.contains_key(&address) {
            return Err(DriverError::UnsupportedDevice {
                reason: format!("{} is already attached", address),
            });
        }

        let minor = (0..self.max_devices)
            .find(|minor| nodes.values().all(|h| h.node().minor != *minor))
            .ok_or(DriverError::NodeTableFull {
                limit: self.max_devices,
            })?;
        let node = NodeId {
            major: self.major,
            minor,
        };
        let name = format!("{}{}", self.prefix, minor);

        let spec = build(name, node, descriptors)?;
        let handle = DeviceHandle::new(spec, transport);
        handle.set_lifecycle(DeviceState::Active);

        let registration = handle.retain();
        nodes.insert(address, registration);
        Ok(handle)
    }

    /// Retain the device behind `name`
    fn lookup(&self, name: &str) -> Option<DeviceHandle> {
        lock(&self.nodes)
            .values()
            .find(|h| h.name() == name)
            .map(DeviceHandle::retain)
    }

    fn get(&self, address: &BusAddress) -> Option<DeviceHandle> {
        lock(&self.nodes).get(address).map(DeviceHandle::retain)
    }

    fn remove(&self, address: &BusAddress) -> Option<DeviceHandle> {
        lock(&self.nodes).remove(address)
    }

    fn addresses(&self) -> Vec<BusAddress> {
        lock(&self.nodes).keys().copied().collect()
    }

    fn snapshot(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = lock(&self.nodes).values().map(|h| h.info()).collect();
        nodes.sort_by_key(|n| n.id.minor);
        nodes
    }
}

/// Attach/detach handling and node registry
pub struct LifecycleController {
    registry: NodeRegistry,
    engine: TransferEngine,
    usb: UsbSettings,
    open_options: OpenOptions,
    event_sender: Option<async_channel::Sender<UsbEvent>>,
}

impl LifecycleController {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            registry: NodeRegistry::new(config),
            engine: TransferEngine::new(&config.transfer),
            usb: config.usb.clone(),
            open_options: OpenOptions::default().read_timeout(config.transfer.read_timeout),
            event_sender: None,
        }
    }

    /// Publish lifecycle events on `sender`
    pub fn with_events(mut self, sender: async_channel::Sender<UsbEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    /// True if the device id table covers `vid:pid`
    pub fn supports(&self, vendor_id: u16, product_id: u16) -> bool {
        self.usb.matches(vendor_id, product_id)
    }

    /// Bind to a newly connected device and register its node
    ///
    /// Picks the first interface with a bulk-in endpoint. On failure nothing
    /// is registered and the transport is released.
    pub fn on_attach(
        &self,
        transport: Arc<dyn UsbTransport>,
        descriptors: DeviceDescriptors,
    ) -> Result<NodeInfo> {
        let address = descriptors.address;
        let snapshot = descriptors.clone();

        let result = self.attach(Arc::clone(&transport), descriptors);
        match result {
            Ok(handle) => {
                let node = handle.info();
                info!(
                    "{} ({}) registered for {:04x}:{:04x} at {}",
                    node.name, node.id, node.vendor_id, node.product_id, address
                );
                self.emit(UsbEvent::DeviceAttached {
                    node: node.clone(),
                    descriptors: snapshot,
                });
                Ok(node)
            }
            Err(err) => {
                warn!("Attach of {} rejected: {}", address, err);
                transport.release();
                self.emit(UsbEvent::AttachRejected {
                    address,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn attach(
        &self,
        transport: Arc<dyn UsbTransport>,
        descriptors: DeviceDescriptors,
    ) -> Result<DeviceHandle> {
        if !self.supports(descriptors.vendor_id, descriptors.product_id) {
            return Err(DriverError::UnsupportedDevice {
                reason: format!(
                    "{:04x}:{:04x} is not in the device id table",
                    descriptors.vendor_id, descriptors.product_id
                ),
            });
        }

        log_descriptors(&descriptors);

        self.registry.register(descriptors, transport, |name, node, descriptors| {
            let iface = descriptors
                .bulk_interface()
                .ok_or_else(|| DriverError::UnsupportedDevice {
                    reason: "no bulk-in endpoint".to_string(),
                })?;
            let bulk_in = *iface
                .bulk_in()
                .ok_or_else(|| DriverError::UnsupportedDevice {
                    reason: "no bulk-in endpoint".to_string(),
                })?;
            let bulk_out = iface.bulk_out().copied();
            let interface_number = iface.number;

            let size = bulk_in.max_packet_bytes();
            if size == 0 {
                return Err(DriverError::UnsupportedDevice {
                    reason: format!("bulk-in endpoint {:#04x} has zero max packet size", bulk_in.address),
                });
            }
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|_| DriverError::UnsupportedDevice {
                    reason: format!("cannot allocate {} byte transfer buffer", size),
                })?;
            buffer.resize(size, 0);

            debug!(
                "{}: interface {}, bulk-in {:#04x} ({} bytes), bulk-out {}",
                name,
                interface_number,
                bulk_in.address,
                size,
                bulk_out
                    .map(|ep| format!("{:#04x}", ep.address))
                    .unwrap_or_else(|| "none".to_string())
            );

            Ok(DeviceSpec {
                name,
                node,
                descriptors,
                interface_number,
                bulk_in,
                bulk_out,
                buffer,
            })
        })
    }

    /// Handle the device at `address` going away
    ///
    /// Wakes and fails every waiter, cancels outstanding transfers,
    /// unregisters the node and drops the registration's reference. The
    /// device itself lives on until its last session closes. Returns false
    /// if no device is registered at `address`.
    pub fn on_detach(&self, address: BusAddress) -> bool {
        let Some(handle) = self.registry.get(&address) else {
            debug!("Detach for unknown device at {}", address);
            return false;
        };

        if handle.mark_disconnected() {
            info!("{} disconnected ({})", handle.name(), address);
        }
        self.engine.cancel_all(&handle);

        // A concurrent detach of the same device already unregistered it
        let Some(registration) = self.registry.remove(&address) else {
            return false;
        };
        registration.release();

        let name = handle.name().to_string();
        // Everything but this temporary reference
        let remaining_refs = handle.refcount().saturating_sub(1);
        handle.release();

        info!("{} unregistered, {} references outstanding", name, remaining_refs);
        self.emit(UsbEvent::DeviceDetached {
            name,
            address,
            remaining_refs,
        });
        true
    }

    /// Open a session on the node called `node`
    pub fn open(&self, node: &str) -> Result<FileSession> {
        self.open_with(node, self.open_options)
    }

    pub fn open_with(&self, node: &str, options: OpenOptions) -> Result<FileSession> {
        let handle = self
            .registry
            .lookup(node)
            .ok_or_else(|| DriverError::NoSuchDevice {
                node: node.to_string(),
            })?;
        FileSession::open(handle, self.engine.clone(), options)
    }

    /// Counted reference to the device behind `node`
    pub fn lookup(&self, node: &str) -> Option<DeviceHandle> {
        self.registry.lookup(node)
    }

    /// Registered nodes ordered by minor number
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.registry.snapshot()
    }

    /// Detach every registered device
    pub fn shutdown(&self) {
        let addresses = self.registry.addresses();
        if !addresses.is_empty() {
            info!("Detaching {} devices", addresses.len());
        }
        for address in addresses {
            self.on_detach(address);
        }
    }

    fn emit(&self, event: UsbEvent) {
        if let Some(sender) = &self.event_sender
            && let Err(e) = sender.try_send(event)
        {
            debug!("Dropping lifecycle event: {}", e);
        }
    }
}

/// Log what the device reports about itself
fn log_descriptors(descriptors: &DeviceDescriptors) {
    info!(
        "Probing {:04x}:{:04x} at {} ({:?} speed, {} interfaces)",
        descriptors.vendor_id,
        descriptors.product_id,
        descriptors.address,
        descriptors.speed,
        descriptors.interfaces.len()
    );
    for iface in &descriptors.interfaces {
        debug!(
            "  interface {} alt {}: class {:#04x} subclass {:#04x} protocol {:#04x}, {} endpoints",
            iface.number,
            iface.alternate_setting,
            iface.class,
            iface.subclass,
            iface.protocol,
            iface.num_endpoints()
        );
        for ep in &iface.endpoints {
            debug!(
                "    endpoint {:#04x}: {:?} {:?}, max packet {}, interval {}",
                ep.address,
                ep.transfer_kind(),
                ep.direction(),
                ep.max_packet_bytes(),
                ep.interval
            );
        }
    }
}

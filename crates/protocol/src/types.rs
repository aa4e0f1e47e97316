//! USB descriptor and node type definitions
//!
//! This module defines the data the bus collaborator hands to the driver at
//! attach time (device, interface and endpoint descriptors) and the
//! identifiers the driver hands out for registered device nodes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction bit of `bEndpointAddress` (set for IN endpoints)
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Transfer type bits of `bmAttributes`
const TRANSFER_TYPE_MASK: u8 = 0x03;

/// Packet size bits of `wMaxPacketSize` (bits 11..12 carry the high-bandwidth multiplier)
const MAX_PACKET_SIZE_MASK: u16 = 0x07ff;

/// Location of a device on the host bus
///
/// This is the identity the bus collaborator uses for attach and detach
/// notifications. It is only unique while the device stays connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusAddress {
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
}

impl BusAddress {
    pub fn new(bus_number: u8, device_address: u8) -> Self {
        Self {
            bus_number,
            device_address,
        }
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {:03} device {:03}", self.bus_number, self.device_address)
    }
}

/// Major/minor number of a registered device node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceSpeed {
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    #[default]
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

/// Endpoint direction, from the host's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointDirection {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Endpoint transfer type (`bmAttributes` bits 0..1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint descriptor as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// `bEndpointAddress` (endpoint number plus direction bit)
    pub address: u8,
    /// `bmAttributes`
    pub attributes: u8,
    /// `wMaxPacketSize`
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Create a bulk endpoint descriptor
    pub fn bulk(address: u8, max_packet_size: u16) -> Self {
        Self {
            address,
            attributes: 0x02,
            max_packet_size,
            interval: 0,
        }
    }

    /// Create an interrupt endpoint descriptor
    pub fn interrupt(address: u8, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address,
            attributes: 0x03,
            max_packet_size,
            interval,
        }
    }

    /// Endpoint number without the direction bit
    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> EndpointDirection {
        if self.address & ENDPOINT_DIR_IN != 0 {
            EndpointDirection::In
        } else {
            EndpointDirection::Out
        }
    }

    pub fn transfer_kind(&self) -> TransferKind {
        match self.attributes & TRANSFER_TYPE_MASK {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }

    pub fn is_bulk_in(&self) -> bool {
        self.transfer_kind() == TransferKind::Bulk && self.direction() == EndpointDirection::In
    }

    pub fn is_bulk_out(&self) -> bool {
        self.transfer_kind() == TransferKind::Bulk && self.direction() == EndpointDirection::Out
    }

    /// Payload bytes per packet, ignoring the high-bandwidth multiplier bits
    pub fn max_packet_bytes(&self) -> usize {
        (self.max_packet_size & MAX_PACKET_SIZE_MASK) as usize
    }
}

/// Interface descriptor (one alternate setting) with its endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    /// `bInterfaceNumber`
    pub number: u8,
    /// `bAlternateSetting`
    pub alternate_setting: u8,
    /// `bInterfaceClass`
    pub class: u8,
    /// `bInterfaceSubClass`
    pub subclass: u8,
    /// `bInterfaceProtocol`
    pub protocol: u8,
    /// `iInterface` string index, if any
    pub description_index: Option<u8>,
    /// Endpoints of this alternate setting (`bNumEndpoints` entries)
    pub endpoints: Vec<EndpointDescriptor>,
}

impl InterfaceDescriptor {
    pub fn num_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    /// First bulk-in endpoint of this interface
    pub fn bulk_in(&self) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.is_bulk_in())
    }

    /// First bulk-out endpoint of this interface
    pub fn bulk_out(&self) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|ep| ep.is_bulk_out())
    }
}

/// Everything the bus collaborator reports about an attached device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptors {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Location on the bus
    pub address: BusAddress,
    /// Negotiated speed
    #[serde(default)]
    pub speed: DeviceSpeed,
    /// Interfaces of the active configuration
    pub interfaces: Vec<InterfaceDescriptor>,
}

impl DeviceDescriptors {
    /// Find the first interface exposing a bulk-in endpoint
    ///
    /// Composite devices (e.g. CDC-ACM boards) keep their bulk pipes on a
    /// data interface that is not necessarily the first one.
    pub fn bulk_interface(&self) -> Option<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .find(|iface| iface.bulk_in().is_some())
    }
}

/// Lifecycle state of an attached device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Allocated, not yet reachable through a node
    Attached,
    /// Registered and accepting opens
    Active,
    /// Detach in progress or done; waiting for the last reference
    Disconnecting,
    /// Torn down (terminal)
    Destroyed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Attached => "attached",
            DeviceState::Active => "active",
            DeviceState::Disconnecting => "disconnecting",
            DeviceState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a registered device node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name clients open (e.g. `ardu_device0`)
    pub name: String,
    /// Major/minor number
    pub id: NodeId,
    /// Location of the device on the bus
    pub address: BusAddress,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Live references (registration, sessions, in-flight completions)
    pub refcount: usize,
    pub state: DeviceState,
}

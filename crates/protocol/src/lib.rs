//! Data model shared by the ardu-usb crates
//!
//! This crate defines what crosses the boundary between the bus
//! collaborator and the driver: device, interface and endpoint descriptors,
//! bus addresses and node identifiers, plus the transfer status and client
//! error taxonomy. It performs no I/O.
//!
//! # Example
//!
//! ```
//! use protocol::{DriverError, EndpointDescriptor, TransferError};
//!
//! let ep = EndpointDescriptor::bulk(0x83, 64);
//! assert!(ep.is_bulk_in());
//! assert_eq!(ep.max_packet_bytes(), 64);
//!
//! // Bus-level transfer failures surface as a disconnect
//! assert_eq!(DriverError::from(TransferError::NoDevice), DriverError::Disconnected);
//! ```

pub mod error;
pub mod types;

pub use error::{DriverError, Result, TransferError};
pub use types::{
    BusAddress, DeviceDescriptors, DeviceSpeed, DeviceState, ENDPOINT_DIR_IN, EndpointDescriptor,
    EndpointDirection, InterfaceDescriptor, NodeId, NodeInfo, TransferKind,
};

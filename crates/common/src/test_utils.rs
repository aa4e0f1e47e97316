//! Test utilities for ardu-usb
//!
//! Provides descriptor fixtures and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_descriptors;
//!
//! # fn main() {
//! let desc = create_mock_descriptors(1, 4, 64);
//! assert_eq!(desc.vendor_id, 0x2341);
//! assert!(desc.bulk_interface().is_some());
//! # }
//! ```

use protocol::{
    BusAddress, DeviceDescriptors, DeviceSpeed, DeviceState, EndpointDescriptor,
    InterfaceDescriptor, NodeId, NodeInfo,
};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Arduino Uno vendor ID
pub const UNO_VENDOR_ID: u16 = 0x2341;

/// Arduino Uno product ID
pub const UNO_PRODUCT_ID: u16 = 0x0043;

/// Bulk-in endpoint address used by the fixtures
pub const MOCK_BULK_IN: u8 = 0x83;

/// Bulk-out endpoint address used by the fixtures
pub const MOCK_BULK_OUT: u8 = 0x04;

/// Create Uno-like descriptors: a CDC control interface with an interrupt
/// endpoint and a data interface with one bulk pair
///
/// # Arguments
/// * `bus` - Bus number
/// * `address` - Device address on the bus
/// * `max_packet` - `wMaxPacketSize` of both bulk endpoints
pub fn create_mock_descriptors(bus: u8, address: u8, max_packet: u16) -> DeviceDescriptors {
    DeviceDescriptors {
        vendor_id: UNO_VENDOR_ID,
        product_id: UNO_PRODUCT_ID,
        address: BusAddress::new(bus, address),
        speed: DeviceSpeed::Full,
        interfaces: vec![
            InterfaceDescriptor {
                number: 0,
                alternate_setting: 0,
                class: 0x02,
                subclass: 0x02,
                protocol: 0x01,
                description_index: None,
                endpoints: vec![EndpointDescriptor::interrupt(0x82, 8, 0xff)],
            },
            InterfaceDescriptor {
                number: 1,
                alternate_setting: 0,
                class: 0x0a,
                subclass: 0x00,
                protocol: 0x00,
                description_index: None,
                endpoints: vec![
                    EndpointDescriptor::bulk(MOCK_BULK_OUT, max_packet),
                    EndpointDescriptor::bulk(MOCK_BULK_IN, max_packet),
                ],
            },
        ],
    }
}

/// Create descriptors with a bulk-in endpoint only (no bulk-out)
pub fn create_mock_read_only_descriptors(bus: u8, address: u8, max_packet: u16) -> DeviceDescriptors {
    let mut desc = create_mock_descriptors(bus, address, max_packet);
    for iface in &mut desc.interfaces {
        iface.endpoints.retain(|ep| !ep.is_bulk_out());
    }
    desc
}

/// Create descriptors without any bulk endpoint (e.g. a HID-only device)
pub fn create_mock_interrupt_only_descriptors(bus: u8, address: u8) -> DeviceDescriptors {
    DeviceDescriptors {
        vendor_id: UNO_VENDOR_ID,
        product_id: UNO_PRODUCT_ID,
        address: BusAddress::new(bus, address),
        speed: DeviceSpeed::Low,
        interfaces: vec![InterfaceDescriptor {
            number: 0,
            alternate_setting: 0,
            class: 0x03,
            subclass: 0x01,
            protocol: 0x02,
            description_index: Some(2),
            endpoints: vec![EndpointDescriptor::interrupt(0x81, 8, 10)],
        }],
    }
}

/// Create a NodeInfo snapshot for an active node
pub fn create_mock_node_info(minor: u32, bus: u8, address: u8) -> NodeInfo {
    NodeInfo {
        name: format!("ardu_device{}", minor),
        id: NodeId { major: 234, minor },
        address: BusAddress::new(bus, address),
        vendor_id: UNO_VENDOR_ID,
        product_id: UNO_PRODUCT_ID,
        refcount: 1,
        state: DeviceState::Active,
    }
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

//! Integration tests for the descriptor data model
//!
//! Descriptors are handed over by the bus collaborator and can also be
//! written down in TOML fixtures, so they must deserialize from that form.

use protocol::{
    BusAddress, DeviceDescriptors, DeviceSpeed, DriverError, EndpointDirection, TransferError,
    TransferKind,
};

const UNO_FIXTURE: &str = r#"
vendor_id = 0x2341
product_id = 0x0043
speed = "Full"

[address]
bus_number = 3
device_address = 7

[[interfaces]]
number = 0
alternate_setting = 0
class = 2
subclass = 2
protocol = 1

[[interfaces.endpoints]]
address = 0x82
attributes = 0x03
max_packet_size = 8
interval = 255

[[interfaces]]
number = 1
alternate_setting = 0
class = 10
subclass = 0
protocol = 0

[[interfaces.endpoints]]
address = 0x04
attributes = 0x02
max_packet_size = 64
interval = 0

[[interfaces.endpoints]]
address = 0x83
attributes = 0x02
max_packet_size = 64
interval = 0
"#;

#[test]
fn test_fixture_deserializes() {
    let desc: DeviceDescriptors = toml::from_str(UNO_FIXTURE).expect("fixture should parse");

    assert_eq!(desc.vendor_id, 0x2341);
    assert_eq!(desc.product_id, 0x0043);
    assert_eq!(desc.address, BusAddress::new(3, 7));
    assert_eq!(desc.speed, DeviceSpeed::Full);
    assert_eq!(desc.interfaces.len(), 2);
    assert_eq!(desc.interfaces[0].description_index, None);
}

#[test]
fn test_fixture_bulk_pipes() {
    let desc: DeviceDescriptors = toml::from_str(UNO_FIXTURE).unwrap();
    let iface = desc.bulk_interface().expect("data interface");

    let bulk_in = iface.bulk_in().unwrap();
    assert_eq!(bulk_in.address, 0x83);
    assert_eq!(bulk_in.direction(), EndpointDirection::In);
    assert_eq!(bulk_in.max_packet_bytes(), 64);

    let bulk_out = iface.bulk_out().unwrap();
    assert_eq!(bulk_out.transfer_kind(), TransferKind::Bulk);
    assert_eq!(bulk_out.number(), 4);
}

#[test]
fn test_speed_defaults_when_missing() {
    let without_speed = UNO_FIXTURE.replace("speed = \"Full\"\n", "");
    let desc: DeviceDescriptors = toml::from_str(&without_speed).unwrap();
    assert_eq!(desc.speed, DeviceSpeed::Full);
}

#[test]
fn test_every_transfer_error_maps_to_a_driver_error() {
    let statuses = [
        TransferError::Stall,
        TransferError::ShortTransfer,
        TransferError::NoDevice,
        TransferError::Shutdown,
        TransferError::Cancelled,
        TransferError::Overflow,
        TransferError::Timeout,
        TransferError::Io,
    ];

    for status in statuses {
        let err = DriverError::from(status);
        if status.is_bus_error() {
            assert_eq!(err, DriverError::Disconnected);
        } else {
            assert_ne!(err, DriverError::Disconnected, "{status:?}");
        }
    }
}

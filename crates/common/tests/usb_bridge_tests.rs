//! USB Bridge Integration Tests
//!
//! Tests for the async channel bridge between the Tokio runtime and the bus
//! worker thread.
//!
//! # Test Scenarios
//! - Channel creation and basic communication
//! - Command/event message flow
//! - Worker shutdown handshake
//! - Concurrent producers
//!
//! Run with: `cargo test -p common --test usb_bridge_tests`

use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_mock_descriptors, create_mock_node_info, with_timeout,
};
use common::{UsbCommand, UsbEvent, create_usb_bridge};
use protocol::BusAddress;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

// ============================================================================
// Command Flow Tests
// ============================================================================

#[tokio::test]
async fn test_list_nodes_command_flow() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        let cmd = worker.recv_command().expect("Failed to receive command");
        if let UsbCommand::ListNodes { response } = cmd {
            let nodes = vec![create_mock_node_info(0, 1, 4), create_mock_node_info(1, 1, 5)];
            response.send(nodes).expect("Failed to send response");
            true
        } else {
            false
        }
    });

    let (tx, rx) = oneshot::channel();
    bridge
        .send_command(UsbCommand::ListNodes { response: tx })
        .await
        .expect("Failed to send command");

    let nodes = with_timeout(DEFAULT_TEST_TIMEOUT, rx)
        .await
        .expect("timed out")
        .expect("Failed to receive nodes");
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[1].name, "ardu_device1");

    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_shutdown_command_stops_worker_loop() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        let mut handled = 0;
        loop {
            match worker.recv_command() {
                Ok(UsbCommand::Shutdown) => break,
                Ok(UsbCommand::ListNodes { response }) => {
                    handled += 1;
                    let _ = response.send(Vec::new());
                }
                Err(_) => break,
            }
        }
        handled
    });

    for _ in 0..3 {
        let (tx, rx) = oneshot::channel();
        bridge
            .send_command(UsbCommand::ListNodes { response: tx })
            .await
            .unwrap();
        assert!(rx.await.unwrap().is_empty());
    }
    bridge.send_command(UsbCommand::Shutdown).await.unwrap();

    assert_eq!(handle.join().unwrap(), 3);
}

#[test]
fn test_try_recv_command_is_non_blocking() {
    let (_bridge, worker) = create_usb_bridge();
    assert!(worker.try_recv_command().is_none());
}

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_attach_detach_events_arrive_in_order() {
    let (bridge, worker) = create_usb_bridge();

    let handle = thread::spawn(move || {
        worker
            .send_event(UsbEvent::DeviceAttached {
                node: create_mock_node_info(0, 1, 4),
                descriptors: create_mock_descriptors(1, 4, 64),
            })
            .unwrap();
        worker
            .send_event(UsbEvent::DeviceDetached {
                name: "ardu_device0".to_string(),
                address: BusAddress::new(1, 4),
                remaining_refs: 0,
            })
            .unwrap();
    });

    let first = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, UsbEvent::DeviceAttached { ref node, .. } if node.id.minor == 0));

    let second = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        second,
        UsbEvent::DeviceDetached { remaining_refs: 0, .. }
    ));

    handle.join().unwrap();
}

#[tokio::test]
async fn test_recv_event_fails_after_worker_dropped() {
    let (bridge, worker) = create_usb_bridge();
    drop(worker);

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .unwrap();
    assert!(matches!(result, Err(common::Error::Channel(_))));
}

#[test]
fn test_try_recv_event() {
    let (bridge, worker) = create_usb_bridge();
    assert!(bridge.try_recv_event().is_none());

    worker
        .send_event(UsbEvent::AttachRejected {
            address: BusAddress::new(2, 3),
            reason: "no bulk-in endpoint".to_string(),
        })
        .unwrap();

    match bridge.try_recv_event() {
        Some(UsbEvent::AttachRejected { address, reason }) => {
            assert_eq!(address, BusAddress::new(2, 3));
            assert!(reason.contains("bulk-in"));
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_event_producers() {
    let (bridge, worker) = create_usb_bridge();
    let sender = worker.event_tx.clone();

    let producers: Vec<_> = (0..4u8)
        .map(|i| {
            let sender = sender.clone();
            thread::spawn(move || {
                for j in 0..10u8 {
                    sender
                        .send_blocking(UsbEvent::DeviceDetached {
                            name: format!("ardu_device{}", i),
                            address: BusAddress::new(i, j),
                            remaining_refs: 0,
                        })
                        .unwrap();
                    thread::sleep(Duration::from_micros(50));
                }
            })
        })
        .collect();

    let mut received = 0;
    while received < 40 {
        with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
            .await
            .unwrap()
            .unwrap();
        received += 1;
    }

    for p in producers {
        p.join().unwrap();
    }
    assert!(bridge.try_recv_event().is_none());
}

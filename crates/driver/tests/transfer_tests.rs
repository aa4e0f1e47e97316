//! Integration tests for the bulk transfer engine
//!
//! Exercises submit/await/cancel directly on device handles:
//! - One outstanding bulk-in transfer per device
//! - Retry budget for stalls and short transfers
//! - Bus errors and synchronous rejections
//! - Write slots, draining and cancel_all quiescence

use common::test_utils::create_mock_bulk_data;
use driver::config::DriverConfig;
use driver::test_utils::{MockTransport, attach_mock, attach_transport};
use driver::usb::LifecycleController;
use protocol::{DriverError, TransferError};
use std::time::Duration;

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn controller_with(configure: impl FnOnce(&mut DriverConfig)) -> LifecycleController {
    let mut config = DriverConfig::default();
    configure(&mut config);
    LifecycleController::new(&config)
}

mod bulk_in {
    use super::*;

    #[test]
    fn test_submit_while_ongoing_is_already_pending() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        let pending = engine.submit(&device, 16).unwrap();
        assert_eq!(engine.submit(&device, 16), Err(DriverError::AlreadyPending));

        assert!(transport.complete_in(b"abc"));
        assert_eq!(engine.await_completion(&device, &pending, WAIT, None), Ok(3));
        assert!(!engine.is_in_flight(&device, &pending));

        // Slot is free again
        let next = engine.submit(&device, 16).unwrap();
        assert!(transport.complete_in(b"d"));
        assert_eq!(engine.await_completion(&device, &next, WAIT, None), Ok(1));
    }

    #[test]
    fn test_length_clamped_to_buffer() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        assert_eq!(device.buffer_size(), 64);
        let pending = engine.submit(&device, 1000).unwrap();
        assert_eq!(pending.length(), 64);
        assert_eq!(transport.pending_in_length(), Some(64));

        engine.cancel(&device, pending);
    }

    #[test]
    fn test_overflow_surfaces_as_io() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        let pending = engine.submit(&device, 64).unwrap();
        assert!(transport.complete_in(&create_mock_bulk_data(80)));
        assert_eq!(
            engine.await_completion(&device, &pending, WAIT, None),
            Err(DriverError::Io(TransferError::Overflow))
        );
    }

    #[test]
    fn test_timeout_leaves_transfer_in_flight() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        let pending = engine.submit(&device, 8).unwrap();
        assert_eq!(
            engine.await_completion(&device, &pending, Some(Duration::from_millis(20)), None),
            Err(DriverError::TimedOut)
        );
        assert!(engine.is_in_flight(&device, &pending));
        assert_eq!(transport.cancel_count(), 0);

        engine.cancel(&device, pending);
        assert!(!engine.is_in_flight(&device, &pending));
        assert_eq!(transport.cancel_count(), 1);
        // The cancellation status is consumed by the canceller
        assert_eq!(device.take_error(), None);
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        let pending = engine.submit(&device, 8).unwrap();
        assert!(transport.complete_in(b"done"));
        engine.cancel(&device, pending);
        assert_eq!(transport.cancel_count(), 0);
        assert_eq!(engine.await_completion(&device, &pending, WAIT, None), Ok(4));
    }
}

mod retries {
    use super::*;

    #[test]
    fn test_stall_retried_twice_then_surfaced() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();
        assert_eq!(engine.max_retries(), 2);

        for _ in 0..3 {
            transport.script_in(Err(TransferError::Stall));
        }
        let pending = engine.submit(&device, 8).unwrap();
        assert_eq!(
            engine.await_completion(&device, &pending, WAIT, None),
            Err(DriverError::Stall)
        );
        assert_eq!(transport.in_submissions(), 3);
    }

    #[test]
    fn test_transient_errors_recover_within_budget() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        transport.script_in(Err(TransferError::Stall));
        transport.script_in(Err(TransferError::ShortTransfer));
        transport.script_in(Ok(&b"ok"[..]));

        let pending = engine.submit(&device, 8).unwrap();
        assert_eq!(engine.await_completion(&device, &pending, WAIT, None), Ok(2));
        assert_eq!(transport.in_submissions(), 3);
    }

    #[test]
    fn test_retry_budget_is_configurable() {
        let controller = controller_with(|c| c.transfer.max_retries = 0);
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        transport.script_in(Err(TransferError::ShortTransfer));
        let pending = engine.submit(&device, 8).unwrap();
        assert_eq!(
            engine.await_completion(&device, &pending, WAIT, None),
            Err(DriverError::ShortTransfer)
        );
        assert_eq!(transport.in_submissions(), 1);
    }

    #[test]
    fn test_bus_errors_never_retried() {
        for status in [TransferError::NoDevice, TransferError::Shutdown] {
            let controller = LifecycleController::new(&DriverConfig::default());
            let (transport, node) = attach_mock(&controller, 1, 4, 64);
            let device = controller.lookup(&node.name).unwrap();
            let engine = controller.engine();

            transport.script_in(Err(status));
            let pending = engine.submit(&device, 8).unwrap();
            assert_eq!(
                engine.await_completion(&device, &pending, WAIT, None),
                Err(DriverError::Disconnected)
            );
            assert_eq!(transport.in_submissions(), 1);
        }
    }

    #[test]
    fn test_rejected_submission_rolls_back() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();
        let refs = device.refcount();

        transport.reject_next_submit(TransferError::NoDevice);
        assert_eq!(engine.submit(&device, 8), Err(DriverError::Disconnected));
        assert_eq!(device.refcount(), refs);

        transport.reject_next_submit(TransferError::Io);
        assert_eq!(
            engine.submit(&device, 8),
            Err(DriverError::Io(TransferError::Io))
        );

        let pending = engine.submit(&device, 8).unwrap();
        assert!(transport.complete_in(b"fine"));
        assert_eq!(engine.await_completion(&device, &pending, WAIT, None), Ok(4));
    }
}

mod bulk_out {
    use super::*;

    #[test]
    fn test_write_slots_exhausted_is_busy() {
        let controller = controller_with(|c| c.transfer.writes_in_flight = 2);
        let (transport, node) =
            attach_transport(&controller, MockTransport::holding_writes(), 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        assert_eq!(engine.submit_write(&device, b"a"), Ok(1));
        assert_eq!(engine.submit_write(&device, b"bc"), Ok(2));
        assert_eq!(engine.submit_write(&device, b"def"), Err(DriverError::Busy));
        assert_eq!(transport.out_submissions(), 2);

        assert_eq!(transport.complete_writes(Ok(())), 2);
        assert!(engine.drain_writes(&device, WAIT));
        assert_eq!(engine.submit_write(&device, b"def"), Ok(3));
    }

    #[test]
    fn test_drain_writes_times_out() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) =
            attach_transport(&controller, MockTransport::holding_writes(), 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        engine.submit_write(&device, b"held").unwrap();
        assert!(!engine.drain_writes(&device, Some(Duration::from_millis(20))));

        transport.complete_writes(Ok(()));
        assert!(engine.drain_writes(&device, Some(Duration::ZERO)));
    }
}

mod cancel_all {
    use super::*;

    #[test]
    fn test_cancel_all_quiesces_everything() {
        let controller = controller_with(|c| c.transfer.drain_timeout_ms = 20);
        let (transport, node) =
            attach_transport(&controller, MockTransport::holding_writes(), 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        engine.submit_write(&device, b"one").unwrap();
        engine.submit_write(&device, b"two").unwrap();
        let pending = engine.submit(&device, 8).unwrap();

        engine.cancel_all(&device);

        assert!(!engine.is_in_flight(&device, &pending));
        assert!(engine.drain_writes(&device, Some(Duration::ZERO)));
        assert_eq!(transport.pending_writes(), 0);
        assert_eq!(transport.pending_in_length(), None);
        // bulk-out after the drain timeout, then bulk-in
        assert_eq!(transport.cancel_count(), 2);

        // Idempotent
        engine.cancel_all(&device);
        assert_eq!(transport.cancel_count(), 2);
    }

    #[test]
    fn test_cancel_all_lets_writes_drain() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        engine.submit_write(&device, b"quick").unwrap();
        engine.cancel_all(&device);

        assert_eq!(transport.cancel_count(), 0);
        assert_eq!(transport.written(), vec![b"quick".to_vec()]);
        assert_eq!(device.take_error(), None);
    }

    #[test]
    fn test_submit_after_detach_is_disconnected() {
        let controller = LifecycleController::new(&DriverConfig::default());
        let (_transport, node) = attach_mock(&controller, 1, 4, 64);
        let device = controller.lookup(&node.name).unwrap();
        let engine = controller.engine();

        assert!(controller.on_detach(node.address));
        assert!(device.is_disconnected());
        assert_eq!(engine.submit(&device, 8), Err(DriverError::Disconnected));
        assert_eq!(
            engine.submit_write(&device, b"x"),
            Err(DriverError::Disconnected)
        );
    }
}

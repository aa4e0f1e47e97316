//! Async channel bridge between the Tokio runtime and the bus worker thread

use async_channel::{Receiver, Sender, bounded};
use protocol::{BusAddress, DeviceDescriptors, NodeInfo};

/// Capacity of both directions of the bridge
const BRIDGE_CAPACITY: usize = 256;

/// Commands from the Tokio runtime to the bus worker thread
#[derive(Debug)]
pub enum UsbCommand {
    /// List registered device nodes
    ListNodes {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<Vec<NodeInfo>>,
    },

    /// Detach every device and stop the worker
    Shutdown,
}

/// Lifecycle events published by the driver
#[derive(Debug, Clone)]
pub enum UsbEvent {
    /// A device was attached and its node registered
    DeviceAttached {
        /// Registered node
        node: NodeInfo,
        /// Descriptors reported at attach time
        descriptors: DeviceDescriptors,
    },

    /// A device was detached and its node unregistered
    DeviceDetached {
        /// Node name that was unregistered
        name: String,
        /// Bus location of the departed device
        address: BusAddress,
        /// References still held by open sessions or completions
        remaining_refs: usize,
    },

    /// A matching device could not be attached
    AttachRejected {
        /// Bus location of the rejected device
        address: BusAddress,
        /// Human-readable reason
        reason: String,
    },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct UsbBridge {
    cmd_tx: Sender<UsbCommand>,
    event_rx: Receiver<UsbEvent>,
}

impl UsbBridge {
    /// Send a command to the bus worker thread
    pub async fn send_command(&self, cmd: UsbCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the driver
    pub async fn recv_event(&self) -> crate::Result<UsbEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event without waiting
    pub fn try_recv_event(&self) -> Option<UsbEvent> {
        self.event_rx.try_recv().ok()
    }
}

/// Handle for the bus worker thread (blocking)
pub struct UsbWorker {
    pub(crate) cmd_rx: Receiver<UsbCommand>,
    /// Event sender (cloned into the lifecycle controller)
    pub event_tx: Sender<UsbEvent>,
}

impl UsbWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<UsbCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<UsbCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: UsbEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// True once every [`UsbBridge`] clone has been dropped
    pub fn is_orphaned(&self) -> bool {
        self.cmd_rx.is_closed()
    }
}

/// Create the channel bridge between Tokio and the bus worker thread
///
/// Returns (UsbBridge for Tokio, UsbWorker for the bus thread)
pub fn create_usb_bridge() -> (UsbBridge, UsbWorker) {
    let (cmd_tx, cmd_rx) = bounded(BRIDGE_CAPACITY);
    let (event_tx, event_rx) = bounded(BRIDGE_CAPACITY);

    (
        UsbBridge { cmd_tx, event_rx },
        UsbWorker { cmd_rx, event_tx },
    )
}

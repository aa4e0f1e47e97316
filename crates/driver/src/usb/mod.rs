//! USB subsystem
//!
//! - [`handle`]: the reference-counted device object
//! - [`transfers`]: bulk transfer engine and the transport seam
//! - [`session`]: per-open read/write sessions
//! - [`manager`]: attach/detach handling and the node registry
//! - [`device`] and [`worker`]: the libusb transport and bus thread
//!
//! Everything above the transport is synchronous and thread-safe; the
//! libusb side runs on dedicated threads so it never blocks the Tokio
//! runtime.

pub mod device;
pub mod handle;
pub mod manager;
pub mod session;
pub mod transfers;
pub mod worker;

pub use device::UsbDevice;
pub use handle::{DeviceHandle, DeviceObject};
pub use manager::LifecycleController;
pub use session::{FileSession, OpenOptions};
pub use transfers::{
    Completion, Interrupter, PendingTransfer, Rejected, TransferEngine, UsbTransport,
};
pub use worker::{UsbWorkerThread, spawn_usb_worker};

//! Arduino bulk-endpoint driver
//!
//! Binds to supported USB boards, registers a node per device and serves
//! reads and writes on it through bulk transfers.

pub mod config;
#[doc(hidden)]
pub mod test_utils;
pub mod usb;

pub use config::DriverConfig;
pub use protocol::{DriverError, Result};
pub use usb::{FileSession, LifecycleController, OpenOptions};

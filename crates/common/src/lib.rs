//! Common utilities for ardu-usb
//!
//! This crate provides shared functionality for the driver crate and its
//! binary: the common error type, logging setup, the async channel bridge
//! between the blocking bus worker thread and the Tokio runtime, and test
//! helpers.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{UsbBridge, UsbCommand, UsbEvent, UsbWorker, create_usb_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;

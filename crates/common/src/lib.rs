//! Common utilities for xserve-fp
//!
//! This crate provides functionality shared between the driver core and its
//! host integration: the USB transport abstraction, the channel bridge for
//! the libusb event thread, error handling, logging setup and test
//! utilities.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{HostBridge, HostEvent, HostNotifier, create_host_bridge};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use usb_types::{BusLocation, EndpointInfo, EndpointKind, UsbTransport, front_panel};

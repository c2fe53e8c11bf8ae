//! Host bus integration
//!
//! Connects the driver core to real hardware through libusb:
//! - probing a front panel and claiming its interface ([`device`])
//! - hot-plug detection on a dedicated thread ([`worker`])
//!
//! The USB thread never touches a session. It only reports arrivals and
//! departures; the Tokio side probes, attaches and detaches.

pub mod device;
pub mod worker;

pub use device::{ClaimedInterface, find_front_panels, probe};
pub use worker::{UsbWorker, dispatch_host_events, spawn_usb_worker};

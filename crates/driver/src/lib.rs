//! xserve-fp
//!
//! User-space driver for the Apple Xserve front panel (`05ac:821b`).
//!
//! The panel exposes a bulk endpoint pair for data, two vendor control
//! requests (status query and actuator) and an interrupt endpoint carrying
//! unsolicited event reports. The driver binds to it on arrival, hands out
//! [`SessionHandle`]s by minor number, serializes bulk and control traffic
//! per device and keeps an interrupt listener running in the background.
//!
//! ```no_run
//! # async fn example() -> xserve_fp::Result<()> {
//! use xserve_fp::{Driver, DriverConfig};
//!
//! let driver = Driver::new(&DriverConfig::default());
//! // ... driver.attach(request).await? from the host integration ...
//! let handle = driver.open(192)?;
//! handle.set_actuator(127).await?;
//! let status = handle.get_status().await?;
//! # let _ = status;
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod monitor;
pub mod registry;
pub mod service;
mod session;
mod transfer;
pub mod usb;

pub use command::{DeviceCommand, GET_STATUS, SET_ACTUATOR};
pub use config::DriverConfig;
pub use discovery::{EndpointMap, discover_endpoints};
pub use error::{DriverError, EndpointRole, Result};
pub use handle::{Interrupter, SessionHandle};
pub use lifecycle::{AttachRequest, Driver};
pub use monitor::{ChannelSink, EventSink, InterruptEvent, MonitorState, MonitorStatus};
pub use registry::SessionRegistry;
pub use session::{DeviceIdentity, Lifecycle};
pub use transfer::BULK_TIMEOUT;

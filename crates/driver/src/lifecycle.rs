//! Attach, detach and open
//!
//! The [`Driver`] owns the minor registry and decides which devices it
//! binds to. Attach builds a complete session or nothing; detach tears one
//! down in a fixed order so no operation runs against freed state.

use crate::config::DriverConfig;
use crate::discovery::discover_endpoints;
use crate::error::{DriverError, Result};
use crate::handle::SessionHandle;
use crate::monitor::{EventMonitor, EventSink, Listener};
use crate::registry::SessionRegistry;
use crate::session::{DeviceIdentity, DeviceSession, alloc_zeroed};
use common::{BusLocation, EndpointInfo, UsbTransport, front_panel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A device offered to the driver by the host
pub struct AttachRequest {
    pub vendor_id: u16,
    pub product_id: u16,
    pub location: BusLocation,
    /// Endpoints of interface 0 of the active configuration
    pub endpoints: Vec<EndpointInfo>,
    pub transport: Arc<dyn UsbTransport>,
}

impl std::fmt::Debug for AttachRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachRequest")
            .field("vendor_id", &format_args!("{:04x}", self.vendor_id))
            .field("product_id", &format_args!("{:04x}", self.product_id))
            .field("location", &self.location)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

pub struct Driver {
    registry: Arc<SessionRegistry>,
    monitor_enabled: bool,
    poll_interval: Duration,
    event_backlog: usize,
    sink: Option<Arc<dyn EventSink>>,
}

impl Driver {
    pub fn new(config: &DriverConfig) -> Self {
        let registry = SessionRegistry::new(config.driver.minor_base, config.driver.max_devices);
        Self::with_registry(config, Arc::new(registry))
    }

    /// Use an externally owned registry
    pub fn with_registry(config: &DriverConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            monitor_enabled: config.monitor.enabled,
            poll_interval: config.monitor.poll_interval(),
            event_backlog: config.monitor.event_backlog,
            sink: None,
        }
    }

    /// Forward every interrupt event of every session to `sink`
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// True for the one device this driver binds to
    pub fn matches(vendor_id: u16, product_id: u16) -> bool {
        vendor_id == front_panel::VENDOR_ID && product_id == front_panel::PRODUCT_ID
    }

    /// Bind to a newly arrived device, returning its minor number
    ///
    /// Must be called from within a Tokio runtime; the event monitor is
    /// spawned onto it.
    pub async fn attach(&self, request: AttachRequest) -> Result<u32> {
        if !Self::matches(request.vendor_id, request.product_id) {
            return Err(DriverError::UnsupportedDevice {
                vendor_id: request.vendor_id,
                product_id: request.product_id,
            });
        }

        let endpoints = discover_endpoints(&request.endpoints)?;
        debug!("Endpoints for {}: {:?}", request.location, endpoints);

        let listener_buffer = match endpoints.interrupt_in {
            Some(ep) if self.monitor_enabled => {
                Some(alloc_zeroed(ep.max_packet, "interrupt buffer")?)
            }
            _ => None,
        };

        let identity = DeviceIdentity {
            vendor_id: request.vendor_id,
            product_id: request.product_id,
            location: request.location,
        };
        let session = Arc::new(DeviceSession::new(
            identity,
            endpoints,
            request.transport.clone(),
            self.event_backlog,
        )?);

        let minor = self.registry.register(session.clone())?;

        if let (Some(endpoint), Some(buffer)) = (endpoints.interrupt_in, listener_buffer) {
            let monitor = EventMonitor::arm(Listener {
                minor,
                transport: request.transport,
                endpoint,
                buffer,
                poll_interval: self.poll_interval,
                backlog: session.events().clone(),
                sink: self.sink.clone(),
            });
            if let Some(monitor) = session.install_monitor(monitor) {
                // Detached between registration and arming.
                monitor.cancel().await;
                return Err(DriverError::SessionDetached);
            }
        }

        info!(
            "Front panel at {} attached as minor {}",
            identity.location, minor
        );
        Ok(minor)
    }

    /// Unbind the session at `minor`
    ///
    /// Returns once the monitor has stopped and no transfer is in flight.
    /// Returns `false` if there was nothing to detach.
    pub async fn detach(&self, minor: u32) -> bool {
        let Some(session) = self.registry.lookup(minor) else {
            debug!("Detach of unknown minor {}", minor);
            return false;
        };

        if !session.begin_detach() {
            debug!("Minor {} is already detaching", minor);
            return false;
        }

        // No new opens from here on; open handles keep the session alive
        // but see it as detached.
        self.registry.deregister(minor);
        session.finish_detach().await;
        true
    }

    /// Detach whichever session sits at `location`
    pub async fn detach_location(&self, location: BusLocation) -> bool {
        let minor = self.registry.minors().into_iter().find(|minor| {
            self.registry
                .lookup(*minor)
                .is_some_and(|s| s.identity().location == location)
        });
        match minor {
            Some(minor) => self.detach(minor).await,
            None => false,
        }
    }

    /// Open a handle on the session at `minor`
    pub fn open(&self, minor: u32) -> Result<SessionHandle> {
        let session = self
            .registry
            .lookup(minor)
            .ok_or(DriverError::NoSuchDevice(minor))?;
        Ok(SessionHandle::new(minor, session))
    }

    /// Detach every session
    pub async fn shutdown(&self) {
        let minors = self.registry.minors();
        if !minors.is_empty() {
            info!("Detaching {} front panel(s)", minors.len());
        }
        for minor in minors {
            if !self.detach(minor).await {
                warn!("Minor {} vanished during shutdown", minor);
            }
        }
    }
}

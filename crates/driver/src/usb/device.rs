//! Probing a front panel on the host bus
//!
//! Turns a libusb [`Device`] into an [`AttachRequest`]: reads interface 0 of
//! the active configuration, opens the device, takes the interface away from
//! any kernel driver and claims it. The resulting [`ClaimedInterface`] is the
//! session's transport and gives the interface back when dropped.

use crate::lifecycle::{AttachRequest, Driver};
use common::{BusLocation, EndpointInfo, UsbTransport};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The only interface the driver binds to
pub const INTERFACE: u8 = 0;

/// An opened device with [`INTERFACE`] claimed
pub struct ClaimedInterface {
    handle: DeviceHandle<Context>,
    location: BusLocation,
    kernel_driver_detached: bool,
}

impl ClaimedInterface {
    /// Open `device` and claim [`INTERFACE`]
    pub fn claim(device: &Device<Context>) -> rusb::Result<Self> {
        let location = location_of(device);
        let handle = device.open().inspect_err(|e| {
            warn!("Failed to open front panel at {}: {}", location, e);
        })?;

        let kernel_driver_detached = match handle.kernel_driver_active(INTERFACE) {
            Ok(true) => {
                debug!("Detaching kernel driver from {} interface {}", location, INTERFACE);
                handle.detach_kernel_driver(INTERFACE)?;
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!("Could not check kernel driver status on {}: {}", location, e);
                false
            }
        };

        let claimed = Self {
            handle,
            location,
            kernel_driver_detached,
        };
        // On failure `claimed` drops here and hands the interface back.
        claimed.handle.claim_interface(INTERFACE).inspect_err(|e| {
            warn!("Failed to claim interface {} on {}: {}", INTERFACE, location, e);
        })?;

        debug!("Claimed interface {} on {}", INTERFACE, location);
        Ok(claimed)
    }

    pub fn location(&self) -> BusLocation {
        self.location
    }
}

impl Drop for ClaimedInterface {
    fn drop(&mut self) {
        // Fails harmlessly if the claim never succeeded or the device is gone.
        if let Err(e) = self.handle.release_interface(INTERFACE) {
            debug!("Release of interface {} on {}: {}", INTERFACE, self.location, e);
        }
        if self.kernel_driver_detached {
            match self.handle.attach_kernel_driver(INTERFACE) {
                Ok(()) => debug!("Reattached kernel driver on {}", self.location),
                Err(e) => debug!("Could not reattach kernel driver on {}: {}", self.location, e),
            }
        }
    }
}

impl UsbTransport for ClaimedInterface {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.read_bulk(endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle.read_interrupt(endpoint, buf, timeout)
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
    }
}

pub fn location_of<T: UsbContext>(device: &Device<T>) -> BusLocation {
    BusLocation {
        bus: device.bus_number(),
        address: device.address(),
    }
}

/// Endpoints of [`INTERFACE`], first alternate setting, active configuration
pub fn interface_endpoints<T: UsbContext>(device: &Device<T>) -> rusb::Result<Vec<EndpointInfo>> {
    let config = device.active_config_descriptor()?;
    let interface = config
        .interfaces()
        .find(|iface| iface.number() == INTERFACE)
        .ok_or(rusb::Error::NotFound)?;
    let setting = interface
        .descriptors()
        .next()
        .ok_or(rusb::Error::NotFound)?;

    Ok(setting
        .endpoint_descriptors()
        .map(|ep| EndpointInfo::from(&ep))
        .collect())
}

/// Read descriptors, claim the interface and build the attach request
///
/// Blocking; run it off the async runtime.
pub fn probe(device: &Device<Context>) -> rusb::Result<AttachRequest> {
    let descriptor = device.device_descriptor()?;
    let location = location_of(device);

    if !Driver::matches(descriptor.vendor_id(), descriptor.product_id()) {
        debug!(
            "Ignoring {:04x}:{:04x} at {}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            location
        );
        return Err(rusb::Error::NotSupported);
    }

    let endpoints = interface_endpoints(device)?;
    let claimed = ClaimedInterface::claim(device)?;
    let transport: Arc<dyn UsbTransport> = Arc::new(claimed);

    Ok(AttachRequest {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        location,
        endpoints,
        transport,
    })
}

/// Front panels currently on the bus
pub fn find_front_panels(context: &Context) -> rusb::Result<Vec<Device<Context>>> {
    let devices = context.devices()?;
    Ok(devices
        .iter()
        .filter(|device| {
            device
                .device_descriptor()
                .is_ok_and(|d| Driver::matches(d.vendor_id(), d.product_id()))
        })
        .collect())
}

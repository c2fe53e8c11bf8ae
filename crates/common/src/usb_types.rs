//! USB type abstractions shared by the driver core, the host integration and
//! the test simulator.
//!
//! The driver never talks to libusb directly. Every bus round trip goes
//! through [`UsbTransport`], which is implemented for real
//! [`rusb::DeviceHandle`]s and for the scripted device in
//! [`crate::test_utils`].

use rusb::{Direction, TransferType, UsbContext};
use std::fmt;
use std::time::Duration;

/// Identity and vendor protocol of the Xserve front panel.
pub mod front_panel {
    /// Apple
    pub const VENDOR_ID: u16 = 0x05ac;
    /// Xserve front panel
    pub const PRODUCT_ID: u16 = 0x821b;

    /// Vendor request: read the 4-byte status word
    pub const REQUEST_GET_STATUS: u8 = 0x01;
    /// Vendor request: set the actuator from `wValue`
    pub const REQUEST_SET_ACTUATOR: u8 = 0x02;

    /// `bmRequestType` for device-to-host vendor requests (IN | VENDOR | DEVICE)
    pub const VENDOR_IN: u8 = 0xc0;
    /// `bmRequestType` for host-to-device vendor requests (OUT | VENDOR | DEVICE)
    pub const VENDOR_OUT: u8 = 0x40;

    /// Size of the status payload
    pub const STATUS_LEN: usize = 4;
}

/// Synchronous bus operations a device connection must provide.
///
/// All methods block the calling thread for at most `timeout`. Errors are
/// reported with the bus status unchanged so that callers can surface it.
pub trait UsbTransport: Send + Sync + 'static {
    /// Bulk IN transfer into `buf`, returning the number of bytes received.
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize>;

    /// Bulk OUT transfer of `data`, returning the number of bytes sent.
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Interrupt IN transfer into `buf`.
    fn read_interrupt(&self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> rusb::Result<usize>;

    /// Control transfer from device to host on endpoint 0.
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Control transfer from host to device on endpoint 0.
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;
}

impl<T: UsbContext + 'static> UsbTransport for rusb::DeviceHandle<T> {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> rusb::Result<usize> {
        rusb::DeviceHandle::read_bulk(self, endpoint, buf, timeout)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        rusb::DeviceHandle::write_bulk(self, endpoint, data, timeout)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        rusb::DeviceHandle::read_interrupt(self, endpoint, buf, timeout)
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
        rusb::DeviceHandle::read_control(self, request_type, request, value, index, buf, timeout)
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
        rusb::DeviceHandle::write_control(self, request_type, request, value, index, data, timeout)
    }
}

/// Where a device sits on the host bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BusLocation {
    pub bus: u8,
    pub address: u8,
}

impl fmt::Display for BusLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Transfer kind and direction of an endpoint, as far as the driver cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    BulkIn,
    BulkOut,
    InterruptIn,
    /// Anything else (isochronous, interrupt OUT, ...). Ignored by discovery.
    Other,
}

impl EndpointKind {
    pub fn classify(transfer_type: TransferType, direction: Direction) -> Self {
        match (transfer_type, direction) {
            (TransferType::Bulk, Direction::In) => EndpointKind::BulkIn,
            (TransferType::Bulk, Direction::Out) => EndpointKind::BulkOut,
            (TransferType::Interrupt, Direction::In) => EndpointKind::InterruptIn,
            _ => EndpointKind::Other,
        }
    }
}

/// One endpoint from an interface descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit (e.g. `0x81`)
    pub address: u8,
    pub kind: EndpointKind,
    /// Raw `wMaxPacketSize` field
    pub max_packet_size: u16,
}

impl EndpointInfo {
    /// Usable packet size: bits 10..0 of `wMaxPacketSize`.
    ///
    /// Bits 12..11 encode additional transactions per microframe on
    /// high-speed high-bandwidth endpoints and are not part of the size.
    pub fn max_packet(&self) -> usize {
        usize::from(self.max_packet_size & 0x07ff)
    }
}

impl From<&rusb::EndpointDescriptor<'_>> for EndpointInfo {
    fn from(desc: &rusb::EndpointDescriptor<'_>) -> Self {
        Self {
            address: desc.address(),
            kind: EndpointKind::classify(desc.transfer_type(), desc.direction()),
            max_packet_size: desc.max_packet_size(),
        }
    }
}

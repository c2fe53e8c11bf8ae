//! Test utilities for xserve-fp
//!
//! Provides a scripted front panel that implements [`UsbTransport`], endpoint
//! layouts for attach tests and small async helpers.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{SimulatedFrontPanel, front_panel_endpoints};
//!
//! let panel = SimulatedFrontPanel::new();
//! panel.queue_bulk_in(vec![1, 2, 3]);
//! assert_eq!(front_panel_endpoints().len(), 3);
//! ```

use crate::usb_types::{EndpointInfo, EndpointKind, UsbTransport, front_panel};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bulk IN endpoint of the simulated panel
pub const SIM_BULK_IN: u8 = 0x81;
/// Bulk OUT endpoint of the simulated panel
pub const SIM_BULK_OUT: u8 = 0x02;
/// Interrupt IN endpoint of the simulated panel
pub const SIM_INTERRUPT_IN: u8 = 0x83;
/// Max packet size of the simulated bulk endpoints
pub const SIM_BULK_PACKET: u16 = 64;
/// Max packet size of the simulated interrupt endpoint
pub const SIM_INTERRUPT_PACKET: u16 = 8;

/// How long an idle simulated interrupt poll waits before timing out
const IDLE_INTERRUPT_WAIT: Duration = Duration::from_millis(5);

/// Endpoint layout of a complete front panel (bulk pair + interrupt IN)
pub fn front_panel_endpoints() -> Vec<EndpointInfo> {
    vec![
        endpoint(SIM_BULK_IN, EndpointKind::BulkIn, SIM_BULK_PACKET),
        endpoint(SIM_BULK_OUT, EndpointKind::BulkOut, SIM_BULK_PACKET),
        endpoint(SIM_INTERRUPT_IN, EndpointKind::InterruptIn, SIM_INTERRUPT_PACKET),
    ]
}

/// Front panel layout with the bulk OUT endpoint missing
pub fn endpoints_without_bulk_out() -> Vec<EndpointInfo> {
    front_panel_endpoints()
        .into_iter()
        .filter(|ep| ep.kind != EndpointKind::BulkOut)
        .collect()
}

/// Front panel layout without an interrupt endpoint
pub fn endpoints_without_interrupt() -> Vec<EndpointInfo> {
    front_panel_endpoints()
        .into_iter()
        .filter(|ep| ep.kind != EndpointKind::InterruptIn)
        .collect()
}

/// Build a single endpoint descriptor entry
pub fn endpoint(address: u8, kind: EndpointKind, max_packet_size: u16) -> EndpointInfo {
    EndpointInfo {
        address,
        kind,
        max_packet_size,
    }
}

/// Encode a control transfer setup packet (little-endian fields)
pub fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let [value_lo, value_hi] = value.to_le_bytes();
    let [index_lo, index_hi] = index.to_le_bytes();
    let [length_lo, length_hi] = length.to_le_bytes();
    [
        request_type,
        request,
        value_lo,
        value_hi,
        index_lo,
        index_hi,
        length_lo,
        length_hi,
    ]
}

/// Payload of `len` bytes all set to `byte`
pub fn fill_pattern(byte: u8, len: usize) -> Vec<u8> {
    vec![byte; len]
}

/// A control request as seen by the simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    /// Setup packet
    pub setup: [u8; 8],
    /// Payload sent by the host (empty for IN requests)
    pub data: Vec<u8>,
}

impl ControlRecord {
    pub fn request_type(&self) -> u8 {
        self.setup[0]
    }

    pub fn request(&self) -> u8 {
        self.setup[1]
    }

    pub fn value(&self) -> u16 {
        u16::from_le_bytes([self.setup[2], self.setup[3]])
    }

    pub fn index(&self) -> u16 {
        u16::from_le_bytes([self.setup[4], self.setup[5]])
    }

    pub fn length(&self) -> u16 {
        u16::from_le_bytes([self.setup[6], self.setup[7]])
    }
}

#[derive(Default)]
struct PanelState {
    bulk_in: VecDeque<rusb::Result<Vec<u8>>>,
    bulk_in_delay: Duration,
    received: Vec<u8>,
    write_pacing: Duration,
    write_limit: Option<usize>,
    write_error: Option<rusb::Error>,
    actuator: u16,
    status_len: Option<usize>,
    control_error: Option<rusb::Error>,
    control_log: Vec<ControlRecord>,
    interrupt_script: VecDeque<rusb::Result<Vec<u8>>>,
}

/// Scripted Xserve front panel
///
/// - bulk IN returns queued packets, truncated to the caller's buffer, and
///   times out when the queue is empty;
/// - bulk OUT appends to a device-side log, optionally in paced chunks so
///   that unserialized writers would visibly interleave;
/// - `SET_ACTUATOR` stores `wValue`, `GET_STATUS` echoes it back as a
///   sign-extended little-endian `i32`; other vendor requests stall;
/// - interrupt IN replays a script of completions and times out when the
///   script is exhausted.
pub struct SimulatedFrontPanel {
    state: Mutex<PanelState>,
    interrupt_submissions: AtomicUsize,
    bulk_transfers: AtomicUsize,
}

impl SimulatedFrontPanel {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PanelState::default()),
            interrupt_submissions: AtomicUsize::new(0),
            bulk_transfers: AtomicUsize::new(0),
        }
    }

    /// Queue a packet for the next bulk IN transfer
    pub fn queue_bulk_in(&self, data: Vec<u8>) {
        self.state.lock().unwrap().bulk_in.push_back(Ok(data));
    }

    /// Make the next bulk IN transfer fail with `error`
    pub fn fail_bulk_in(&self, error: rusb::Error) {
        self.state.lock().unwrap().bulk_in.push_back(Err(error));
    }

    /// Hold every bulk IN transfer for `delay` before completing it
    pub fn set_bulk_in_delay(&self, delay: Duration) {
        self.state.lock().unwrap().bulk_in_delay = delay;
    }

    /// Sleep for `pacing` after every 8 bytes written
    pub fn set_write_pacing(&self, pacing: Duration) {
        self.state.lock().unwrap().write_pacing = pacing;
    }

    /// Accept at most `limit` bytes per bulk OUT transfer
    pub fn set_write_limit(&self, limit: usize) {
        self.state.lock().unwrap().write_limit = Some(limit);
    }

    /// Make every bulk OUT transfer fail with `error`
    pub fn fail_writes(&self, error: rusb::Error) {
        self.state.lock().unwrap().write_error = Some(error);
    }

    /// Everything written through bulk OUT, in arrival order
    pub fn received(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    /// Current actuator value as last set by the host
    pub fn actuator(&self) -> u16 {
        self.state.lock().unwrap().actuator
    }

    /// Reply to `GET_STATUS` with only `len` bytes
    pub fn truncate_status(&self, len: usize) {
        self.state.lock().unwrap().status_len = Some(len);
    }

    /// Make every control request fail with `error`
    pub fn fail_controls(&self, error: rusb::Error) {
        self.state.lock().unwrap().control_error = Some(error);
    }

    /// Control requests received so far
    pub fn control_log(&self) -> Vec<ControlRecord> {
        self.state.lock().unwrap().control_log.clone()
    }

    /// Append a successful interrupt completion to the script
    pub fn queue_interrupt(&self, data: Vec<u8>) {
        self.state.lock().unwrap().interrupt_script.push_back(Ok(data));
    }

    /// Append a failed interrupt completion to the script
    pub fn fail_interrupt(&self, error: rusb::Error) {
        self.state.lock().unwrap().interrupt_script.push_back(Err(error));
    }

    /// Number of interrupt IN requests the host has submitted
    pub fn interrupt_submissions(&self) -> usize {
        self.interrupt_submissions.load(Ordering::SeqCst)
    }

    /// Number of bulk transfers (either direction) that reached the device
    pub fn bulk_transfers(&self) -> usize {
        self.bulk_transfers.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedFrontPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl UsbTransport for SimulatedFrontPanel {
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> rusb::Result<usize> {
        if endpoint != SIM_BULK_IN {
            return Err(rusb::Error::InvalidParam);
        }
        self.bulk_transfers.fetch_add(1, Ordering::SeqCst);

        let (next, delay) = {
            let mut state = self.state.lock().unwrap();
            (state.bulk_in.pop_front(), state.bulk_in_delay)
        };
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        match next {
            Some(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => Err(rusb::Error::Timeout),
        }
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> rusb::Result<usize> {
        if endpoint != SIM_BULK_OUT {
            return Err(rusb::Error::InvalidParam);
        }
        self.bulk_transfers.fetch_add(1, Ordering::SeqCst);

        let (pacing, limit) = {
            let state = self.state.lock().unwrap();
            if let Some(error) = state.write_error {
                return Err(error);
            }
            (state.write_pacing, state.write_limit)
        };

        let accepted = limit.map_or(data.len(), |limit| limit.min(data.len()));
        for chunk in data[..accepted].chunks(8) {
            self.state.lock().unwrap().received.extend_from_slice(chunk);
            if !pacing.is_zero() {
                std::thread::sleep(pacing);
            }
        }
        Ok(accepted)
    }

    fn read_interrupt(
        &self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        if endpoint != SIM_INTERRUPT_IN {
            return Err(rusb::Error::InvalidParam);
        }
        self.interrupt_submissions.fetch_add(1, Ordering::SeqCst);

        let next = self.state.lock().unwrap().interrupt_script.pop_front();
        match next {
            Some(Ok(report)) => {
                let len = report.len().min(buf.len());
                buf[..len].copy_from_slice(&report[..len]);
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => {
                std::thread::sleep(IDLE_INTERRUPT_WAIT.min(timeout));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let length = u16::try_from(buf.len()).unwrap_or(u16::MAX);
        state.control_log.push(ControlRecord {
            setup: setup_packet(request_type, request, value, index, length),
            data: Vec::new(),
        });
        if let Some(error) = state.control_error {
            return Err(error);
        }
        if request_type != front_panel::VENDOR_IN || request != front_panel::REQUEST_GET_STATUS {
            return Err(rusb::Error::Pipe);
        }

        let status = i32::from(state.actuator as i16).to_le_bytes();
        let len = state
            .status_len
            .unwrap_or(status.len())
            .min(status.len())
            .min(buf.len());
        buf[..len].copy_from_slice(&status[..len]);
        Ok(len)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let length = u16::try_from(data.len()).unwrap_or(u16::MAX);
        state.control_log.push(ControlRecord {
            setup: setup_packet(request_type, request, value, index, length),
            data: data.to_vec(),
        });
        if let Some(error) = state.control_error {
            return Err(error);
        }
        if request_type != front_panel::VENDOR_OUT || request != front_panel::REQUEST_SET_ACTUATOR {
            return Err(rusb::Error::Pipe);
        }

        state.actuator = value;
        Ok(data.len())
    }
}

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let value = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(value, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Poll `condition` every millisecond until it holds or `duration` elapses
pub async fn wait_until<F>(duration: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

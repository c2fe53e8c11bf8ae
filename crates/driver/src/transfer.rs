//! Bulk data transfer
//!
//! Reads and writes go through the session's I/O lock and execute as one
//! blocking bulk transfer each. Short transfers are returned as-is.

use crate::error::{DriverError, Result};
use crate::handle::Interrupter;
use crate::session::{DeviceSession, alloc_empty, live_transport, run_locked};
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline for a single bulk transfer
pub const BULK_TIMEOUT: Duration = Duration::from_secs(5);

/// One bulk IN transfer of at most `min(max_len, max packet)` bytes
pub(crate) async fn read(
    session: &DeviceSession,
    interrupter: &Interrupter,
    max_len: usize,
) -> Result<Vec<u8>> {
    session.ensure_attached()?;
    if max_len == 0 {
        return Ok(Vec::new());
    }

    let endpoint = session.endpoints().bulk_in.address;
    let guard = session.lock_io(interrupter).await?;

    run_locked(
        guard,
        DriverError::TransferFailed(rusb::Error::Other),
        move |io| {
            let transport = live_transport(io)?.clone();
            let len = io.bulk_in.len().min(max_len);
            let buf = &mut io.bulk_in[..len];

            match transport.read_bulk(endpoint, buf, BULK_TIMEOUT) {
                Ok(received) => {
                    let received = received.min(len);
                    debug!("Bulk IN {:#04x}: {} of {} bytes", endpoint, received, len);
                    // Copied out while the lock is still held.
                    Ok(buf[..received].to_vec())
                }
                Err(status) => {
                    warn!("Bulk IN {:#04x} failed: {}", endpoint, status);
                    Err(DriverError::TransferFailed(status))
                }
            }
        },
    )
    .await
}

/// One bulk OUT transfer of `data`, returning the bytes the device accepted
pub(crate) async fn write(
    session: &DeviceSession,
    interrupter: &Interrupter,
    data: &[u8],
) -> Result<usize> {
    session.ensure_attached()?;
    if data.is_empty() {
        return Ok(0);
    }

    let mut outgoing = alloc_empty(data.len(), "bulk-out buffer")?;
    outgoing.extend_from_slice(data);

    let endpoint = session.endpoints().bulk_out;
    let guard = session.lock_io(interrupter).await?;

    run_locked(
        guard,
        DriverError::TransferFailed(rusb::Error::Other),
        move |io| {
            let transport = live_transport(io)?;

            match transport.write_bulk(endpoint, &outgoing, BULK_TIMEOUT) {
                Ok(sent) => {
                    if sent < outgoing.len() {
                        debug!(
                            "Short bulk OUT {:#04x}: {} of {} bytes",
                            endpoint,
                            sent,
                            outgoing.len()
                        );
                    } else {
                        debug!("Bulk OUT {:#04x}: {} bytes", endpoint, sent);
                    }
                    Ok(sent)
                }
                Err(status) => {
                    warn!("Bulk OUT {:#04x} failed: {}", endpoint, status);
                    Err(DriverError::TransferFailed(status))
                }
            }
        },
    )
    .await
}

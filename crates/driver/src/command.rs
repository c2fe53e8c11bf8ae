//! Vendor control commands
//!
//! The panel understands two vendor requests on the default control pipe:
//!
//! | Command     | bmRequestType | bRequest | wValue | Data              |
//! |-------------|---------------|----------|--------|-------------------|
//! | GetStatus   | `0xc0` (IN)   | `0x01`   | 0      | 4 bytes, LE `i32` |
//! | SetActuator | `0x40` (OUT)  | `0x02`   | value  | none              |
//!
//! Both hold the session's I/O lock, so they never overlap a bulk transfer.
//! [`control`] exposes them through ioctl-style numbered commands taking a
//! 4-byte native-endian argument.

use crate::error::{DriverError, Result};
use crate::handle::Interrupter;
use crate::session::{DeviceSession, live_transport, run_locked};
use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use common::front_panel;
use std::time::Duration;
use tracing::{debug, warn};

/// Deadline for a single vendor request
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(1);

/// `_IOR('X', 1, i32)`
pub const GET_STATUS: u32 = 0x8004_5801;
/// `_IOW('X', 2, i32)`
pub const SET_ACTUATOR: u32 = 0x4004_5802;

/// Size of the argument exchanged by every numbered command
pub const ARG_LEN: usize = 4;

/// Numbered device commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    GetStatus,
    SetActuator,
}

impl DeviceCommand {
    pub fn code(self) -> u32 {
        match self {
            DeviceCommand::GetStatus => GET_STATUS,
            DeviceCommand::SetActuator => SET_ACTUATOR,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceCommand::GetStatus => "GetStatus",
            DeviceCommand::SetActuator => "SetActuator",
        }
    }
}

impl TryFrom<u32> for DeviceCommand {
    type Error = DriverError;

    fn try_from(code: u32) -> Result<Self> {
        match code {
            GET_STATUS => Ok(DeviceCommand::GetStatus),
            SET_ACTUATOR => Ok(DeviceCommand::SetActuator),
            other => Err(DriverError::UnsupportedCommand(other)),
        }
    }
}

/// Read the panel's 32-bit status word
pub(crate) async fn get_status(session: &DeviceSession, interrupter: &Interrupter) -> Result<i32> {
    let command = DeviceCommand::GetStatus.name();
    let guard = session.lock_io(interrupter).await?;

    run_locked(
        guard,
        DriverError::CommandFailed {
            command,
            status: rusb::Error::Other,
        },
        move |io| {
            let transport = live_transport(io)?;
            let mut payload = [0u8; front_panel::STATUS_LEN];

            let received = transport
                .read_control(
                    front_panel::VENDOR_IN,
                    front_panel::REQUEST_GET_STATUS,
                    0,
                    0,
                    &mut payload,
                    COMMAND_TIMEOUT,
                )
                .map_err(|status| {
                    warn!("{} failed: {}", command, status);
                    DriverError::CommandFailed { command, status }
                })?;

            if received < payload.len() {
                warn!(
                    "{} returned {} of {} bytes",
                    command,
                    received,
                    payload.len()
                );
                return Err(DriverError::CommandFailed {
                    command,
                    status: rusb::Error::Io,
                });
            }

            let status = LittleEndian::read_i32(&payload);
            debug!("{} -> {}", command, status);
            Ok(status)
        },
    )
    .await
}

/// Set the actuator; `value` travels in the 16-bit `wValue` field
pub(crate) async fn set_actuator(
    session: &DeviceSession,
    interrupter: &Interrupter,
    value: i32,
) -> Result<()> {
    session.ensure_attached()?;
    let wire_value = actuator_wire_value(value)?;
    let command = DeviceCommand::SetActuator.name();
    let guard = session.lock_io(interrupter).await?;

    run_locked(
        guard,
        DriverError::CommandFailed {
            command,
            status: rusb::Error::Other,
        },
        move |io| {
            let transport = live_transport(io)?;

            transport
                .write_control(
                    front_panel::VENDOR_OUT,
                    front_panel::REQUEST_SET_ACTUATOR,
                    wire_value,
                    0,
                    &[],
                    COMMAND_TIMEOUT,
                )
                .map_err(|status| {
                    warn!("{} failed: {}", command, status);
                    DriverError::CommandFailed { command, status }
                })?;

            debug!("{}({})", command, value);
            Ok(())
        },
    )
    .await
}

/// Dispatch a numbered command
///
/// `GET_STATUS` stores the status into `arg`; `SET_ACTUATOR` takes the value
/// from it. A detached session fails first; unknown commands are rejected
/// before the argument is inspected.
pub(crate) async fn control(
    session: &DeviceSession,
    interrupter: &Interrupter,
    code: u32,
    arg: &mut [u8],
) -> Result<()> {
    session.ensure_attached()?;
    let command = DeviceCommand::try_from(code)?;
    if arg.len() != ARG_LEN {
        return Err(DriverError::BoundaryFault {
            expected: ARG_LEN,
            actual: arg.len(),
        });
    }

    match command {
        DeviceCommand::GetStatus => {
            let status = get_status(session, interrupter).await?;
            NativeEndian::write_i32(arg, status);
        }
        DeviceCommand::SetActuator => {
            let value = NativeEndian::read_i32(arg);
            set_actuator(session, interrupter, value).await?;
        }
    }
    Ok(())
}

/// Accepts anything representable in 16 bits, signed or unsigned
fn actuator_wire_value(value: i32) -> Result<u16> {
    if !(i32::from(i16::MIN)..=i32::from(u16::MAX)).contains(&value) {
        return Err(DriverError::InvalidArgument(format!(
            "actuator value {} does not fit in 16 bits",
            value
        )));
    }
    Ok(value as u16)
}

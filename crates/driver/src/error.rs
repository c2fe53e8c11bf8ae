//! Driver error types

use thiserror::Error;

/// Which mandatory endpoint an interface descriptor lacked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    BulkIn,
    BulkOut,
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointRole::BulkIn => f.write_str("bulk-in"),
            EndpointRole::BulkOut => f.write_str("bulk-out"),
        }
    }
}

/// Errors returned by every driver operation
#[derive(Debug, Error)]
pub enum DriverError {
    /// Attach was offered a device this driver does not bind to
    #[error("Unsupported device {vendor_id:04x}:{product_id:04x}")]
    UnsupportedDevice { vendor_id: u16, product_id: u16 },

    /// A mandatory bulk endpoint is absent from the interface
    #[error("Could not find a {0} endpoint")]
    EndpointMissing(EndpointRole),

    /// A buffer could not be allocated
    #[error("Failed to allocate {size} bytes for {what}")]
    AllocationFailure { what: &'static str, size: usize },

    /// No minor identifier is free
    #[error("No free minor number (capacity {capacity})")]
    RegistrationFailed { capacity: u32 },

    /// Open was given a minor identifier with no live session
    #[error("No device at minor {0}")]
    NoSuchDevice(u32),

    /// The session has been (or is being) detached
    #[error("Device has been disconnected")]
    SessionDetached,

    /// The wait for the session lock was interrupted; retry
    #[error("Interrupted while waiting for the device")]
    Interrupted,

    /// Bulk transfer timed out or the bus reported an error
    #[error("Bulk transfer failed: {0}")]
    TransferFailed(rusb::Error),

    /// Vendor control request timed out or errored
    #[error("{command} failed: {status}")]
    CommandFailed {
        command: &'static str,
        status: rusb::Error,
    },

    /// Device-control call with an unknown command identifier
    #[error("Unsupported command {0:#010x}")]
    UnsupportedCommand(u32),

    /// Caller buffer does not match what the command exchanges
    #[error("Bad argument buffer: expected {expected} bytes, got {actual}")]
    BoundaryFault { expected: usize, actual: usize },

    /// Argument out of range for the wire encoding
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl DriverError {
    /// POSIX error number a character-device front end would report
    #[cfg(unix)]
    pub fn errno(&self) -> nix::errno::Errno {
        use nix::errno::Errno;

        match self {
            DriverError::UnsupportedDevice { .. } => Errno::ENODEV,
            DriverError::EndpointMissing(_) => Errno::ENODEV,
            DriverError::AllocationFailure { .. } => Errno::ENOMEM,
            DriverError::RegistrationFailed { .. } => Errno::ENOSPC,
            DriverError::NoSuchDevice(_) => Errno::ENODEV,
            DriverError::SessionDetached => Errno::ENODEV,
            DriverError::Interrupted => Errno::EINTR,
            DriverError::TransferFailed(status) => bus_errno(*status),
            DriverError::CommandFailed { status, .. } => bus_errno(*status),
            DriverError::UnsupportedCommand(_) => Errno::ENOTTY,
            DriverError::BoundaryFault { .. } => Errno::EFAULT,
            DriverError::InvalidArgument(_) => Errno::EINVAL,
        }
    }

    /// True for errors after which retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriverError::Interrupted
                | DriverError::TransferFailed(rusb::Error::Timeout)
                | DriverError::CommandFailed {
                    status: rusb::Error::Timeout,
                    ..
                }
        )
    }
}

/// Map a libusb status to the errno the kernel USB core uses for it
#[cfg(unix)]
fn bus_errno(status: rusb::Error) -> nix::errno::Errno {
    use nix::errno::Errno;

    match status {
        rusb::Error::Timeout => Errno::ETIMEDOUT,
        rusb::Error::Pipe => Errno::EPIPE,
        rusb::Error::NoDevice => Errno::ENODEV,
        rusb::Error::NotFound => Errno::ENOENT,
        rusb::Error::Busy => Errno::EBUSY,
        rusb::Error::Overflow => Errno::EOVERFLOW,
        rusb::Error::Interrupted => Errno::EINTR,
        rusb::Error::NoMem => Errno::ENOMEM,
        rusb::Error::Access => Errno::EACCES,
        rusb::Error::InvalidParam => Errno::EINVAL,
        rusb::Error::NotSupported => Errno::EOPNOTSUPP,
        _ => Errno::EIO,
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DriverError::EndpointMissing(EndpointRole::BulkOut);
        assert_eq!(err.to_string(), "Could not find a bulk-out endpoint");

        let err = DriverError::UnsupportedDevice {
            vendor_id: 0x05ac,
            product_id: 0x1234,
        };
        assert!(err.to_string().contains("05ac:1234"));

        let err = DriverError::CommandFailed {
            command: "GET_STATUS",
            status: rusb::Error::Timeout,
        };
        assert!(err.to_string().starts_with("GET_STATUS failed"));
    }

    #[test]
    fn test_retryable() {
        assert!(DriverError::Interrupted.is_retryable());
        assert!(DriverError::TransferFailed(rusb::Error::Timeout).is_retryable());
        assert!(!DriverError::TransferFailed(rusb::Error::Pipe).is_retryable());
        assert!(!DriverError::SessionDetached.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn test_errno_mapping() {
        use nix::errno::Errno;

        assert_eq!(DriverError::NoSuchDevice(192).errno(), Errno::ENODEV);
        assert_eq!(DriverError::Interrupted.errno(), Errno::EINTR);
        assert_eq!(DriverError::UnsupportedCommand(7).errno(), Errno::ENOTTY);
        assert_eq!(
            DriverError::BoundaryFault {
                expected: 4,
                actual: 2
            }
            .errno(),
            Errno::EFAULT
        );
        assert_eq!(
            DriverError::TransferFailed(rusb::Error::Timeout).errno(),
            Errno::ETIMEDOUT
        );
    }
}

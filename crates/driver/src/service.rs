//! Systemd service integration
//!
//! Minimal sd-notify support so `xserve-fpd run` can be a `Type=notify`
//! unit. Every call is a no-op outside systemd.

use anyhow::{Context, Result};
use std::env;
use tracing::debug;

#[cfg(unix)]
fn send(message: &str) -> Result<()> {
    use std::os::unix::net::UnixDatagram;

    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
        return Ok(());
    };

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    debug!("Notified systemd: {}", message);
    Ok(())
}

#[cfg(not(unix))]
fn send(_message: &str) -> Result<()> {
    Ok(())
}

/// Tell systemd the driver has finished starting
pub fn notify_ready() -> Result<()> {
    send("READY=1")
}

/// Tell systemd the driver is shutting down
pub fn notify_stopping() -> Result<()> {
    send("STOPPING=1")
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    send(&format!("STATUS={}", status))
}

pub fn is_systemd() -> bool {
    env::var_os("NOTIFY_SOCKET").is_some()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixDatagram;

    #[test]
    fn test_notifications_reach_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        // The only test in this crate touching NOTIFY_SOCKET.
        unsafe {
            env::set_var("NOTIFY_SOCKET", &path);
        }
        assert!(is_systemd());
        notify_ready().unwrap();
        notify_status("2 panels attached").unwrap();
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS=2 panels attached");

        assert!(!is_systemd());
        assert!(notify_stopping().is_ok());
    }
}

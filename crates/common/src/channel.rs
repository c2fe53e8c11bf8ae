//! Channel bridge between the libusb event thread and the Tokio runtime
//!
//! Hot-plug callbacks run inside `libusb_handle_events()` on a dedicated
//! thread and must not perform I/O. They only forward what happened; the
//! async side probes and attaches.

use async_channel::{Receiver, Sender, TrySendError, bounded};
use rusb::{Context, Device};

use crate::usb_types::BusLocation;

/// Notifications from the USB thread
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A matching device appeared on the bus
    Arrived {
        /// Device to probe
        device: Device<Context>,
    },

    /// A device went away
    Left {
        /// Where it was
        location: BusLocation,
    },
}

/// Receiving half, owned by the Tokio side (async)
#[derive(Clone)]
pub struct HostBridge {
    event_rx: Receiver<HostEvent>,
}

impl HostBridge {
    /// Receive the next host event
    pub async fn recv_event(&self) -> crate::Result<HostEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Stop accepting events; pending sends fail afterwards
    pub fn close(&self) {
        self.event_rx.close();
    }
}

/// Sending half, owned by the USB thread (never blocks)
#[derive(Clone)]
pub struct HostNotifier {
    event_tx: Sender<HostEvent>,
}

impl HostNotifier {
    /// Forward an event without blocking the libusb event loop
    pub fn notify(&self, event: HostEvent) -> crate::Result<()> {
        self.event_tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => crate::Error::Channel("host event queue full".to_string()),
            TrySendError::Closed(_) => {
                crate::Error::Channel("host event queue closed".to_string())
            }
        })
    }
}

/// Create the channel bridge between the USB thread and Tokio
///
/// Returns (HostBridge for Tokio, HostNotifier for the USB thread)
pub fn create_host_bridge() -> (HostBridge, HostNotifier) {
    let (event_tx, event_rx) = bounded(64);

    (HostBridge { event_rx }, HostNotifier { event_tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_bridge() {
        let (bridge, notifier) = create_host_bridge();

        let handle = std::thread::spawn(move || {
            notifier.notify(HostEvent::Left {
                location: BusLocation { bus: 2, address: 7 },
            })
        });
        assert!(handle.join().unwrap().is_ok());

        match bridge.recv_event().await.unwrap() {
            HostEvent::Left { location } => {
                assert_eq!(location, BusLocation { bus: 2, address: 7 })
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_notify_after_close_fails() {
        let (bridge, notifier) = create_host_bridge();
        bridge.close();

        let result = notifier.notify(HostEvent::Left {
            location: BusLocation { bus: 1, address: 1 },
        });
        assert!(matches!(result, Err(crate::Error::Channel(_))));
    }
}

//! USB worker thread
//!
//! Dedicated thread owning the libusb context. It runs
//! `libusb_handle_events()` so hot-plug callbacks fire, and forwards
//! arrivals and departures to the Tokio side through the host bridge.
//! Probing and attaching happen on the Tokio side, never in a callback.

use crate::lifecycle::Driver;
use crate::usb::device::{find_front_panels, location_of, probe};
use common::{HostBridge, HostEvent, HostNotifier, front_panel};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block before the stop flag is
/// checked again
const EVENT_POLL: Duration = Duration::from_millis(100);

/// Handle to the running worker thread
pub struct UsbWorker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<Result<(), rusb::Error>>,
}

impl UsbWorker {
    /// Ask the thread to exit and wait for it
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        match self.thread.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("USB worker exited with error: {}", e),
            Err(e) => error!("USB worker thread panicked: {:?}", e),
        }
    }
}

/// Spawn the USB worker thread
///
/// Front panels already on the bus are reported as arrivals right away.
pub fn spawn_usb_worker(notifier: HostNotifier) -> std::io::Result<UsbWorker> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let thread = std::thread::Builder::new()
        .name("usb-worker".to_string())
        .spawn(move || run(notifier, thread_stop))?;

    Ok(UsbWorker { stop, thread })
}

fn run(notifier: HostNotifier, stop: Arc<AtomicBool>) -> Result<(), rusb::Error> {
    let context = Context::new()?;

    // Must stay alive for as long as events are handled.
    let _registration: Option<Registration<Context>> = if rusb::has_hotplug() {
        let registration = HotplugBuilder::new()
            .vendor_id(front_panel::VENDOR_ID)
            .product_id(front_panel::PRODUCT_ID)
            .enumerate(true)
            .register(&context, Box::new(HotplugForwarder::new(notifier)))?;
        debug!("Hot-plug callbacks registered");
        Some(registration)
    } else {
        warn!("libusb has no hot-plug support on this platform, attaching present devices only");
        for device in find_front_panels(&context)? {
            forward(&notifier, HostEvent::Arrived { device });
        }
        None
    };

    info!("USB worker thread started");

    while !stop.load(Ordering::Acquire) {
        match context.handle_events(Some(EVENT_POLL)) {
            Ok(()) => {}
            Err(rusb::Error::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_POLL);
            }
        }
    }

    info!("USB worker thread stopped");
    Ok(())
}

fn forward(notifier: &HostNotifier, event: HostEvent) {
    if let Err(e) = notifier.notify(event) {
        warn!("Dropping host event: {}", e);
    }
}

/// Hot-plug callback forwarding to the host bridge
///
/// Runs inside `handle_events`; must not do any I/O on the device.
struct HotplugForwarder {
    notifier: HostNotifier,
}

impl HotplugForwarder {
    fn new(notifier: HostNotifier) -> Self {
        Self { notifier }
    }
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!("Front panel arrived at {}", location_of(&device));
        forward(&self.notifier, HostEvent::Arrived { device });
    }

    fn device_left(&mut self, device: Device<Context>) {
        let location = location_of(&device);
        debug!("Front panel left {}", location);
        forward(&self.notifier, HostEvent::Left { location });
    }
}

/// Attach and detach front panels as the worker reports them
///
/// Runs until the bridge is closed.
pub async fn dispatch_host_events(driver: Arc<Driver>, bridge: HostBridge) {
    while let Ok(event) = bridge.recv_event().await {
        match event {
            HostEvent::Arrived { device } => {
                let location = location_of(&device);
                let probed = tokio::task::spawn_blocking(move || probe(&device)).await;

                let request = match probed {
                    Ok(Ok(request)) => request,
                    Ok(Err(e)) => {
                        warn!("Could not probe front panel at {}: {}", location, e);
                        continue;
                    }
                    Err(e) => {
                        error!("Probe of {} aborted: {}", location, e);
                        continue;
                    }
                };

                if let Err(e) = driver.attach(request).await {
                    warn!("Attach of front panel at {} failed: {}", location, e);
                }
            }
            HostEvent::Left { location } => {
                if !driver.detach_location(location).await {
                    debug!("No session at {} to detach", location);
                }
            }
        }
    }

    debug!("Host event dispatcher stopped");
}

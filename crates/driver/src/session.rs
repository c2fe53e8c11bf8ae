//! Per-device session state
//!
//! A [`DeviceSession`] owns everything tied to one attached front panel: the
//! bus connection, the reusable bulk-in buffer, the I/O lock serializing
//! bulk and control traffic, the event monitor and the lifecycle flag.

use crate::discovery::EndpointMap;
use crate::error::{DriverError, Result};
use crate::handle::Interrupter;
use crate::monitor::{EventBacklog, EventMonitor, MonitorStatus};
use common::{BusLocation, UsbTransport};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as IoMutex, OwnedMutexGuard};
use tracing::{debug, error, info};

/// Lifecycle of a session. Each transition happens exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Attached = 0,
    Detaching = 1,
    Detached = 2,
}

impl Lifecycle {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Attached,
            1 => Lifecycle::Detaching,
            _ => Lifecycle::Detached,
        }
    }
}

/// Who the session is talking to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub location: BusLocation,
}

/// State guarded by the session's I/O lock
pub(crate) struct IoState {
    /// Bus connection; `None` once the session has been torn down
    pub(crate) transport: Option<Arc<dyn UsbTransport>>,
    /// Reusable bulk-in buffer, sized to the endpoint's max packet
    pub(crate) bulk_in: Vec<u8>,
}

pub struct DeviceSession {
    identity: DeviceIdentity,
    endpoints: EndpointMap,
    lifecycle: AtomicU8,
    io: Arc<IoMutex<IoState>>,
    monitor: Mutex<Option<EventMonitor>>,
    events: Arc<EventBacklog>,
}

impl DeviceSession {
    /// Build a session, allocating the bulk-in buffer
    pub(crate) fn new(
        identity: DeviceIdentity,
        endpoints: EndpointMap,
        transport: Arc<dyn UsbTransport>,
        event_backlog: usize,
    ) -> Result<Self> {
        let bulk_in = alloc_zeroed(endpoints.bulk_in.max_packet, "bulk-in buffer")?;

        Ok(Self {
            identity,
            endpoints,
            lifecycle: AtomicU8::new(Lifecycle::Attached as u8),
            io: Arc::new(IoMutex::new(IoState {
                transport: Some(transport),
                bulk_in,
            })),
            monitor: Mutex::new(None),
            events: Arc::new(EventBacklog::new(event_backlog)),
        })
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity
    }

    pub fn endpoints(&self) -> &EndpointMap {
        &self.endpoints
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    pub(crate) fn events(&self) -> &Arc<EventBacklog> {
        &self.events
    }

    pub(crate) fn monitor_status(&self) -> Option<MonitorStatus> {
        self.monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|monitor| monitor.status(&self.events))
    }

    /// Hand the armed monitor to the session
    ///
    /// Gives it back if the session already started detaching, so the caller
    /// can cancel it instead of leaking a running listener.
    pub(crate) fn install_monitor(&self, monitor: EventMonitor) -> Option<EventMonitor> {
        let mut slot = self.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if self.lifecycle() != Lifecycle::Attached {
            return Some(monitor);
        }
        *slot = Some(monitor);
        None
    }

    /// Acquire the I/O lock for a bulk or control operation
    ///
    /// The wait can be cut short by `interrupter`. Fails with
    /// `SessionDetached` if the session left `Attached`.
    pub(crate) async fn lock_io(
        &self,
        interrupter: &Interrupter,
    ) -> Result<OwnedMutexGuard<IoState>> {
        let guard = match self.io.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tokio::select! {
                    biased;
                    _ = interrupter.raised() => return Err(DriverError::Interrupted),
                    guard = self.io.clone().lock_owned() => guard,
                }
            }
        };

        if self.lifecycle() != Lifecycle::Attached {
            return Err(DriverError::SessionDetached);
        }
        Ok(guard)
    }

    /// Fail fast when the session is gone, without touching the lock
    pub(crate) fn ensure_attached(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Attached => Ok(()),
            _ => Err(DriverError::SessionDetached),
        }
    }

    /// Attached -> Detaching. Returns false if someone else got there first.
    pub(crate) fn begin_detach(&self) -> bool {
        self.lifecycle
            .compare_exchange(
                Lifecycle::Attached as u8,
                Lifecycle::Detaching as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Cancel the monitor, wait out in-flight calls, release resources and
    /// mark the session `Detached`. Must follow a successful `begin_detach`.
    pub(crate) async fn finish_detach(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.cancel().await;
        }

        // Taking the lock waits for the bulk/control call in flight, if any.
        let mut io = self.io.lock().await;
        io.transport = None;
        io.bulk_in = Vec::new();
        drop(io);

        self.lifecycle
            .store(Lifecycle::Detached as u8, Ordering::Release);
        info!(
            "Front panel at {} ({:04x}:{:04x}) detached",
            self.identity.location, self.identity.vendor_id, self.identity.product_id
        );
    }
}

/// Run `op` on the blocking pool while holding the I/O lock
///
/// The guard moves into the blocking task and is dropped there, so the lock
/// is released as soon as the bus call returns. `on_panic` is returned if
/// the blocking task dies.
pub(crate) async fn run_locked<T, F>(
    guard: OwnedMutexGuard<IoState>,
    on_panic: DriverError,
    op: F,
) -> Result<T>
where
    F: FnOnce(&mut IoState) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let outcome = tokio::task::spawn_blocking(move || {
        let mut guard = guard;
        op(&mut guard)
    })
    .await;

    match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Bus call aborted: {}", e);
            Err(on_panic)
        }
    }
}

/// Borrow the live transport out of the locked state
pub(crate) fn live_transport(io: &IoState) -> Result<&Arc<dyn UsbTransport>> {
    io.transport.as_ref().ok_or(DriverError::SessionDetached)
}

/// Fallibly allocate a zero-filled buffer
pub(crate) fn alloc_zeroed(size: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = alloc_empty(size, what)?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Fallibly allocate an empty buffer with room for exactly `size` bytes
pub(crate) fn alloc_empty(size: usize, what: &'static str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|e| {
        debug!("Allocation of {} bytes for {} failed: {}", size, what, e);
        DriverError::AllocationFailure { what, size }
    })?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::discover_endpoints;
    use crate::monitor::Listener;
    use common::front_panel;
    use common::test_utils::{
        DEFAULT_TEST_TIMEOUT, SimulatedFrontPanel, front_panel_endpoints, wait_until,
        with_timeout,
    };
    use std::time::Duration;

    fn session() -> DeviceSession {
        let endpoints = discover_endpoints(&front_panel_endpoints()).unwrap();
        DeviceSession::new(
            DeviceIdentity {
                vendor_id: front_panel::VENDOR_ID,
                product_id: front_panel::PRODUCT_ID,
                location: BusLocation { bus: 1, address: 4 },
            },
            endpoints,
            Arc::new(SimulatedFrontPanel::new()),
            8,
        )
        .unwrap()
    }

    #[test]
    fn test_new_session_is_attached() {
        let session = session();
        assert_eq!(session.lifecycle(), Lifecycle::Attached);
        assert!(session.ensure_attached().is_ok());
        assert!(session.monitor_status().is_none());
    }

    #[test]
    fn test_begin_detach_only_once() {
        let session = session();
        assert!(session.begin_detach());
        assert!(!session.begin_detach());
        assert_eq!(session.lifecycle(), Lifecycle::Detaching);
        assert!(matches!(
            session.ensure_attached(),
            Err(DriverError::SessionDetached)
        ));
    }

    #[tokio::test]
    async fn test_finish_detach_releases_buffers() {
        let session = session();
        assert!(session.begin_detach());
        session.finish_detach().await;

        assert_eq!(session.lifecycle(), Lifecycle::Detached);
        let io = session.io.lock().await;
        assert!(io.transport.is_none());
        assert!(io.bulk_in.is_empty());
    }

    #[tokio::test]
    async fn test_lock_io_rejects_detaching_session() {
        let session = session();
        session.begin_detach();

        let result = session.lock_io(&Interrupter::new()).await;
        assert!(matches!(result, Err(DriverError::SessionDetached)));
    }

    #[tokio::test]
    async fn test_lock_io_interrupted_while_contended() {
        let session = Arc::new(session());
        let held = session.io.clone().lock_owned().await;

        let interrupter = Interrupter::new();
        let waiter = {
            let session = session.clone();
            let interrupter = interrupter.clone();
            tokio::spawn(async move { session.lock_io(&interrupter).await.map(|_| ()) })
        };

        tokio::task::yield_now().await;
        interrupter.raise();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(DriverError::Interrupted)));
        drop(held);
    }

    #[tokio::test]
    async fn test_monitor_handed_back_after_detach_began() {
        let panel = Arc::new(SimulatedFrontPanel::new());
        let session = session();
        let endpoint = session.endpoints().interrupt_in.unwrap();

        let monitor = EventMonitor::arm(Listener {
            minor: 192,
            transport: panel.clone(),
            endpoint,
            buffer: vec![0; endpoint.max_packet],
            poll_interval: Duration::from_millis(20),
            backlog: session.events().clone(),
            sink: None,
        });
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || panel.interrupt_submissions() >= 1).await);

        assert!(session.begin_detach());
        let returned = session
            .install_monitor(monitor)
            .expect("monitor should be handed back");
        assert!(session.monitor_status().is_none());

        with_timeout(DEFAULT_TEST_TIMEOUT, returned.cancel())
            .await
            .unwrap();
        let submitted = panel.interrupt_submissions();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(panel.interrupt_submissions(), submitted);

        session.finish_detach().await;
        assert_eq!(session.lifecycle(), Lifecycle::Detached);
    }

    #[test]
    fn test_alloc_helpers() {
        assert_eq!(alloc_zeroed(16, "test").unwrap(), vec![0u8; 16]);
        let empty = alloc_empty(16, "test").unwrap();
        assert!(empty.is_empty());
        assert!(empty.capacity() >= 16);
    }

    #[test]
    fn test_alloc_failure_is_reported() {
        let err = alloc_zeroed(usize::MAX, "huge").unwrap_err();
        assert!(matches!(
            err,
            DriverError::AllocationFailure { what: "huge", .. }
        ));
    }
}

//! Caller-facing handle to an attached front panel
//!
//! A [`SessionHandle`] is what a user gets from [`Driver::open`]. Any number
//! of handles may be open on the same minor; they share the session and its
//! I/O lock. Each handle carries an [`Interrupter`] that cuts short a wait
//! for that lock.
//!
//! [`Driver::open`]: crate::lifecycle::Driver::open

use crate::command;
use crate::error::Result;
use crate::monitor::{InterruptEvent, MonitorStatus};
use crate::session::{DeviceIdentity, DeviceSession, Lifecycle};
use crate::transfer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// Interrupt signal for a blocked lock wait
///
/// Raising it makes the next (or current) wait for the I/O lock give up with
/// `Interrupted`. The signal is consumed by the wait that observes it.
#[derive(Clone, Default)]
pub struct Interrupter {
    inner: Arc<InterrupterInner>,
}

#[derive(Default)]
struct InterrupterInner {
    pending: AtomicBool,
    notify: Notify,
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake any waiter and leave the signal pending
    pub fn raise(&self) {
        self.inner.pending.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Drop a pending signal nobody consumed
    pub fn clear(&self) {
        self.inner.pending.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Resolve once the signal is raised, consuming it
    pub(crate) async fn raised(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent raise is not missed.
            notified.as_mut().enable();

            if self.inner.pending.swap(false, Ordering::AcqRel) {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// An open handle on an attached session
pub struct SessionHandle {
    minor: u32,
    session: Arc<DeviceSession>,
    interrupter: Interrupter,
}

impl SessionHandle {
    pub(crate) fn new(minor: u32, session: Arc<DeviceSession>) -> Self {
        Self {
            minor,
            session,
            interrupter: Interrupter::new(),
        }
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Interrupter for this handle's lock waits; clone it to signal from
    /// another task
    pub fn interrupter(&self) -> &Interrupter {
        &self.interrupter
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.session.identity()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.session.lifecycle()
    }

    /// Read up to `max_len` bytes with one bulk IN transfer
    ///
    /// Never returns more than the endpoint's max packet size.
    pub async fn read(&self, max_len: usize) -> Result<Vec<u8>> {
        transfer::read(&self.session, &self.interrupter, max_len).await
    }

    /// Read into `out`, returning the number of bytes stored
    pub async fn read_into(&self, out: &mut [u8]) -> Result<usize> {
        let data = self.read(out.len()).await?;
        out[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    /// Write `data` with one bulk OUT transfer, returning the bytes accepted
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        transfer::write(&self.session, &self.interrupter, data).await
    }

    /// Query the panel's status word
    pub async fn get_status(&self) -> Result<i32> {
        command::get_status(&self.session, &self.interrupter).await
    }

    /// Drive the panel's actuator
    pub async fn set_actuator(&self, value: i32) -> Result<()> {
        command::set_actuator(&self.session, &self.interrupter, value).await
    }

    /// Dispatch a numbered command with a 4-byte argument buffer
    ///
    /// Read-direction commands fill `arg`; write-direction commands read it.
    pub async fn control(&self, command: u32, arg: &mut [u8]) -> Result<()> {
        command::control(&self.session, &self.interrupter, command, arg).await
    }

    /// Take every buffered interrupt event, oldest first
    pub fn take_events(&self) -> Vec<InterruptEvent> {
        self.session.events().drain()
    }

    /// Take the oldest buffered interrupt event
    pub fn next_event(&self) -> Option<InterruptEvent> {
        self.session.events().pop()
    }

    /// `None` when the panel has no interrupt endpoint or monitoring is off
    pub fn monitor_status(&self) -> Option<MonitorStatus> {
        self.session.monitor_status()
    }

    /// Close the handle. The session stays attached.
    pub fn release(self) {
        tracing::debug!("Handle on minor {} released", self.minor);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("minor", &self.minor)
            .field("lifecycle", &self.session.lifecycle())
            .finish()
    }
}

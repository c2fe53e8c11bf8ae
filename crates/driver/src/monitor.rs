//! Interrupt endpoint event monitor
//!
//! The front panel pushes small unsolicited reports (button presses, lid
//! and power state) on its interrupt-in endpoint. The monitor keeps exactly
//! one interrupt request outstanding at all times and resubmits it after
//! every successful completion, so reports are picked up without any caller
//! asking for them.
//!
//! # Architecture
//!
//! ```text
//! Tokio task (monitor)            Blocking pool               Device
//! ────────────────────            ─────────────               ──────
//!     │── submit (buffer moved) ──►│── interrupt IN ──────────►│
//!     │                            │◄── report ────────────────│
//!     │◄── completion (buffer back)│                           │
//!     │  handler: backlog + sink   │                           │
//!     │── resubmit ───────────────►│ ...                       │
//! ```
//!
//! The handler runs outside the session's I/O lock and never waits on it.
//! An error completion stops the loop for good; the session itself stays
//! usable. On detach the task is cancelled and awaited: an outstanding
//! request is allowed to come back first, and a running handler always
//! finishes, so the interrupt buffer is released only after the last
//! completion has returned.

use crate::discovery::InterruptEndpoint;
use common::UsbTransport;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

/// One report received on the interrupt endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptEvent {
    /// Sequence number, counting every report since attach
    pub seq: u64,
    /// First byte of the report, identifying the event
    pub marker: Option<u8>,
    /// Raw report bytes
    pub data: Vec<u8>,
    /// Microseconds since the Unix epoch when the report completed
    pub timestamp_us: u64,
}

/// Receives every event as it completes
///
/// Called from the monitor task; implementations must return promptly and
/// must not call back into the session.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, minor: u32, event: &InterruptEvent);
}

/// Forwards events to an async channel, dropping them when it is full
pub struct ChannelSink {
    tx: async_channel::Sender<(u32, InterruptEvent)>,
}

impl ChannelSink {
    pub fn new(tx: async_channel::Sender<(u32, InterruptEvent)>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, minor: u32, event: &InterruptEvent) {
        if let Err(e) = self.tx.try_send((minor, event.clone())) {
            debug!("Dropping event {} from minor {}: {}", event.seq, minor, e);
        }
    }
}

/// Bounded FIFO of events not yet taken by a handle
pub struct EventBacklog {
    inner: Mutex<BacklogInner>,
    capacity: usize,
}

struct BacklogInner {
    events: VecDeque<InterruptEvent>,
    next_seq: u64,
    dropped: u64,
}

impl EventBacklog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(BacklogInner {
                events: VecDeque::with_capacity(capacity),
                next_seq: 0,
                dropped: 0,
            }),
            capacity,
        }
    }

    /// Record a report, dropping the oldest one if the backlog is full
    pub fn push(&self, data: &[u8]) -> InterruptEvent {
        let timestamp_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let mut inner = self.lock();
        let event = InterruptEvent {
            seq: inner.next_seq,
            marker: data.first().copied(),
            data: data.to_vec(),
            timestamp_us,
        };
        inner.next_seq += 1;

        if inner.events.len() >= self.capacity {
            inner.events.pop_front();
            inner.dropped += 1;
            warn!(
                "Event backlog full, dropped oldest event (total dropped: {})",
                inner.dropped
            );
        }
        inner.events.push_back(event.clone());
        event
    }

    /// Take the oldest pending event
    pub fn pop(&self) -> Option<InterruptEvent> {
        self.lock().events.pop_front()
    }

    /// Take every pending event, oldest first
    pub fn drain(&self) -> Vec<InterruptEvent> {
        self.lock().events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because nobody took them in time
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BacklogInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Where the listener loop stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// A request is (or is about to be) outstanding
    Armed,
    /// An error completion ended the loop; interrupt delivery has lapsed
    Stopped { status: rusb::Error },
    /// Detach cancelled the loop
    Cancelled,
}

/// Snapshot of the monitor for callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStatus {
    pub state: MonitorState,
    /// Interrupt requests submitted so far
    pub submissions: u64,
    /// Successful completions (reports received)
    pub completions: u64,
    /// Reports dropped from the backlog
    pub dropped: u64,
}

struct MonitorShared {
    state: Mutex<MonitorState>,
    submissions: AtomicU64,
    completions: AtomicU64,
}

impl MonitorShared {
    fn state(&self) -> MonitorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: MonitorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Everything the listener loop owns
pub(crate) struct Listener {
    pub(crate) minor: u32,
    pub(crate) transport: Arc<dyn UsbTransport>,
    pub(crate) endpoint: InterruptEndpoint,
    pub(crate) buffer: Vec<u8>,
    /// Upper bound on a single blocking poll, so cancellation stays prompt
    pub(crate) poll_interval: Duration,
    pub(crate) backlog: Arc<EventBacklog>,
    pub(crate) sink: Option<Arc<dyn EventSink>>,
}

/// Handle to an armed listener
pub(crate) struct EventMonitor {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    shared: Arc<MonitorShared>,
}

impl EventMonitor {
    /// Start the listener loop on the current Tokio runtime
    pub(crate) fn arm(listener: Listener) -> Self {
        let shared = Arc::new(MonitorShared {
            state: Mutex::new(MonitorState::Armed),
            submissions: AtomicU64::new(0),
            completions: AtomicU64::new(0),
        });
        let (cancel_tx, cancel_rx) = oneshot::channel();

        debug!(
            "Arming event monitor on endpoint {:#04x} for minor {}",
            listener.endpoint.address, listener.minor
        );
        let task = tokio::spawn(listener.run(shared.clone(), cancel_rx));

        Self {
            cancel: Some(cancel_tx),
            task,
            shared,
        }
    }

    pub(crate) fn status(&self, backlog: &EventBacklog) -> MonitorStatus {
        MonitorStatus {
            state: self.shared.state(),
            submissions: self.shared.submissions.load(Ordering::Acquire),
            completions: self.shared.completions.load(Ordering::Acquire),
            dropped: backlog.dropped(),
        }
    }

    /// Cancel the listener and wait until it has fully stopped
    pub(crate) async fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            // Fails only if the loop already ended on its own.
            let _ = cancel.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Event monitor task failed: {}", e);
            self.shared.set_state(MonitorState::Cancelled);
        }
    }
}

impl Listener {
    async fn run(self, shared: Arc<MonitorShared>, mut cancel: oneshot::Receiver<()>) {
        let Listener {
            minor,
            transport,
            endpoint,
            mut buffer,
            poll_interval,
            backlog,
            sink,
        } = self;

        loop {
            if cancel_requested(&mut cancel) {
                break;
            }

            shared.submissions.fetch_add(1, Ordering::AcqRel);
            let request_transport = transport.clone();
            let mut request = tokio::task::spawn_blocking(move || {
                let result =
                    request_transport.read_interrupt(endpoint.address, &mut buffer, poll_interval);
                (buffer, result)
            });

            let completed = tokio::select! {
                biased;
                _ = &mut cancel => {
                    // The buffer belongs to the outstanding request until it returns.
                    let _ = request.await;
                    break;
                }
                completed = &mut request => completed,
            };

            let (returned, result) = match completed {
                Ok(completed) => completed,
                Err(e) => {
                    error!("Interrupt request on minor {} aborted: {}", minor, e);
                    shared.set_state(MonitorState::Stopped {
                        status: rusb::Error::Other,
                    });
                    return;
                }
            };
            buffer = returned;

            match result {
                Ok(len) => {
                    shared.completions.fetch_add(1, Ordering::AcqRel);
                    let report = &buffer[..len.min(buffer.len())];
                    let event = backlog.push(report);
                    trace!(
                        "Interrupt event on minor {}: seq={}, marker={:?}, len={}",
                        minor,
                        event.seq,
                        event.marker,
                        event.data.len()
                    );
                    if let Some(sink) = &sink {
                        sink.deliver(minor, &event);
                    }
                }
                // Nothing arrived within the poll window; the request is
                // simply submitted again.
                Err(rusb::Error::Timeout) => {}
                Err(status) => {
                    warn!(
                        "Interrupt listener on minor {} stopped after error: {}",
                        minor, status
                    );
                    shared.set_state(MonitorState::Stopped { status });
                    return;
                }
            }
        }

        debug!("Event monitor for minor {} cancelled", minor);
        shared.set_state(MonitorState::Cancelled);
    }
}

fn cancel_requested(cancel: &mut oneshot::Receiver<()>) -> bool {
    !matches!(
        cancel.try_recv(),
        Err(oneshot::error::TryRecvError::Empty)
    )
}

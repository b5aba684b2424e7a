//! Best-effort usage analytics.
//!
//! [`Telemetry::track`] is synchronous and infallible: it stamps the event,
//! appends it to the [`EventQueue`], and at most wakes the flusher. Delivery
//! happens on [`Telemetry::run_due`] (driven by the worker from
//! [`Telemetry::spawn_worker`], or by hand in tests) and on forced flushes at
//! shutdown. Failed batches are requeued up to the retention cap and logged;
//! callers never see them.

mod event;
mod queue;
mod transport;

pub use event::{EventData, Identity, SESSION_ID_KEY, TelemetryEvent, USER_KEY};
pub use queue::{Batch, EventQueue, PushOutcome, QueueLimits};
pub use transport::{HttpTransport, TelemetryTransport};

use crate::clock::Clock;
use serde_json::{Map, Value, json};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Dwell times at or below this are not reported as `page_duration`.
const MIN_REPORTED_DWELL_SECS: u64 = 1;

/// Result of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing queued.
    Empty,
    /// Another flush is still in flight.
    Busy,
    /// The batch reached the sink.
    Delivered(usize),
    /// The batch failed and was put back.
    Requeued { failed: usize, queued: usize },
}

/// Host lifecycle signals relevant to delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Visible,
    Hidden,
    Unload,
}

#[derive(Debug)]
struct PageState {
    path: String,
    entered_at: Instant,
}

struct Inner {
    queue: Mutex<EventQueue>,
    page: Mutex<PageState>,
    transport: Arc<dyn TelemetryTransport>,
    clock: Arc<dyn Clock>,
    identity: Identity,
    wake: Notify,
}

/// Handle to the telemetry queue. Cheap to clone; clones share the queue.
#[derive(Clone)]
pub struct Telemetry {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(
        limits: QueueLimits,
        transport: Arc<dyn TelemetryTransport>,
        clock: Arc<dyn Clock>,
        identity: Identity,
    ) -> Self {
        let entered_at = clock.now();
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(EventQueue::new(limits)),
                page: Mutex::new(PageState {
                    path: "/".to_string(),
                    entered_at,
                }),
                transport,
                clock,
                identity,
                wake: Notify::new(),
            }),
        }
    }

    /// Record an event. Never fails.
    ///
    /// Identity is read from its stores on the first event only; later calls
    /// use the cached ids and touch no I/O.
    pub fn track(&self, event_type: &str, data: Map<String, Value>) {
        let event = TelemetryEvent::new(
            self.inner.identity.user_id(),
            self.inner.identity.session_id(),
            event_type,
            data,
            self.inner.clock.wall_millis(),
            self.current_page(),
        );

        let outcome = match self.inner.queue.lock() {
            Ok(mut queue) => queue.push(event, self.inner.clock.now()),
            Err(_) => {
                warn!(event_type, "telemetry queue poisoned; dropping event");
                return;
            }
        };
        trace!(event_type, ?outcome, "tracked event");

        // Wake the worker so it re-reads the deadline or flushes right away.
        if outcome != PushOutcome::Queued {
            self.inner.wake.notify_one();
        }
    }

    /// Record a navigation to `path`.
    ///
    /// Emits `page_duration` for the page being left (attributed to it) when
    /// the dwell rounds to more than one second, then `page_view` for `path`.
    pub fn track_page_view(&self, path: &str) {
        let now = self.inner.clock.now();
        let dwell = match self.inner.page.lock() {
            Ok(page) => now.saturating_duration_since(page.entered_at),
            Err(_) => Duration::ZERO,
        };

        let dwell_secs = (dwell.as_millis() as f64 / 1000.0).round() as u64;
        if dwell_secs > MIN_REPORTED_DWELL_SECS {
            self.track("page_duration", object(json!({ "duration_sec": dwell_secs })));
        }

        if let Ok(mut page) = self.inner.page.lock() {
            page.path = path.to_string();
            page.entered_at = now;
        }
        self.track("page_view", object(json!({ "page": path })));
    }

    /// Set the route path without emitting navigation events.
    pub fn set_page(&self, path: &str) {
        if let Ok(mut page) = self.inner.page.lock() {
            page.path = path.to_string();
            page.entered_at = self.inner.clock.now();
        }
    }

    /// Route path stamped onto new events.
    pub fn current_page(&self) -> String {
        self.inner
            .page
            .lock()
            .map(|p| p.path.clone())
            .unwrap_or_default()
    }

    /// Events waiting for delivery (excluding an in-flight batch).
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Copy of the waiting events, oldest first.
    pub fn pending_events(&self) -> Vec<TelemetryEvent> {
        self.inner
            .queue
            .lock()
            .map(|q| q.events().cloned().collect())
            .unwrap_or_default()
    }

    /// Flush if the size threshold or the timer says so.
    pub async fn run_due(&self) -> Option<FlushOutcome> {
        let due = self
            .inner
            .queue
            .lock()
            .map(|q| q.is_due(self.inner.clock.now()))
            .unwrap_or(false);
        if !due {
            return None;
        }
        Some(self.flush().await)
    }

    /// Flush now, regardless of timer or size. Returns
    /// [`FlushOutcome::Busy`] while another flush is in flight.
    pub async fn flush(&self) -> FlushOutcome {
        self.flush_with(false).await
    }

    /// Send whatever is queued right now, even next to an open flight.
    async fn force_flush(&self) -> FlushOutcome {
        self.flush_with(true).await
    }

    async fn flush_with(&self, forced: bool) -> FlushOutcome {
        let batch = {
            let Ok(mut queue) = self.inner.queue.lock() else {
                return FlushOutcome::Empty;
            };
            let taken = if forced {
                queue.take_forced_batch()
            } else {
                queue.take_batch()
            };
            match taken {
                Some(batch) => batch,
                None if !forced && queue.is_in_flight() => return FlushOutcome::Busy,
                None => return FlushOutcome::Empty,
            }
        };

        let count = batch.len();
        let result = self.inner.transport.send(&batch.events).await;

        let outcome = {
            let Ok(mut queue) = self.inner.queue.lock() else {
                return FlushOutcome::Empty;
            };
            match result {
                Ok(()) => {
                    queue.complete_success();
                    debug!(events = count, "telemetry batch delivered");
                    FlushOutcome::Delivered(count)
                }
                Err(e) => {
                    queue.complete_failure(batch);
                    warn!(
                        error = %e,
                        events = count,
                        queued = queue.len(),
                        dropped_total = queue.dropped(),
                        "telemetry flush failed; requeued"
                    );
                    FlushOutcome::Requeued {
                        failed: count,
                        queued: queue.len(),
                    }
                }
            }
        };

        self.inner.wake.notify_one();
        outcome
    }

    /// React to a host lifecycle change. Hiding or unloading sends the live
    /// queue at once, alongside any flush already in flight, since timers may
    /// never fire afterwards.
    pub async fn on_lifecycle(&self, signal: Lifecycle) -> Option<FlushOutcome> {
        match signal {
            Lifecycle::Hidden | Lifecycle::Unload => {
                debug!(?signal, "forcing telemetry flush");
                Some(self.force_flush().await)
            }
            Lifecycle::Visible => None,
        }
    }

    fn next_wakeup(&self) -> Option<Instant> {
        self.inner
            .queue
            .lock()
            .ok()
            .and_then(|q| q.next_wakeup(self.inner.clock.now()))
    }

    /// Spawn the background flusher.
    ///
    /// Sleeps until the next deadline or until `track` / a completed flush
    /// wakes it, then runs whatever is due. Abort the handle to stop it.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let telemetry = self.clone();
        tokio::spawn(async move {
            loop {
                match telemetry.next_wakeup() {
                    Some(at) => {
                        let delay = at.saturating_duration_since(telemetry.inner.clock.now());
                        tokio::select! {
                            biased;
                            _ = telemetry.inner.wake.notified() => {},
                            _ = tokio::time::sleep(delay) => {},
                        }
                    }
                    None => telemetry.inner.wake.notified().await,
                }
                telemetry.run_due().await;
            }
        })
    }
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

//! Batching state machine for outbound telemetry.
//!
//! No I/O and no timers here: callers pass the current [`Instant`] in and ask
//! whether a flush is due. That keeps every transition testable with a
//! hand-advanced clock.
//!
//! Lifecycle of a batch:
//!
//! 1. [`EventQueue::push`] appends. Reaching `batch_size` requests an
//!    immediate flush; otherwise the first event arms a deadline.
//! 2. [`EventQueue::take_batch`] snapshots and clears the live queue and marks
//!    a flush in flight. Pushes keep landing in the live queue meanwhile.
//!    [`EventQueue::take_forced_batch`] does the same even while another
//!    flight is open, for teardown paths that cannot wait.
//! 3. [`EventQueue::complete_success`] or [`EventQueue::complete_failure`]
//!    closes the flight. A failed snapshot goes back in emission order, ahead
//!    of anything that arrived after it was taken, then the queue is trimmed
//!    to the newest `max_retained` events.

use super::event::TelemetryEvent;
use crate::config::TelemetryConfig;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub max_retained: usize,
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::from(&TelemetryConfig::default())
    }
}

impl From<&TelemetryConfig> for QueueLimits {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            flush_interval: config.flush_interval(),
            max_retained: config.max_retained.max(1),
        }
    }
}

/// What a push asked of the flusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Batch threshold reached; flush now.
    FlushNow,
    /// First event since the last flush; a deadline was armed.
    TimerArmed(Instant),
    /// A deadline is already pending.
    Queued,
}

/// A snapshot handed to the transport.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Emission sequence of each event; orders the batch on requeue
    seqs: Vec<u64>,
    pub events: Vec<TelemetryEvent>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[derive(Debug)]
pub struct EventQueue {
    limits: QueueLimits,
    /// Live events tagged with their emission sequence, oldest first
    events: VecDeque<(u64, TelemetryEvent)>,
    next_seq: u64,
    deadline: Option<Instant>,
    flush_requested: bool,
    flights: usize,
    dropped: u64,
}

impl EventQueue {
    pub fn new(limits: QueueLimits) -> Self {
        Self {
            limits,
            events: VecDeque::new(),
            next_seq: 0,
            deadline: None,
            flush_requested: false,
            flights: 0,
            dropped: 0,
        }
    }

    pub fn limits(&self) -> QueueLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.flights > 0
    }

    /// Pending timer deadline, if one is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Events evicted by the retention cap so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn events(&self) -> impl Iterator<Item = &TelemetryEvent> {
        self.events.iter().map(|(_, event)| event)
    }

    pub fn push(&mut self, event: TelemetryEvent, now: Instant) -> PushOutcome {
        self.events.push_back((self.next_seq, event));
        self.next_seq += 1;
        self.enforce_cap();

        if self.events.len() >= self.limits.batch_size {
            self.deadline = None;
            self.flush_requested = true;
            return PushOutcome::FlushNow;
        }

        match self.deadline {
            Some(_) => PushOutcome::Queued,
            None => {
                let at = now + self.limits.flush_interval;
                self.deadline = Some(at);
                PushOutcome::TimerArmed(at)
            }
        }
    }

    /// Whether a flush should start now. Never true while one is in flight.
    pub fn is_due(&self, now: Instant) -> bool {
        if self.is_in_flight() || self.events.is_empty() {
            return false;
        }
        self.flush_requested || self.deadline.is_some_and(|at| now >= at)
    }

    /// When the flusher should next look at the queue. `None` means only an
    /// explicit wake-up (push, flight completion) can make work due.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        if self.is_in_flight() || self.events.is_empty() {
            return None;
        }
        if self.flush_requested {
            return Some(now);
        }
        self.deadline
    }

    /// Snapshot and clear the live queue, marking a flush in flight.
    ///
    /// Returns `None` if the queue is empty or a flush is already in flight.
    pub fn take_batch(&mut self) -> Option<Batch> {
        if self.is_in_flight() {
            return None;
        }
        self.take_forced_batch()
    }

    /// Snapshot and clear the live queue even if another flush is in flight.
    pub fn take_forced_batch(&mut self) -> Option<Batch> {
        self.deadline = None;
        self.flush_requested = false;
        if self.events.is_empty() {
            return None;
        }

        self.flights += 1;
        let (seqs, events) = self.events.drain(..).unzip();
        Some(Batch { seqs, events })
    }

    /// A batch was delivered.
    pub fn complete_success(&mut self) {
        self.flights = self.flights.saturating_sub(1);
        if !self.is_in_flight() && self.events.len() >= self.limits.batch_size {
            self.flush_requested = true;
        }
    }

    /// A batch was not delivered. Put it back in emission order (ahead of
    /// anything queued since it was taken), keeping only the newest
    /// `max_retained` events. No timer is armed here; the events ride along
    /// with the next natural trigger.
    pub fn complete_failure(&mut self, failed: Batch) {
        self.flights = self.flights.saturating_sub(1);

        let live = std::mem::take(&mut self.events);
        let mut restored = failed.seqs.into_iter().zip(failed.events).peekable();
        let mut merged = VecDeque::with_capacity(live.len() + restored.len());
        for entry in live {
            while let Some(older) = restored.next_if(|(seq, _)| *seq < entry.0) {
                merged.push_back(older);
            }
            merged.push_back(entry);
        }
        merged.extend(restored);
        self.events = merged;

        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        while self.events.len() > self.limits.max_retained {
            self.events.pop_front();
            self.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn event(n: usize) -> TelemetryEvent {
        TelemetryEvent::new(None, "s".into(), format!("e{n}"), Map::new(), n as i64, "/")
    }

    fn types<'a>(events: impl IntoIterator<Item = &'a TelemetryEvent>) -> Vec<String> {
        events.into_iter().map(|e| e.event_type.clone()).collect()
    }

    fn limits(batch_size: usize, max_retained: usize) -> QueueLimits {
        QueueLimits {
            batch_size,
            flush_interval: Duration::from_millis(5000),
            max_retained,
        }
    }

    #[test]
    fn first_push_arms_timer_once() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));

        assert_eq!(
            queue.push(event(0), t0),
            PushOutcome::TimerArmed(t0 + Duration::from_millis(5000))
        );
        assert_eq!(
            queue.push(event(1), t0 + Duration::from_millis(100)),
            PushOutcome::Queued
        );
        assert_eq!(queue.deadline(), Some(t0 + Duration::from_millis(5000)));
    }

    #[test]
    fn timer_makes_queue_due() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));
        queue.push(event(0), t0);

        assert!(!queue.is_due(t0 + Duration::from_millis(4999)));
        assert!(queue.is_due(t0 + Duration::from_millis(5000)));
    }

    #[test]
    fn batch_size_requests_immediate_flush_and_cancels_timer() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(3, 100));
        queue.push(event(0), t0);
        queue.push(event(1), t0);

        assert_eq!(queue.push(event(2), t0), PushOutcome::FlushNow);
        assert_eq!(queue.deadline(), None);
        assert!(queue.is_due(t0));
        assert_eq!(queue.next_wakeup(t0), Some(t0));

        let batch = queue.take_batch().unwrap();
        assert_eq!(types(&batch.events), vec!["e0", "e1", "e2"]);
        assert!(queue.is_empty());
        assert!(!queue.is_due(t0));
    }

    #[test]
    fn only_one_flight_at_a_time() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(2, 100));
        queue.push(event(0), t0);
        queue.push(event(1), t0);
        let _batch = queue.take_batch().unwrap();

        assert_eq!(queue.push(event(2), t0), PushOutcome::TimerArmed(t0 + Duration::from_millis(5000)));
        assert_eq!(queue.push(event(3), t0), PushOutcome::FlushNow);
        assert!(queue.take_batch().is_none());
        assert!(!queue.is_due(t0 + Duration::from_secs(60)));
        assert_eq!(queue.next_wakeup(t0), None);

        queue.complete_success();
        assert!(queue.is_due(t0));
        assert_eq!(types(&queue.take_batch().unwrap().events), vec!["e2", "e3"]);
    }

    #[test]
    fn failure_prepends_snapshot_before_newer_events() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));
        for n in 0..4 {
            queue.push(event(n), t0);
        }
        let batch = queue.take_batch().unwrap();

        for n in 4..7 {
            queue.push(event(n), t0);
        }
        queue.complete_failure(batch);

        assert_eq!(
            types(queue.events()),
            vec!["e0", "e1", "e2", "e3", "e4", "e5", "e6"]
        );
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn failure_does_not_arm_a_retry_timer() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));
        queue.push(event(0), t0);
        let batch = queue.take_batch().unwrap();
        queue.complete_failure(batch);

        assert_eq!(queue.deadline(), None);
        assert!(!queue.is_due(t0 + Duration::from_secs(3600)));

        // The next track arms the timer again and carries the old event along.
        let later = t0 + Duration::from_secs(10);
        assert_eq!(
            queue.push(event(1), later),
            PushOutcome::TimerArmed(later + Duration::from_millis(5000))
        );
        assert_eq!(types(queue.events()), vec!["e0", "e1"]);
    }

    #[test]
    fn failure_merge_keeps_newest_events() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 5));
        for n in 0..4 {
            queue.push(event(n), t0);
        }
        let batch = queue.take_batch().unwrap();
        for n in 4..7 {
            queue.push(event(n), t0);
        }
        queue.complete_failure(batch);

        assert_eq!(types(queue.events()), vec!["e2", "e3", "e4", "e5", "e6"]);
        assert_eq!(queue.dropped(), 2);
    }

    #[test]
    fn push_never_exceeds_retention_cap() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));
        // Keep a flight open so nothing drains while events pile up.
        for n in 0..10 {
            queue.push(event(n), t0);
        }
        let batch = queue.take_batch().unwrap();
        for n in 10..130 {
            queue.push(event(n), t0);
        }
        assert_eq!(queue.len(), 100);
        queue.complete_failure(batch);

        assert_eq!(queue.len(), 100);
        let kept = types(queue.events());
        assert_eq!(kept.first().map(String::as_str), Some("e30"));
        assert_eq!(kept.last().map(String::as_str), Some("e129"));
        assert_eq!(queue.dropped(), 30);
    }

    #[test]
    fn success_with_backlog_requests_next_flush() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(2, 100));
        queue.push(event(0), t0);
        queue.push(event(1), t0);
        let _batch = queue.take_batch().unwrap();
        queue.push(event(2), t0);
        queue.push(event(3), t0);

        queue.complete_success();
        assert_eq!(queue.next_wakeup(t0), Some(t0));
    }

    #[test]
    fn forced_batch_ignores_open_flight() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));
        queue.push(event(0), t0);
        let _first = queue.take_batch().unwrap();

        queue.push(event(1), t0);
        queue.push(event(2), t0);
        assert!(queue.take_batch().is_none());

        let forced = queue.take_forced_batch().unwrap();
        assert_eq!(types(&forced.events), vec!["e1", "e2"]);
        assert!(queue.is_empty());

        queue.complete_success();
        assert!(queue.is_in_flight());
        queue.complete_success();
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn overlapping_failures_restore_emission_order() {
        let t0 = Instant::now();

        // Older flight fails first, then the forced one.
        let mut queue = EventQueue::new(limits(10, 100));
        queue.push(event(0), t0);
        let older = queue.take_batch().unwrap();
        queue.push(event(1), t0);
        queue.push(event(2), t0);
        let forced = queue.take_forced_batch().unwrap();
        queue.push(event(3), t0);

        queue.complete_failure(older);
        queue.complete_failure(forced);
        assert_eq!(types(queue.events()), vec!["e0", "e1", "e2", "e3"]);
        assert!(!queue.is_in_flight());

        // Forced flight fails first, then the older one.
        let mut queue = EventQueue::new(limits(10, 100));
        queue.push(event(0), t0);
        let older = queue.take_batch().unwrap();
        queue.push(event(1), t0);
        let forced = queue.take_forced_batch().unwrap();
        queue.push(event(2), t0);

        queue.complete_failure(forced);
        queue.complete_failure(older);
        assert_eq!(types(queue.events()), vec!["e0", "e1", "e2"]);
    }

    #[test]
    fn requeue_of_interleaved_batch_keeps_order() {
        let t0 = Instant::now();
        let mut queue = EventQueue::new(limits(10, 100));
        queue.push(event(0), t0);
        let older = queue.take_batch().unwrap();
        queue.push(event(1), t0);
        queue.push(event(2), t0);
        let forced = queue.take_forced_batch().unwrap();
        queue.push(event(3), t0);

        // e0 comes back next to e3 while e1 and e2 are still out.
        queue.complete_failure(older);
        let retry = queue.take_batch();
        assert!(retry.is_none());
        let retry = queue.take_forced_batch().unwrap();
        assert_eq!(types(&retry.events), vec!["e0", "e3"]);

        queue.complete_failure(forced);
        queue.complete_failure(retry);
        assert_eq!(types(queue.events()), vec!["e0", "e1", "e2", "e3"]);
    }

    #[test]
    fn forced_take_of_empty_queue_opens_no_flight() {
        let mut queue = EventQueue::new(limits(10, 100));
        assert!(queue.take_forced_batch().is_none());
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn take_from_empty_queue_clears_timer() {
        let mut queue = EventQueue::new(limits(10, 100));
        assert!(queue.take_batch().is_none());
        assert_eq!(queue.deadline(), None);
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn limits_from_config_clamp_zero() {
        let config = TelemetryConfig {
            batch_size: 0,
            max_retained: 0,
            ..TelemetryConfig::default()
        };
        let limits = QueueLimits::from(&config);
        assert_eq!(limits.batch_size, 1);
        assert_eq!(limits.max_retained, 1);
    }
}

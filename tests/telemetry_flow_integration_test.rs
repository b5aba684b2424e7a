use adelie::clock::ManualClock;
use adelie::storage::{FileStore, KeyValueStore, MemoryStore};
use adelie::telemetry::{
    FlushOutcome, HttpTransport, Identity, Lifecycle, QueueLimits, Telemetry, TelemetryEvent,
    TelemetryTransport, USER_KEY,
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;

/// Transport whose sends block until the test releases them.
struct GatedTransport {
    gate: Semaphore,
    started: Notify,
    fail_next: AtomicBool,
    failing: AtomicBool,
    batches: Mutex<Vec<Vec<String>>>,
}

impl GatedTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            started: Notify::new(),
            fail_next: AtomicBool::new(false),
            failing: AtomicBool::new(false),
            batches: Mutex::new(Vec::new()),
        })
    }

    fn release(&self) {
        self.gate.add_permits(1);
    }

    fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl TelemetryTransport for GatedTransport {
    async fn send(&self, batch: &[TelemetryEvent]) -> adelie::Result<()> {
        self.batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|e| e.event_type.clone()).collect());
        self.started.notify_one();
        self.gate.acquire().await.unwrap().forget();

        if self.fail_next.swap(false, Ordering::SeqCst) || self.failing.load(Ordering::SeqCst) {
            return Err(adelie::Error::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(())
    }
}

fn telemetry_with(transport: Arc<dyn TelemetryTransport>, limits: QueueLimits) -> Telemetry {
    let identity = Identity::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
    Telemetry::new(limits, transport, Arc::new(ManualClock::default()), identity)
}

#[tokio::test(flavor = "current_thread")]
async fn events_tracked_during_failed_flush_follow_the_failed_batch() {
    let transport = GatedTransport::new();
    transport.fail_next.store(true, Ordering::SeqCst);
    let telemetry = telemetry_with(transport.clone(), QueueLimits::default());

    telemetry.track("a", Map::new());
    telemetry.track("b", Map::new());

    let in_flight = {
        let telemetry = telemetry.clone();
        tokio::spawn(async move { telemetry.flush().await })
    };
    transport.started.notified().await;

    for t in ["c", "d", "e"] {
        telemetry.track(t, Map::new());
    }
    assert_eq!(telemetry.flush().await, FlushOutcome::Busy);

    transport.release();
    assert_eq!(
        in_flight.await.unwrap(),
        FlushOutcome::Requeued {
            failed: 2,
            queued: 5
        }
    );
    let pending: Vec<String> = telemetry
        .pending_events()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(pending, vec!["a", "b", "c", "d", "e"]);

    transport.release();
    assert_eq!(telemetry.flush().await, FlushOutcome::Delivered(5));
    assert_eq!(
        transport.batches(),
        vec![vec!["a", "b"], vec!["a", "b", "c", "d", "e"]]
    );
    assert_eq!(telemetry.queued(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn unload_sends_live_queue_next_to_open_flight() {
    let transport = GatedTransport::new();
    let telemetry = telemetry_with(transport.clone(), QueueLimits::default());

    telemetry.track("a", Map::new());
    let in_flight = {
        let telemetry = telemetry.clone();
        tokio::spawn(async move { telemetry.flush().await })
    };
    transport.started.notified().await;

    telemetry.track("b", Map::new());
    telemetry.track("c", Map::new());
    let unload = {
        let telemetry = telemetry.clone();
        tokio::spawn(async move { telemetry.on_lifecycle(Lifecycle::Unload).await })
    };
    transport.started.notified().await;
    assert_eq!(transport.batches(), vec![vec!["a"], vec!["b", "c"]]);
    assert_eq!(telemetry.queued(), 0);

    transport.release();
    transport.release();
    assert_eq!(in_flight.await.unwrap(), FlushOutcome::Delivered(1));
    assert_eq!(unload.await.unwrap(), Some(FlushOutcome::Delivered(2)));
}

#[tokio::test(flavor = "current_thread")]
async fn failed_unload_and_flight_requeue_oldest_first() {
    let transport = GatedTransport::new();
    transport.failing.store(true, Ordering::SeqCst);
    let telemetry = telemetry_with(transport.clone(), QueueLimits::default());

    telemetry.track("a", Map::new());
    let in_flight = {
        let telemetry = telemetry.clone();
        tokio::spawn(async move { telemetry.flush().await })
    };
    transport.started.notified().await;

    telemetry.track("b", Map::new());
    telemetry.track("c", Map::new());
    let unload = {
        let telemetry = telemetry.clone();
        tokio::spawn(async move { telemetry.on_lifecycle(Lifecycle::Hidden).await })
    };
    transport.started.notified().await;
    telemetry.track("d", Map::new());

    transport.release();
    transport.release();
    assert!(matches!(
        in_flight.await.unwrap(),
        FlushOutcome::Requeued { failed: 1, .. }
    ));
    assert!(matches!(
        unload.await.unwrap(),
        Some(FlushOutcome::Requeued { failed: 2, .. })
    ));

    let pending: Vec<String> = telemetry
        .pending_events()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(pending, vec!["a", "b", "c", "d"]);
}

#[tokio::test(flavor = "current_thread")]
async fn retention_cap_holds_through_repeated_failures() {
    let transport = GatedTransport::new();
    let limits = QueueLimits {
        batch_size: 10,
        flush_interval: Duration::from_millis(5000),
        max_retained: 100,
    };
    let telemetry = telemetry_with(transport.clone(), limits);

    for round in 0..15 {
        for n in 0..10 {
            telemetry.track(&format!("r{round}e{n}"), Map::new());
        }
        transport.fail_next.store(true, Ordering::SeqCst);
        transport.release();
        telemetry.flush().await;
        assert!(telemetry.queued() <= 100);
    }

    let pending = telemetry.pending_events();
    assert_eq!(pending.len(), 100);
    assert_eq!(pending.first().unwrap().event_type, "r5e0");
    assert_eq!(pending.last().unwrap().event_type, "r14e9");
}

#[tokio::test]
async fn worker_flushes_when_batch_fills() {
    let transport = GatedTransport::new();
    transport.release();
    let telemetry = telemetry_with(transport.clone(), QueueLimits::default());
    let worker = telemetry.spawn_worker();

    for n in 0..10 {
        telemetry.track(&format!("e{n}"), Map::new());
    }

    timeout(Duration::from_secs(5), async {
        while telemetry.queued() > 0 || transport.batches().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(transport.batches().len(), 1);
    assert_eq!(transport.batches()[0].len(), 10);
    worker.abort();
}

/// One-request HTTP sink that records the body and answers with `status`.
async fn sink(status_line: &'static str) -> (String, tokio::task::JoinHandle<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!(
        "http://{}/api/v1/feedback/analytics/events",
        listener.local_addr().unwrap()
    );

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let body = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            if let Some(head_end) = text.find("\r\n\r\n") {
                let body = &text[head_end + 4..];
                if let Ok(value) = serde_json::from_str::<Value>(body) {
                    break value;
                }
            }
            assert!(n > 0, "client closed before sending a full body");
        };

        let response = format!("{status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok");
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.unwrap();
        body
    });

    (url, handle)
}

#[tokio::test]
async fn http_transport_posts_event_batch() {
    let (url, server) = sink("HTTP/1.1 200 OK").await;
    let tmp = TempDir::new().unwrap();
    let durable = Arc::new(FileStore::new(tmp.path()));
    durable.set(USER_KEY, r#"{"id": 17}"#).unwrap();

    let clock = Arc::new(ManualClock::default());
    clock.advance(Duration::from_millis(1500));
    let telemetry = Telemetry::new(
        QueueLimits::default(),
        Arc::new(HttpTransport::new(url, Duration::from_secs(5)).unwrap()),
        clock,
        Identity::new(durable, Arc::new(MemoryStore::new())),
    );

    telemetry.set_page("/narrative/3");
    let mut data = Map::new();
    data.insert("term".into(), json!("PER"));
    telemetry.track("term_click", data);

    assert_eq!(telemetry.flush().await, FlushOutcome::Delivered(1));
    let body = server.await.unwrap();
    let event = &body["events"][0];
    assert_eq!(event["user_id"], 17);
    assert_eq!(event["event_type"], "term_click");
    assert_eq!(
        event["event_data"],
        json!({"term": "PER", "timestamp": 1500, "page": "/narrative/3"})
    );
    assert!(!event["session_id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn http_transport_non_success_requeues() {
    let (url, server) = sink("HTTP/1.1 503 Service Unavailable").await;
    let telemetry = telemetry_with(
        Arc::new(HttpTransport::new(url, Duration::from_secs(5)).unwrap()),
        QueueLimits::default(),
    );

    telemetry.track("page_view", Map::new());
    assert_eq!(
        telemetry.flush().await,
        FlushOutcome::Requeued {
            failed: 1,
            queued: 1
        }
    );
    server.await.unwrap();
}

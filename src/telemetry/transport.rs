//! Delivery of telemetry batches.

use super::event::TelemetryEvent;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// Deliver one batch. Any error counts as a failed flush.
    async fn send(&self, batch: &[TelemetryEvent]) -> Result<()>;
}

#[derive(Serialize)]
struct EventBatch<'a> {
    events: &'a [TelemetryEvent],
}

/// POSTs `{"events": [...]}` to the analytics sink.
#[derive(Clone)]
pub struct HttpTransport {
    endpoint: String,
    client: reqwest::Client,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl HttpTransport {
    /// `timeout` bounds each request; a timed-out request is a failed flush.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("adelie/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl TelemetryTransport for HttpTransport {
    async fn send(&self, batch: &[TelemetryEvent]) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&EventBatch { events: batch })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Status {
            status: status.as_u16(),
            body: crate::truncate(&body, MAX_ERROR_BODY_CHARS).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    #[test]
    fn batch_body_wraps_events_in_order() {
        let events = vec![
            TelemetryEvent::new(None, "s".into(), "page_view", Map::new(), 1, "/"),
            TelemetryEvent::new(None, "s".into(), "tutor_ask", Map::new(), 2, "/tutor"),
        ];
        let body = serde_json::to_value(EventBatch { events: &events }).unwrap();
        let types: Vec<&str> = body["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["page_view", "tutor_ask"]);
        assert_eq!(body["events"][1]["event_data"], json!({"timestamp": 2, "page": "/tutor"}));
    }

    #[test]
    fn debug_shows_endpoint() {
        let transport =
            HttpTransport::new("http://localhost:8000/events", Duration::from_secs(1)).unwrap();
        assert!(format!("{transport:?}").contains("localhost:8000/events"));
    }
}

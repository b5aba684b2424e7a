//! HTTP client for the streaming chat endpoint.

use super::frame::{ChatEvent, frame_session_id};
use super::relay::{RelaySummary, relay_frames};
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const FRAME_BUFFER: usize = 64;

/// Body of a chat request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub difficulty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_text: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session_id: None,
            difficulty: "beginner".to_string(),
            context_type: None,
            context_id: None,
            context_text: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    url: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl ChatClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    /// Send `request` and start relaying the response body as frames.
    ///
    /// Fails only if the request cannot be sent or the server answers with a
    /// non-success status. Once streaming has started, malformed lines are
    /// skipped and transport errors end the stream.
    pub async fn open(&self, request: &ChatRequest) -> Result<ChatStream> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(url = %self.url, "chat stream opened");
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let relay = tokio::spawn(relay_frames(response.bytes_stream(), tx));
        Ok(ChatStream {
            rx,
            relay,
            session_id: None,
        })
    }
}

/// Frames of one chat response, in arrival order.
#[derive(Debug)]
pub struct ChatStream {
    rx: mpsc::Receiver<Value>,
    relay: JoinHandle<RelaySummary>,
    session_id: Option<String>,
}

impl ChatStream {
    /// Next raw frame, or `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<Value> {
        let frame = self.rx.recv().await?;
        if let Some(id) = frame_session_id(&frame) {
            if self.session_id.as_deref() != Some(id) {
                info!(session_id = id, "chat session announced");
                self.session_id = Some(id.to_string());
            }
        }
        Some(frame)
    }

    /// Next frame interpreted as a [`ChatEvent`].
    pub async fn next_event(&mut self) -> Option<(ChatEvent, Value)> {
        let frame = self.next_frame().await?;
        Some((ChatEvent::from_frame(&frame), frame))
    }

    /// The latest session id announced by a frame read so far.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Stop receiving and wait for the relay to report how the stream ended.
    ///
    /// Returns promptly even if the server keeps the connection open after
    /// its last frame; the summary then ends with `ReceiverDropped`.
    pub async fn finish(self) -> Option<RelaySummary> {
        drop(self.rx);
        match self.relay.await {
            Ok(summary) => Some(summary),
            Err(e) => {
                debug!(error = %e, "chat relay task did not complete");
                None
            }
        }
    }

    /// Stop reading without waiting for the server to close the stream.
    pub fn abort(self) {
        self.relay.abort();
    }
}

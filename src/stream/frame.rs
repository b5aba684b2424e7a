//! Frame decoding for `data: <json>` lines.
//!
//! Decoding is deliberately permissive: anything that is not a `data:` line
//! with a JSON payload is simply not a frame. Heartbeats, comments, blank
//! keep-alive lines and corrupt payloads all decode to `None` so the stream
//! loop keeps going.

use serde_json::Value;

/// Prefix marking a data line (field name plus separator).
pub const DATA_PREFIX: &str = "data: ";

/// Decode one protocol line into a JSON frame.
pub fn decode_frame(line: &str) -> Option<Value> {
    let payload = line.trim().strip_prefix(DATA_PREFIX)?;
    serde_json::from_str(payload).ok()
}

fn json_string_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .and_then(|v| v.as_str())
        .filter(|v| !v.is_empty())
}

fn json_array_field(value: &Value, key: &str) -> Option<Vec<Value>> {
    value.get(key).and_then(|v| v.as_array()).cloned()
}

/// Session id announced by a frame, if any.
///
/// The server attaches `session_id` to whichever frame first knows it
/// (usually `done`), so this is read independently of the frame kind.
pub fn frame_session_id(frame: &Value) -> Option<&str> {
    json_string_field(frame, &["session_id"])
}

/// A decoded frame interpreted against the chat protocol's known kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// Model is reasoning; optional status text
    Thinking { content: Option<String> },
    /// A tool is being invoked
    ToolCall {
        tool: Option<String>,
        args: Option<Value>,
    },
    /// Incremental answer text
    Content { text: String },
    /// Chart or rendered visualization
    Visualization {
        content: Option<String>,
        format: String,
        chart_data: Option<Value>,
        execution_time_ms: Option<u64>,
    },
    /// Citations for the answer so far
    Sources { sources: Vec<Value> },
    /// UI actions the client may perform
    UiAction { actions: Vec<Value> },
    /// Stream finished
    Done {
        sources: Option<Vec<Value>>,
        total_tokens: Option<u64>,
    },
    /// Server-side failure reported in-band
    Error { message: String },
    /// Frame kind this client does not know; kept for forward compatibility
    Other { kind: String, frame: Value },
}

impl ChatEvent {
    pub fn from_frame(frame: &Value) -> Self {
        let kind = frame.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let content = json_string_field(frame, &["content"]).map(ToString::to_string);

        match kind {
            "thinking" => Self::Thinking { content },
            "tool_call" => Self::ToolCall {
                tool: json_string_field(frame, &["tool"]).map(ToString::to_string),
                args: frame.get("args").filter(|v| !v.is_null()).cloned(),
            },
            "visualization" => {
                let chart_data = frame
                    .get("chartData")
                    .or_else(|| frame.get("chart_data"))
                    .filter(|v| !v.is_null())
                    .cloned();
                if chart_data.is_none() && content.is_none() {
                    return Self::other(kind, frame);
                }
                Self::Visualization {
                    content,
                    format: json_string_field(frame, &["format"])
                        .unwrap_or("html")
                        .to_string(),
                    chart_data,
                    execution_time_ms: frame.get("execution_time_ms").and_then(|v| v.as_u64()),
                }
            }
            "sources" => match json_array_field(frame, "sources") {
                Some(sources) => Self::Sources { sources },
                None => Self::other(kind, frame),
            },
            "ui_action" => Self::UiAction {
                actions: json_array_field(frame, "actions").unwrap_or_default(),
            },
            "done" => Self::Done {
                sources: json_array_field(frame, "sources"),
                total_tokens: frame.get("total_tokens").and_then(|v| v.as_u64()),
            },
            "error" => Self::Error {
                message: json_string_field(frame, &["error", "content"])
                    .unwrap_or("unknown error")
                    .to_string(),
            },
            // Any other frame carrying text is part of the answer.
            _ => match content {
                Some(text) => Self::Content { text },
                None => Self::other(kind, frame),
            },
        }
    }

    fn other(kind: &str, frame: &Value) -> Self {
        Self::Other {
            kind: kind.to_string(),
            frame: frame.clone(),
        }
    }

    /// Whether this event ends the answer.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

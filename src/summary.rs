//! Session summaries ("card meta") for history lists.
//!
//! Each chat/agent session gets a small record (title, snippet, icon,
//! keywords) cached under `session_meta:<session_id>` so lists can render
//! without refetching the session. Writes are read-merge-write and are not
//! isolated: two writers racing on one session keep the last scalar values
//! and the union of keywords.

use crate::clock::Clock;
use crate::storage::KeyValueStore;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Storage key prefix for summary records.
pub const SESSION_META_PREFIX: &str = "session_meta:";
/// Most keywords a summary keeps.
pub const MAX_KEYWORDS: usize = 5;

/// Persisted summary of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCardMeta {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub icon_key: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// RFC 3339 time of the last write
    #[serde(default)]
    pub updated_at: String,
}

/// Fields to merge into a summary. `None` leaves the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
}

fn meta_key(session_id: &str) -> Option<String> {
    (!session_id.is_empty()).then(|| format!("{SESSION_META_PREFIX}{session_id}"))
}

/// Trim, drop empties and repeats, keep first-seen order, stop at
/// [`MAX_KEYWORDS`].
pub fn dedupe_keywords<I, S>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut picked = Vec::new();
    let mut seen = HashSet::new();

    for value in values {
        let normalized = value.as_ref().trim();
        if normalized.is_empty() || !seen.insert(normalized.to_string()) {
            continue;
        }
        picked.push(normalized.to_string());
        if picked.len() >= MAX_KEYWORDS {
            break;
        }
    }

    picked
}

fn overlay(target: &mut String, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        *target = value;
    }
}

pub struct SessionSummaryStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SessionSummaryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSummaryStore").finish_non_exhaustive()
    }
}

impl SessionSummaryStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Stored summary for `session_id`. Missing, unreadable and undecodable
    /// records all read as `None`.
    pub fn read(&self, session_id: &str) -> Option<SessionCardMeta> {
        let key = meta_key(session_id)?;
        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(e) => {
                debug!(%session_id, error = %e, "failed to read session summary");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                debug!(%session_id, error = %e, "ignoring undecodable session summary");
                None
            }
        }
    }

    /// Merge `patch` into the stored summary and persist it.
    ///
    /// Present, non-empty scalar fields overwrite. Keywords become the
    /// deduplicated union of stored and incoming keywords. `updated_at` is
    /// stamped with the current time. Returns the merged record, or the
    /// previous one (empty if none) when persisting fails. `None` only for an
    /// empty session id.
    pub fn write(&self, session_id: &str, patch: SessionCardPatch) -> Option<SessionCardMeta> {
        let key = meta_key(session_id)?;
        let previous = self.read(session_id).unwrap_or_default();

        let mut merged = previous.clone();
        overlay(&mut merged.title, patch.title);
        overlay(&mut merged.snippet, patch.snippet);
        if let Some(icon) = patch.icon_key.filter(|v| !v.is_empty()) {
            merged.icon_key = Some(icon);
        }
        merged.keywords = match patch.keywords {
            Some(incoming) => dedupe_keywords(previous.keywords.iter().chain(incoming.iter())),
            None => dedupe_keywords(&previous.keywords),
        };
        merged.updated_at = self
            .clock
            .wall()
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let json = match serde_json::to_string(&merged) {
            Ok(json) => json,
            Err(e) => {
                warn!(%session_id, error = %e, "failed to encode session summary");
                return Some(previous);
            }
        };
        if let Err(e) = self.store.set(&key, &json) {
            warn!(%session_id, error = %e, "failed to persist session summary");
            return Some(previous);
        }
        Some(merged)
    }
}

// ---------------------------------------------------------------------------
// Building a summary from a session payload
// ---------------------------------------------------------------------------

static NULL: Value = Value::Null;

/// Caller-supplied fallbacks for [`build_session_card_meta`].
#[derive(Debug, Clone, Default)]
pub struct CardFallbacks {
    pub title: String,
    pub snippet: String,
    pub icon_key: Option<String>,
}

/// First non-empty string among `keys` on `value`.
fn first_string<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| value.get(*key))
        .filter_map(|v| v.as_str())
        .find(|v| !v.is_empty())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn keyword_objects(context: &Value) -> Vec<&Value> {
    let list = context
        .get("keywords")
        .and_then(|v| v.as_array())
        .or_else(|| {
            context
                .get("ui_snapshot")
                .and_then(|s| s.get("keywords"))
                .and_then(|v| v.as_array())
        });
    list.map(|items| items.iter().filter(|v| is_truthy(v)).collect())
        .unwrap_or_default()
}

/// Derive a summary from a session's step content.
///
/// `step_content` is the JSON text attached to the session; its `context`
/// object (or the payload itself) supplies keywords and titles. Title
/// precedence: first keyword's `title`, `case_title`, `stock_name`, fallback,
/// empty. Icon precedence: first keyword's `icon_key`, context `icon_key`,
/// fallback, none.
pub fn build_session_card_meta(
    step_content: Option<&str>,
    fallbacks: &CardFallbacks,
) -> SessionCardPatch {
    let payload: Option<Value> = step_content.and_then(|raw| serde_json::from_str(raw).ok());
    let context = payload
        .as_ref()
        .map(|p| p.get("context").filter(|c| is_truthy(c)).unwrap_or(p))
        .unwrap_or(&NULL);

    let keywords = keyword_objects(context);
    let labels = dedupe_keywords(
        keywords
            .iter()
            .filter_map(|k| first_string(k, &["title", "keyword", "name", "label"])),
    );
    let first = keywords.first().copied().unwrap_or(&NULL);

    let icon_key = first_string(first, &["icon_key"])
        .or_else(|| first_string(context, &["icon_key"]))
        .map(ToString::to_string)
        .or_else(|| fallbacks.icon_key.clone().filter(|v| !v.is_empty()));

    let title = first_string(first, &["title"])
        .or_else(|| first_string(context, &["case_title"]))
        .or_else(|| first_string(context, &["stock_name"]))
        .unwrap_or(fallbacks.title.as_str())
        .to_string();

    SessionCardPatch {
        title: Some(title),
        snippet: Some(fallbacks.snippet.clone()),
        icon_key,
        keywords: Some(labels),
    }
}

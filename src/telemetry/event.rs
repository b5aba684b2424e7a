//! Telemetry event records and the identities stamped onto them.

use crate::storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// Volatile-store key holding the per-run session id.
pub const SESSION_ID_KEY: &str = "adelie_session_id";
/// Durable-store key holding the signed-in user record.
pub const USER_KEY: &str = "user";

/// One analytics event as sent to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Signed-in user id (string or number), `None` when anonymous
    pub user_id: Option<Value>,
    pub session_id: String,
    pub event_type: String,
    pub event_data: EventData,
}

/// Caller data plus the fields every event carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    /// Wall-clock milliseconds at emission
    pub timestamp: i64,
    /// Route path at emission
    pub page: String,
}

impl TelemetryEvent {
    /// Build an event. `timestamp` and `page` win over same-named keys in
    /// `data`.
    pub fn new(
        user_id: Option<Value>,
        session_id: String,
        event_type: impl Into<String>,
        mut data: Map<String, Value>,
        timestamp: i64,
        page: impl Into<String>,
    ) -> Self {
        data.remove("timestamp");
        data.remove("page");
        Self {
            user_id,
            session_id,
            event_type: event_type.into(),
            event_data: EventData {
                fields: data,
                timestamp,
                page: page.into(),
            },
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.event_data.timestamp
    }

    pub fn page(&self) -> &str {
        &self.event_data.page
    }
}

/// Resolves who an event belongs to at emission time.
///
/// Both ids are read from their stores once and cached; clones share the
/// cache. Call [`Identity::refresh_user`] after a sign-in or sign-out.
#[derive(Clone)]
pub struct Identity {
    durable: Arc<dyn KeyValueStore>,
    volatile: Arc<dyn KeyValueStore>,
    session: Arc<OnceLock<String>>,
    user: Arc<Mutex<Option<Option<Value>>>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").finish_non_exhaustive()
    }
}

impl Identity {
    /// `durable` holds the signed-in user; `volatile` holds the session id
    /// and should not outlive the process.
    pub fn new(durable: Arc<dyn KeyValueStore>, volatile: Arc<dyn KeyValueStore>) -> Self {
        Self {
            durable,
            volatile,
            session: Arc::new(OnceLock::new()),
            user: Arc::new(Mutex::new(None)),
        }
    }

    /// The session id, generated on first use and reused afterwards.
    pub fn session_id(&self) -> String {
        self.session.get_or_init(|| self.load_session_id()).clone()
    }

    fn load_session_id(&self) -> String {
        match self.volatile.get(SESSION_ID_KEY) {
            Ok(Some(id)) if !id.is_empty() => return id,
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read session id"),
        }

        let id = uuid::Uuid::new_v4().to_string();
        if let Err(e) = self.volatile.set(SESSION_ID_KEY, &id) {
            warn!(error = %e, "failed to persist session id");
        }
        id
    }

    /// The signed-in user's id, if any. Unreadable or malformed records count
    /// as anonymous.
    pub fn user_id(&self) -> Option<Value> {
        let Ok(mut cached) = self.user.lock() else {
            return self.load_user_id();
        };
        cached.get_or_insert_with(|| self.load_user_id()).clone()
    }

    /// Drop the cached user id so the next event re-reads the durable store.
    pub fn refresh_user(&self) {
        if let Ok(mut cached) = self.user.lock() {
            *cached = None;
        }
        debug!("user identity cache cleared");
    }

    fn load_user_id(&self) -> Option<Value> {
        let raw = self.durable.get(USER_KEY).ok().flatten()?;
        let user: Value = serde_json::from_str(&raw).ok()?;
        match user.get("id")? {
            Value::String(s) if !s.is_empty() => Some(Value::String(s.clone())),
            Value::Number(n) => Some(Value::Number(n.clone())),
            _ => None,
        }
    }
}

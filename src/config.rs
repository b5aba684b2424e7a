//! Persistence for client settings (`config.json`).
//!
//! Saved to the platform config directory, e.g. `~/.config/adelie/config.json`
//! on Linux or `~/Library/Application Support/adelie/config.json` on macOS.
//! A missing or unreadable file yields defaults; unknown fields are ignored.

use crate::storage::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Client settings (persisted to config.json).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the backend, without trailing slash.
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Path of the streaming chat endpoint.
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub viewport: ViewportConfig,
}

fn default_api_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_chat_path() -> String {
    "/api/v1/tutor/chat".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            chat_path: default_chat_path(),
            telemetry: TelemetryConfig::default(),
            viewport: ViewportConfig::default(),
        }
    }
}

impl Config {
    pub fn chat_url(&self) -> String {
        join_url(&self.api_base_url, &self.chat_path)
    }

    pub fn telemetry_url(&self) -> String {
        join_url(&self.api_base_url, &self.telemetry.path)
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Batching and retention knobs for the telemetry queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Path of the analytics sink.
    pub path: String,
    /// Queue length that triggers an immediate flush.
    pub batch_size: usize,
    /// Delay before a timer-triggered flush, in milliseconds.
    pub flush_interval_ms: u64,
    /// Events kept in memory across failed flushes.
    pub max_retained: usize,
    /// Per-request timeout for the sink, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            path: "/api/v1/feedback/analytics/events".to_string(),
            batch_size: 10,
            flush_interval_ms: 5000,
            max_retained: 100,
            request_timeout_ms: 10_000,
        }
    }
}

impl TelemetryConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Keyboard inset detection knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Inset above which the on-screen keyboard counts as open.
    pub keyboard_threshold_px: u32,
    /// Widest viewport still considered mobile.
    pub mobile_max_width_px: u32,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            keyboard_threshold_px: 56,
            mobile_max_width_px: 768,
        }
    }
}

// ---------------------------------------------------------------------------
// Directory helpers
// ---------------------------------------------------------------------------

/// Adelie config directory (e.g. `~/.config/adelie/`).
fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("adelie"))
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from disk, returning defaults if the file is missing or invalid.
pub fn load_config() -> Config {
    let Some(path) = config_dir().map(|d| d.join("config.json")) else {
        return Config::default();
    };
    load_config_from(&path)
}

/// Save config to disk.
pub fn save_config(config: &Config) -> Result<(), std::io::Error> {
    let dir = config_dir().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "config dir not found")
    })?;
    save_config_to(config, &dir.join("config.json"))
}

pub fn load_config_from(path: &Path) -> Config {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "invalid config, using defaults");
            Config::default()
        }),
        Err(_) => Config::default(),
    }
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config).map_err(std::io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Adelie: client resilience layer for the tutoring backend
//!
//! Reassembles the chat response stream into frames, batches usage
//! telemetry with retry-on-next-flush, caches per-session summary cards, and
//! tracks the on-screen keyboard inset for mobile layouts.

pub mod clock;
pub mod config;
mod error;
pub mod storage;
pub mod stream;
pub mod summary;
pub mod telemetry;
pub mod viewport;

pub use error::{Error, Result};

/// Truncate to at most `max` characters, respecting char boundaries.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

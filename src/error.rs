//! Library error type.
//!
//! Only the fallible seams (storage, transports, config persistence) return
//! these. Operations that must never fail for their callers (`track`, frame
//! decoding, summary reads) log and swallow them instead.

use thiserror::Error;

/// Errors raised at the I/O seams of the resilience layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, Error>;

//! Error types for telemetry ingestion, lap recording and caching.
//!
//! Every fallible operation in kartwall returns [`KartwallError`]. The enum is
//! split along the line the engine cares about most: infrastructure failures
//! that are recovered locally, and usage failures that go straight back to the
//! caller.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: the timing feed refused or dropped the connection
//! - **Malformed Messages**: a frame that is not JSON or has no drivers map
//! - **Store Errors**: a cache tier or the document store is unavailable
//! - **Session Errors**: a lap operation was attempted with no session running
//! - **Codec Errors**: a lap-time string could not be parsed
//! - **Usage Errors**: lap numbers below 1, page index 0
//! - **Configuration Errors**: invalid or unreadable configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use kartwall::KartwallError;
//!
//! let error = KartwallError::transport("connection reset by peer");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! Transport and store errors never escape the engine in normal operation:
//! the reconnect state machine and the cache tiers absorb them. They are still
//! part of the public enum because the backend traits return them.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for kartwall operations.
pub type Result<T, E = KartwallError> = std::result::Result<T, E>;

/// Main error type for kartwall operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KartwallError {
    #[error("Timing feed transport failed: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Malformed telemetry message: {details}")]
    MalformedMessage { details: String },

    #[error("Store '{backend}' unavailable: {reason}")]
    StoreUnavailable {
        backend: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("No active session; call start_session first")]
    NoActiveSession,

    #[error("Invalid lap time '{input}'")]
    InvalidLapTime { input: String },

    #[error("Invalid lap number {lap_number} for kart '{kart_id}'; laps start at 1")]
    InvalidLapNumber { kart_id: String, lap_number: u32 },

    #[error("Invalid page index {page}; pages start at 1")]
    InvalidPage { page: usize },

    #[error("Serialization failed in {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("I/O error: {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl KartwallError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            KartwallError::Transport { .. } => true,
            KartwallError::Timeout { .. } => true,
            KartwallError::StoreUnavailable { .. } => true,
            KartwallError::Io { .. } => true,
            KartwallError::MalformedMessage { .. } => false,
            KartwallError::NoActiveSession => false,
            KartwallError::InvalidLapTime { .. } => false,
            KartwallError::InvalidLapNumber { .. } => false,
            KartwallError::InvalidPage { .. } => false,
            KartwallError::Serialization { .. } => false,
            KartwallError::Config { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            KartwallError::Transport { .. } => vec![
                "Check that the timing feed URL is reachable",
                "Verify the circuit id exists on the timing provider",
                "Call reconnect() once the network is back",
            ],
            KartwallError::Timeout { .. } => vec![
                "Increase feed.connect_timeout_secs",
                "Check network latency to the timing provider",
            ],
            KartwallError::MalformedMessage { .. } => vec![
                "Check the timing provider's message format",
                "Capture the raw frame with RUST_LOG=kartwall=trace",
            ],
            KartwallError::StoreUnavailable { .. } => vec![
                "Check the storage backend is running",
                "Verify the cache directory is writable",
                "Reads fall back to lower tiers until the store recovers",
            ],
            KartwallError::NoActiveSession => {
                vec!["Call start_session(circuit_id) before recording laps"]
            }
            KartwallError::InvalidLapTime { .. } => vec![
                "Use m:ss.fff, h:mm:ss.fff or ss.fff notation",
                "Filter placeholder values before parsing",
            ],
            KartwallError::InvalidLapNumber { .. } => vec!["Number laps from 1 within each session"],
            KartwallError::InvalidPage { .. } => vec!["Request pages starting from 1"],
            KartwallError::Serialization { .. } => vec![
                "Check stored documents were written by a compatible version",
                "Invalidate the affected cache keys",
            ],
            KartwallError::Config { .. } => vec![
                "Check the configuration file against the documented keys",
                "Remove the offending key to fall back to its default",
            ],
            KartwallError::Io { .. } => vec![
                "Check file exists and is readable",
                "Check directory permissions",
                "Ensure sufficient disk space",
            ],
        }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        KartwallError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        KartwallError::Transport { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for malformed message errors.
    pub fn malformed(details: impl Into<String>) -> Self {
        KartwallError::MalformedMessage { details: details.into() }
    }

    /// Helper constructor for store errors.
    pub fn store_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        KartwallError::StoreUnavailable { backend: backend.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for store errors with source.
    pub fn store_unavailable_with_source(
        backend: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        KartwallError::StoreUnavailable {
            backend: backend.into(),
            reason: reason.into(),
            source: Some(source),
        }
    }

    /// Helper constructor for serialization errors.
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        KartwallError::Serialization { context: context.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        KartwallError::Config { reason: reason.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn io_error(path: PathBuf, source: std::io::Error) -> Self {
        KartwallError::Io { path, source }
    }
}

impl From<std::io::Error> for KartwallError {
    fn from(err: std::io::Error) -> Self {
        KartwallError::Io { path: PathBuf::from("<unknown>"), source: err }
    }
}

// src/error.rs

//! Unified error handling for the archiver.
//!
//! `AppError` covers everything the binary and the loaders can hit. The sync
//! engine itself works with the narrower enums below, because the
//! orchestrator picks a recovery policy per category and never lets them
//! escape a run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::SourceKind;

/// Result type alias for archiver operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URL parsing failed
    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    /// Persistence store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Platform adapter failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure reported by a platform adapter for one page request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection resets, 5xx responses
    #[error("transient network error: {0}")]
    Transient(String),

    /// Platform-reported throttling
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected or missing
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Credentials valid but not allowed to read the resource
    #[error("permission denied: {0}")]
    Permission(String),

    /// Unexpected status or undecodable body
    #[error("unexpected response: {0}")]
    Protocol(String),

    /// Cursor token not produced by this adapter
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),
}

impl FetchError {
    pub fn transient(message: impl fmt::Display) -> Self {
        Self::Transient(message.to_string())
    }

    pub fn protocol(message: impl fmt::Display) -> Self {
        Self::Protocol(message.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientNetwork,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Permission(_) => ErrorKind::Permission,
            Self::Protocol(_) | Self::InvalidCursor(_) => ErrorKind::Protocol,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Protocol(error.to_string())
        } else {
            Self::Transient(error.to_string())
        }
    }
}

/// A raw item that could not be mapped into the common model.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NormalizationError {
    #[error("{kind} item has no native id (expected field `{field}`)")]
    MissingNativeId { kind: SourceKind, field: &'static str },

    #[error("{kind} item payload is not a JSON object")]
    NotAnObject { kind: SourceKind },

    #[error("{kind} item field `{field}` is invalid: {reason}")]
    InvalidField {
        kind: SourceKind,
        field: &'static str,
        reason: String,
    },
}

/// Persistence store failure. Any of these rolls back the page in flight.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored cursor moved since the worker loaded it.
    #[error("stale cursor for {kind}: expected sequence {expected}, store has {found}")]
    StaleCursor {
        kind: SourceKind,
        expected: u64,
        found: u64,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store connection poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::StaleCursor { .. } => ErrorKind::StaleCursor,
            _ => ErrorKind::StoreCommit,
        }
    }
}

/// Error categories counted in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    RateLimited,
    Auth,
    Permission,
    Protocol,
    Normalization,
    StoreCommit,
    StaleCursor,
    /// The request asked for something a run cannot do
    InvalidRequest,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TransientNetwork => "transient_network",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Permission => "permission",
            Self::Protocol => "protocol",
            Self::Normalization => "normalization",
            Self::StoreCommit => "store_commit",
            Self::StaleCursor => "stale_cursor",
            Self::InvalidRequest => "invalid_request",
        };
        f.write_str(name)
    }
}

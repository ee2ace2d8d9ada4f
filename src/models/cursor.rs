// src/models/cursor.rs

//! Per-source sync progress.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FetchError;
use crate::models::SourceKind;

/// Opaque position inside a platform's history.
///
/// Only the adapter that produced a token knows what it means; everyone else
/// stores and hands it back verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "token", rename_all = "snake_case")]
pub enum CursorPosition {
    /// Start of history (first run, or forced full resync)
    Beginning,
    /// Adapter-defined state
    Token(Value),
}

impl CursorPosition {
    /// Encode adapter state as a token.
    pub fn encode<T: Serialize>(state: &T) -> Result<Self, FetchError> {
        serde_json::to_value(state)
            .map(Self::Token)
            .map_err(|e| FetchError::InvalidCursor(e.to_string()))
    }

    /// Decode adapter state; `Beginning` maps to the state's default.
    pub fn decode<T: DeserializeOwned + Default>(&self) -> Result<T, FetchError> {
        match self {
            Self::Beginning => Ok(T::default()),
            Self::Token(value) => serde_json::from_value(value.clone())
                .map_err(|e| FetchError::InvalidCursor(e.to_string())),
        }
    }
}

/// Versioned progress record for one source.
///
/// `sequence` increases by one with every committed page; the store refuses a
/// commit whose predecessor sequence does not match what it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub source_kind: SourceKind,
    pub position: CursorPosition,
    pub sequence: u64,
}

impl SyncCursor {
    /// Cursor for a source that has never been synced.
    pub fn beginning(source_kind: SourceKind) -> Self {
        Self {
            source_kind,
            position: CursorPosition::Beginning,
            sequence: 0,
        }
    }

    /// Successor cursor to commit along with a page.
    pub fn advance(&self, position: CursorPosition) -> Self {
        Self {
            source_kind: self.source_kind,
            position,
            sequence: self.sequence + 1,
        }
    }

    /// Same version, position reset to the beginning of history.
    pub fn restart(&self) -> Self {
        Self {
            source_kind: self.source_kind,
            position: CursorPosition::Beginning,
            sequence: self.sequence,
        }
    }
}

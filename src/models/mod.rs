// src/models/mod.rs

//! Domain models for the archiver.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod cursor;
mod item;
mod source;
mod summary;

// Re-export all public types
pub use config::{Config, HttpConfig, RetryConfig, StoreConfig, SyncConfig};
pub use cursor::{CursorPosition, SyncCursor};
pub use item::{Body, BodyFormat, ContentItem, Extras, ItemKind, MediaRef, RawItem, StoredItem};
pub use source::{RunRequest, Source, SourceKind, SourceRequest};
pub use summary::{
    ReconcileReport, RunOutcome, RunSummary, SkippedItem, SourceReport, SourceState,
};

//! Persistence for archived items and sync cursors.
//!
//! The store is the only state shared between source workers. Items and the
//! cursor that protects them only ever change together, inside
//! [`ArchiveStore::commit_page`].
//!
//! ## Layout
//!
//! ```text
//! content_items   surrogate id, UNIQUE(source_kind, source_native_id)
//! sync_cursors    source_kind -> position + sequence
//! sync_runs       one JSON summary per run
//! ```

pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ReconcileReport, RunSummary, SourceKind, StoredItem, SyncCursor};
use crate::pipeline::Action;

pub use sqlite::SqliteStore;

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// What one page commit changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Previously dangling children linked to a parent in this page
    pub linked: usize,
}

/// Trait for archive storage backends.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Load the cursor for a source kind; never-synced kinds start at the
    /// beginning with sequence 0.
    async fn load_cursor(&self, kind: SourceKind) -> StoreResult<SyncCursor>;

    /// Fetch the stored rows for the given native ids, keyed by native id.
    async fn find_existing(
        &self,
        kind: SourceKind,
        native_ids: &[String],
    ) -> StoreResult<HashMap<String, StoredItem>>;

    /// Apply a page's actions and advance the cursor in one transaction.
    ///
    /// Fails with `StaleCursor` without writing anything when the stored
    /// sequence is not `expected_sequence`.
    async fn commit_page(
        &self,
        actions: &[Action],
        expected_sequence: u64,
        cursor: &SyncCursor,
    ) -> StoreResult<CommitReport>;

    /// Link every dangling parent reference that can now be resolved.
    async fn reconcile_dangling(&self) -> StoreResult<ReconcileReport>;

    /// Look up one item by natural key.
    async fn item(&self, kind: SourceKind, native_id: &str) -> StoreResult<Option<StoredItem>>;

    /// Number of archived items, optionally for one kind.
    async fn count_items(&self, kind: Option<SourceKind>) -> StoreResult<usize>;

    /// All stored cursors.
    async fn cursors(&self) -> StoreResult<Vec<SyncCursor>>;

    /// Persist a run summary.
    async fn record_run(&self, summary: &RunSummary) -> StoreResult<()>;

    /// Most recently recorded run summary.
    async fn latest_run(&self) -> StoreResult<Option<RunSummary>>;
}

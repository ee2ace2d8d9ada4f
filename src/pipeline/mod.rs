//! Sync pipeline.
//!
//! - `normalize`: raw platform items to canonical content items
//! - `resolve`: insert/update/no-op decisions against the store
//! - `retry`: backoff and rate-limit policy
//! - `sync`: the per-source orchestrator
//! - `run_sync` / `run_reconcile` / `run_validate`: entry points

pub mod normalize;
pub mod resolve;
pub mod retry;
pub mod run;
pub mod sync;
pub mod validate;

pub use normalize::normalize;
pub use resolve::Action;
pub use retry::{RetryDecision, RetryPolicy};
pub use run::{request_all, run_reconcile, run_sync};
pub use sync::{SourceJob, SyncOrchestrator, SyncState};
pub use validate::run_validate;

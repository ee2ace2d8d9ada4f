// src/pipeline/sync.rs

//! Sync orchestrator.
//!
//! One worker per source, run concurrently up to `sync.max_concurrent`.
//! Within a source, pages are strictly sequential and each page is committed
//! (items plus cursor) before the next one is fetched:
//!
//! ```text
//! Idle -> Fetching -> Normalizing -> Resolving -> Committing -> Fetching ...
//!            |  ^                                    |
//!            v  |                                    v
//!        BackoffWait                          Done | Failed
//! ```
//!
//! After every worker has stopped, one reconcile pass links dangling parent
//! references.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, FetchError, StoreError};
use crate::models::{
    Config, CursorPosition, RunOutcome, RunSummary, SkippedItem, Source, SourceReport,
    SourceRequest, SourceState, SyncCursor,
};
use crate::pipeline::normalize::normalize;
use crate::pipeline::resolve::{dedupe_batch, resolve_batch};
use crate::pipeline::retry::{RetryDecision, RetryPolicy};
use crate::services::{Page, PlatformAdapter};
use crate::storage::ArchiveStore;

/// Per-source worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Fetching,
    BackoffWait,
    Normalizing,
    Resolving,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A source to sync together with its adapter, or the reason it cannot be
/// synced in this run.
pub struct SourceJob<A> {
    request: SourceRequest,
    adapter: Result<A, Stop>,
}

impl<A> SourceJob<A> {
    pub fn new(request: SourceRequest, adapter: Result<A, FetchError>) -> Self {
        Self {
            request,
            adapter: adapter.map_err(|e| Stop::failed(e.kind(), e)),
        }
    }

    /// A source the run refuses to sync; it is reported as failed.
    pub fn rejected(request: SourceRequest, reason: impl fmt::Display) -> Self {
        Self {
            request,
            adapter: Err(Stop::failed(ErrorKind::InvalidRequest, reason)),
        }
    }
}

/// Why a worker stopped before its source was exhausted.
enum Stop {
    Cancelled,
    Failed { kind: ErrorKind, reason: String },
}

impl Stop {
    fn failed(kind: ErrorKind, reason: impl fmt::Display) -> Self {
        Self::Failed {
            kind,
            reason: reason.to_string(),
        }
    }
}

impl From<StoreError> for Stop {
    fn from(error: StoreError) -> Self {
        Self::failed(error.kind(), error)
    }
}

/// Drives all source workers of a run against one store.
pub struct SyncOrchestrator<S> {
    store: Arc<S>,
    policy: RetryPolicy,
    max_concurrent: usize,
    cancel: CancellationToken,
}

impl<S: ArchiveStore> SyncOrchestrator<S> {
    pub fn new(store: Arc<S>, config: &Config, cancel: CancellationToken) -> Self {
        Self {
            store,
            policy: RetryPolicy::new(config.retry.clone()),
            max_concurrent: config.sync.max_concurrent.max(1),
            cancel,
        }
    }

    /// Sync every job and return the run summary. Never fails: per-source
    /// problems end up in the summary.
    pub async fn run<A: PlatformAdapter>(&self, jobs: Vec<SourceJob<A>>) -> RunSummary {
        let started_at = Utc::now();
        log::info!(
            "Starting sync of {} source(s), up to {} at a time",
            jobs.len(),
            self.max_concurrent
        );

        let mut reports: Vec<(usize, SourceReport)> = stream::iter(jobs.into_iter().enumerate())
            .map(|(index, job)| async move { (index, self.sync_source(job).await) })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;
        reports.sort_by_key(|(index, _)| *index);
        let sources: Vec<SourceReport> = reports.into_iter().map(|(_, r)| r).collect();

        let (reconciliation, reconcile_error) = match self.store.reconcile_dangling().await {
            Ok(report) => {
                log::info!(
                    "Reconciliation linked {} reference(s), {} still dangling",
                    report.linked,
                    report.dangling
                );
                (Some(report), None)
            }
            Err(e) => {
                log::error!("Reconciliation failed: {e}");
                (None, Some(e.to_string()))
            }
        };

        let summary = RunSummary {
            started_at,
            finished_at: Utc::now(),
            outcome: RunOutcome::from_reports(&sources),
            sources,
            reconciliation,
            reconcile_error,
        };

        if let Err(e) = self.store.record_run(&summary).await {
            log::warn!("Could not record run summary: {e}");
        }
        log::info!(
            "Sync finished: {:?}, {} write(s)",
            summary.outcome,
            summary.total_writes()
        );
        summary
    }

    async fn sync_source<A: PlatformAdapter>(&self, job: SourceJob<A>) -> SourceReport {
        let SourceJob { request, adapter } = job;
        let source = &request.source;
        let mut worker = Worker::new(source);

        let result = match adapter {
            Ok(adapter) => self.drive(&adapter, &request, &mut worker).await,
            Err(stop) => {
                if let Stop::Failed { kind, .. } = &stop {
                    worker.report.record_error(*kind);
                }
                Err(stop)
            }
        };

        worker.report.state = match result {
            Ok(()) => {
                worker.transition(SyncState::Done);
                log::info!(
                    "{}: done after {} page(s): {} new, {} updated, {} unchanged, {} skipped",
                    source.name,
                    worker.report.pages_fetched,
                    worker.report.inserted,
                    worker.report.updated,
                    worker.report.unchanged,
                    worker.report.skipped.len()
                );
                SourceState::Done
            }
            Err(Stop::Cancelled) => {
                log::warn!(
                    "{}: cancelled after {} committed page(s)",
                    source.name,
                    worker.report.pages_fetched
                );
                SourceState::Partial {
                    reason: "cancelled".to_string(),
                }
            }
            Err(Stop::Failed { kind, reason }) => {
                worker.transition(SyncState::Failed);
                if matches!(kind, ErrorKind::Auth | ErrorKind::Permission) {
                    log::error!(
                        "{}: credential '{}' rejected ({kind}): {reason}",
                        source.name,
                        source.credential
                    );
                } else {
                    log::error!("{}: failed ({kind}): {reason}", source.name);
                }
                SourceState::Failed { kind, reason }
            }
        };
        worker.report
    }

    async fn drive<A: PlatformAdapter>(
        &self,
        adapter: &A,
        request: &SourceRequest,
        worker: &mut Worker,
    ) -> Result<(), Stop> {
        let kind = request.source.kind;
        if adapter.kind() != kind {
            return Err(Stop::failed(
                ErrorKind::Protocol,
                format!("adapter for {} cannot sync {kind}", adapter.kind()),
            ));
        }

        worker.transition(SyncState::Fetching);
        let mut cursor = self.store.load_cursor(kind).await?;
        if request.force_full {
            log::info!("{}: full resync requested", request.source.name);
            cursor = cursor.restart();
        }
        worker.report.final_sequence = cursor.sequence;

        loop {
            if self.cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }

            worker.transition(SyncState::Fetching);
            let page = self.fetch_page(adapter, &cursor.position, worker).await?;
            worker.page += 1;
            worker.report.pages_fetched += 1;
            let exhausted = page.exhausted;

            let next = self.process_page(page, &cursor, worker).await?;
            cursor = next;
            worker.report.final_sequence = cursor.sequence;

            if exhausted {
                return Ok(());
            }
        }
    }

    /// Fetch one page, waiting out rate limits and retrying transient
    /// failures. The cursor is never advanced here.
    async fn fetch_page<A: PlatformAdapter>(
        &self,
        adapter: &A,
        position: &CursorPosition,
        worker: &mut Worker,
    ) -> Result<Page, Stop> {
        let mut attempt = 0;
        loop {
            let error = match adapter.fetch_since(position).await {
                Ok(page) => return Ok(page),
                Err(e) => e,
            };
            worker.report.record_error(error.kind());
            if !matches!(error, FetchError::RateLimited { .. }) {
                attempt += 1;
            }

            match self.policy.decide(&error, attempt) {
                RetryDecision::WaitForRateLimit(wait) => {
                    worker.report.rate_limit_waits += 1;
                    log::warn!(
                        "{}: rate limited on page {}, waiting {:?}",
                        worker.name,
                        worker.page + 1,
                        wait
                    );
                    self.wait(worker, wait).await?;
                }
                RetryDecision::Backoff(delay) => {
                    log::warn!(
                        "{}: page {} attempt {} failed: {error}; retrying in {:?}",
                        worker.name,
                        worker.page + 1,
                        attempt,
                        delay
                    );
                    self.wait(worker, delay).await?;
                }
                RetryDecision::GiveUp => return Err(Stop::failed(error.kind(), error)),
            }
        }
    }

    /// Normalize, resolve and commit one page; returns the committed cursor.
    async fn process_page(
        &self,
        page: Page,
        cursor: &SyncCursor,
        worker: &mut Worker,
    ) -> Result<SyncCursor, Stop> {
        let kind = cursor.source_kind;

        worker.transition(SyncState::Normalizing);
        let mut normalized = Vec::with_capacity(page.items.len());
        for (position, raw) in page.items.iter().enumerate() {
            match normalize(raw, kind) {
                Ok(item) => normalized.push(item),
                Err(e) => {
                    log::warn!(
                        "{}: skipping item {} of page {}: {e}",
                        worker.name,
                        position,
                        worker.page
                    );
                    worker.report.record_error(ErrorKind::Normalization);
                    worker.report.skipped.push(SkippedItem {
                        page: worker.page,
                        position,
                        reason: e.to_string(),
                    });
                }
            }
        }
        let (items, duplicates) = dedupe_batch(normalized);
        worker.report.in_batch_duplicates += duplicates;

        let next = cursor.advance(page.next_cursor);
        let native_ids: Vec<String> = items.iter().map(|i| i.source_native_id.clone()).collect();

        let mut attempt = 0;
        loop {
            attempt += 1;
            worker.transition(SyncState::Resolving);
            let result = match self.store.find_existing(kind, &native_ids).await {
                Ok(existing) => {
                    let actions = resolve_batch(items.clone(), &existing);
                    worker.transition(SyncState::Committing);
                    self.store
                        .commit_page(&actions, cursor.sequence, &next)
                        .await
                }
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(committed) => {
                    worker.report.inserted += committed.inserted;
                    worker.report.updated += committed.updated;
                    worker.report.unchanged += committed.unchanged;
                    worker.report.linked += committed.linked;
                    log::debug!(
                        "{}: page {} committed (seq {}): +{} ~{} ={} linked {}",
                        worker.name,
                        worker.page,
                        next.sequence,
                        committed.inserted,
                        committed.updated,
                        committed.unchanged,
                        committed.linked
                    );
                    return Ok(next);
                }
                Err(e) => e,
            };

            worker.report.record_error(error.kind());
            if matches!(error, StoreError::StaleCursor { .. }) {
                return Err(error.into());
            }
            match self.policy.decide_commit(attempt) {
                RetryDecision::Backoff(delay) | RetryDecision::WaitForRateLimit(delay) => {
                    log::warn!(
                        "{}: commit of page {} failed: {error}; retrying in {:?}",
                        worker.name,
                        worker.page,
                        delay
                    );
                    self.wait(worker, delay).await?;
                }
                RetryDecision::GiveUp => return Err(error.into()),
            }
        }
    }

    /// Sleep unless the run is cancelled first.
    async fn wait(&self, worker: &mut Worker, duration: Duration) -> Result<(), Stop> {
        let resume = worker.state;
        worker.transition(SyncState::BackoffWait);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Stop::Cancelled),
            _ = tokio::time::sleep(duration) => {
                worker.transition(resume);
                Ok(())
            }
        }
    }
}

/// Mutable bookkeeping of one source worker.
struct Worker {
    name: String,
    state: SyncState,
    /// 1-based number of the page being processed
    page: usize,
    report: SourceReport,
}

impl Worker {
    fn new(source: &Source) -> Self {
        Self {
            name: source.name.clone(),
            state: SyncState::Idle,
            page: 0,
            report: SourceReport::new(source),
        }
    }

    fn transition(&mut self, next: SyncState) {
        if self.state != next {
            log::trace!("{}: {} -> {}", self.name, self.state, next);
            self.state = next;
        }
    }
}

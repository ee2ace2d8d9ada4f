// src/pipeline/run.rs

//! Run entry points: build adapters for a request and drive a sync run.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::CredentialProvider;
use crate::error::{FetchError, Result};
use crate::models::{Config, ReconcileReport, RunRequest, RunSummary, SourceRequest};
use crate::pipeline::sync::{SourceJob, SyncOrchestrator};
use crate::services::Adapter;
use crate::storage::ArchiveStore;

/// Build a request covering every configured source.
pub fn request_all(config: &Config, force_full: bool) -> RunRequest {
    RunRequest::new(
        config
            .sources
            .iter()
            .cloned()
            .map(|source| SourceRequest { source, force_full })
            .collect(),
    )
}

/// Synchronize the requested sources.
///
/// Never fails: everything that goes wrong while syncing, including sources
/// the request cannot sync, is reported in the returned summary.
pub async fn run_sync<S: ArchiveStore>(
    config: &Config,
    request: RunRequest,
    credentials: &dyn CredentialProvider,
    store: Arc<S>,
    cancel: CancellationToken,
) -> RunSummary {
    let shadowed = request.shadowed_by();

    let jobs = request
        .sources
        .into_iter()
        .zip(shadowed)
        .map(|(request, shadowed)| match shadowed {
            Some(earlier) => {
                let reason = format!(
                    "another {} source ('{earlier}') is already in this run",
                    request.source.kind
                );
                SourceJob::rejected(request, reason)
            }
            None => {
                let adapter = build_adapter(config, &request, credentials);
                SourceJob::new(request, adapter)
            }
        })
        .collect();

    let orchestrator = SyncOrchestrator::new(store, config, cancel);
    orchestrator.run(jobs).await
}

/// Run the dangling-reference pass on its own.
pub async fn run_reconcile<S: ArchiveStore>(store: &S) -> Result<ReconcileReport> {
    let report = store.reconcile_dangling().await?;
    log::info!(
        "Reconciliation linked {} reference(s), {} still dangling",
        report.linked,
        report.dangling
    );
    Ok(report)
}

fn build_adapter(
    config: &Config,
    request: &SourceRequest,
    credentials: &dyn CredentialProvider,
) -> std::result::Result<Adapter, FetchError> {
    let source = &request.source;
    let secrets = credentials.credentials(&source.credential).ok_or_else(|| {
        FetchError::Auth(format!("unknown credential reference '{}'", source.credential))
    })?;
    Adapter::build(source, &secrets, &config.http, config.sync.page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::Credentials;
    use crate::error::ErrorKind;
    use crate::models::{RunOutcome, Source, SourceKind, SourceState};
    use crate::storage::SqliteStore;

    fn config() -> Config {
        Config {
            sources: vec![
                Source::new(SourceKind::Journal, "lj", "writer", "lj_main"),
                Source::new(SourceKind::Microblog, "tweets", "birder", "twitter"),
            ],
            ..Config::default()
        }
    }

    #[test]
    fn test_request_all_covers_sources() {
        let request = request_all(&config(), true);
        assert_eq!(request.sources.len(), 2);
        assert!(request.sources.iter().all(|r| r.force_full));
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_each_source() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let credentials: HashMap<String, Credentials> = HashMap::new();

        let summary = run_sync(
            &config(),
            request_all(&config(), false),
            &credentials,
            Arc::clone(&store),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(summary.outcome, RunOutcome::Failed);
        for report in &summary.sources {
            assert!(matches!(
                report.state,
                SourceState::Failed { kind: ErrorKind::Auth, .. }
            ));
        }
        assert!(store.latest_run().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_duplicate_kind_fails_inside_summary() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let source = Source::new(SourceKind::Journal, "lj", "writer", "lj_main");
        let request = RunRequest::new(vec![
            SourceRequest { source: source.clone(), force_full: false },
            SourceRequest { source, force_full: true },
        ]);

        let summary = run_sync(
            &Config::default(),
            request,
            &HashMap::<String, Credentials>::new(),
            Arc::clone(&store),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(summary.sources.len(), 2);
        // The first journal source runs (and fails on its missing credential).
        assert!(matches!(
            summary.sources[0].state,
            SourceState::Failed { kind: ErrorKind::Auth, .. }
        ));
        match &summary.sources[1].state {
            SourceState::Failed { kind, reason } => {
                assert_eq!(*kind, ErrorKind::InvalidRequest);
                assert!(reason.contains("'lj'"));
            }
            other => panic!("expected failed source, got {other:?}"),
        }
        assert_eq!(summary.sources[1].error_count(ErrorKind::InvalidRequest), 1);
        assert_eq!(summary.outcome, RunOutcome::Failed);
        assert!(store.latest_run().await.unwrap().is_some());
    }
}

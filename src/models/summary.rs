// src/models/summary.rs

//! Run summary handed back to the caller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::models::{Source, SourceKind};

/// Terminal state of one source in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SourceState {
    /// Every page up to exhaustion was committed
    Done,
    /// Stopped by a permanent or exhausted-retry error
    Failed { kind: ErrorKind, reason: String },
    /// Stopped early (cancelled) with the committed prefix intact
    Partial { reason: String },
}

impl SourceState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Done => "Done",
            Self::Failed { .. } => "Failed",
            Self::Partial { .. } => "Partial",
        }
    }
}

/// An item that was fetched but could not be archived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    /// 1-based page number within this run
    pub page: usize,
    /// 0-based position within the page
    pub position: usize,
    pub reason: String,
}

/// Per-source counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReport {
    pub kind: SourceKind,
    pub name: String,
    pub state: SourceState,
    pub pages_fetched: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Previously dangling children linked by this source's commits
    #[serde(default)]
    pub linked: usize,
    pub in_batch_duplicates: usize,
    pub rate_limit_waits: usize,
    pub skipped: Vec<SkippedItem>,
    pub errors: BTreeMap<ErrorKind, usize>,
    /// Sequence of the last committed cursor
    pub final_sequence: u64,
}

impl SourceReport {
    pub fn new(source: &Source) -> Self {
        Self {
            kind: source.kind,
            name: source.name.clone(),
            state: SourceState::Partial {
                reason: "not started".to_string(),
            },
            pages_fetched: 0,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            linked: 0,
            in_batch_duplicates: 0,
            rate_limit_waits: 0,
            skipped: Vec::new(),
            errors: BTreeMap::new(),
            final_sequence: 0,
        }
    }

    pub fn record_error(&mut self, kind: ErrorKind) {
        *self.errors.entry(kind).or_default() += 1;
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.errors.get(&kind).copied().unwrap_or(0)
    }

    pub fn writes(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Result of the dangling-parent pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// References resolved in this pass
    pub linked: usize,
    /// References still pointing at items not in the store
    pub dangling: usize,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every source is Done
    Complete,
    /// At least one source made progress and at least one did not finish
    Partial,
    /// No source made progress
    Failed,
}

impl RunOutcome {
    pub fn from_reports(reports: &[SourceReport]) -> Self {
        let done = reports
            .iter()
            .filter(|r| r.state == SourceState::Done)
            .count();
        let failed = reports
            .iter()
            .filter(|r| matches!(r.state, SourceState::Failed { .. }))
            .count();

        if done == reports.len() {
            Self::Complete
        } else if failed == reports.len() {
            Self::Failed
        } else {
            Self::Partial
        }
    }
}

/// Everything a run reports back. Produced even when every source failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: RunOutcome,
    pub sources: Vec<SourceReport>,
    pub reconciliation: Option<ReconcileReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_error: Option<String>,
}

impl RunSummary {
    pub fn source(&self, kind: SourceKind) -> Option<&SourceReport> {
        self.sources.iter().find(|r| r.kind == kind)
    }

    pub fn total_writes(&self) -> usize {
        self.sources.iter().map(SourceReport::writes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(kind: SourceKind, state: SourceState) -> SourceReport {
        let source = Source::new(kind, kind.as_str(), "me", "cred");
        SourceReport {
            state,
            ..SourceReport::new(&source)
        }
    }

    fn failed() -> SourceState {
        SourceState::Failed {
            kind: ErrorKind::Auth,
            reason: "401".into(),
        }
    }

    #[test]
    fn test_outcome_complete() {
        let reports = vec![
            report(SourceKind::Journal, SourceState::Done),
            report(SourceKind::Microblog, SourceState::Done),
        ];
        assert_eq!(RunOutcome::from_reports(&reports), RunOutcome::Complete);
    }

    #[test]
    fn test_outcome_partial() {
        let reports = vec![
            report(SourceKind::Journal, SourceState::Done),
            report(SourceKind::Microblog, failed()),
        ];
        assert_eq!(RunOutcome::from_reports(&reports), RunOutcome::Partial);
    }

    #[test]
    fn test_outcome_failed() {
        let reports = vec![
            report(SourceKind::Journal, failed()),
            report(SourceKind::ArtShare, failed()),
        ];
        assert_eq!(RunOutcome::from_reports(&reports), RunOutcome::Failed);
    }

    #[test]
    fn test_record_error_counts() {
        let mut r = report(SourceKind::Journal, SourceState::Done);
        r.record_error(ErrorKind::RateLimited);
        r.record_error(ErrorKind::RateLimited);
        assert_eq!(r.error_count(ErrorKind::RateLimited), 2);
        assert_eq!(r.error_count(ErrorKind::Auth), 0);
    }
}

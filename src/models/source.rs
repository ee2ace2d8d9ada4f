// src/models/source.rs

//! Sources (configured platform accounts) and run requests.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// The fixed set of platforms the archiver knows how to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Journal/blog service (entries with threaded comments)
    Journal,
    /// Microblogging service (statuses and favorites)
    Microblog,
    /// Art-sharing service (gallery deviations)
    ArtShare,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [Self::Journal, Self::Microblog, Self::ArtShare];

    /// Stable identifier used in the store and in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::Microblog => "microblog",
            Self::ArtShare => "art_share",
        }
    }

    /// API root used when a source does not configure one.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Journal => "https://www.livejournal.com",
            Self::Microblog => "https://api.twitter.com",
            Self::ArtShare => "https://www.deviantart.com",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "journal" => Ok(Self::Journal),
            "microblog" => Ok(Self::Microblog),
            "art_share" | "artshare" => Ok(Self::ArtShare),
            other => Err(AppError::validation(format!("unknown source kind '{other}'"))),
        }
    }
}

/// One configured platform account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Platform kind
    pub kind: SourceKind,

    /// Display name used in logs and summaries
    pub name: String,

    /// Account whose content is archived (journal name, screen name, username)
    pub account: String,

    /// Reference resolved by the credential provider
    pub credential: String,

    /// API root override (mostly for testing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Source {
    pub fn new(
        kind: SourceKind,
        name: impl Into<String>,
        account: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            account: account.into(),
            credential: credential.into(),
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// API root, trailing slash stripped.
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
            .trim_end_matches('/')
    }
}

/// A source selected for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    pub source: Source,

    /// Ignore the stored cursor and restart from the beginning of history.
    pub force_full: bool,
}

/// What the caller wants synchronized in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub sources: Vec<SourceRequest>,
}

impl RunRequest {
    pub fn new(sources: Vec<SourceRequest>) -> Self {
        Self { sources }
    }

    /// Cursors are keyed by kind, so only the first source of each kind can
    /// sync in a run. Returns, per request, the name of the earlier source
    /// of the same kind, if any.
    pub fn shadowed_by(&self) -> Vec<Option<String>> {
        let mut first: HashMap<SourceKind, usize> = HashMap::new();
        self.sources
            .iter()
            .enumerate()
            .map(|(index, request)| {
                let earlier = *first.entry(request.source.kind).or_insert(index);
                (earlier != index).then(|| self.sources[earlier].source.name.clone())
            })
            .collect()
    }
}

//! Platform adapters.
//!
//! Each adapter speaks one platform's API and hands back raw items one page
//! at a time:
//! - Journal entries with their comment threads (`JournalAdapter`)
//! - Microblog statuses and favorites (`MicroblogAdapter`)
//! - Art-share gallery deviations (`ArtShareAdapter`)
//!
//! Adapters never persist anything; the cursor they return is committed by
//! the orchestrator together with the page's items.

mod artshare;
mod journal;
mod microblog;

use async_trait::async_trait;

use crate::config::Credentials;
use crate::error::FetchError;
use crate::models::{CursorPosition, HttpConfig, RawItem, Source, SourceKind};
use crate::utils::http::create_async_client;

pub use artshare::ArtShareAdapter;
pub use journal::JournalAdapter;
pub use microblog::MicroblogAdapter;

/// One bounded batch of raw items.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<RawItem>,
    /// Where the next fetch continues from
    pub next_cursor: CursorPosition,
    /// No more pages until the platform has new content
    pub exhausted: bool,
}

/// Fetch contract shared by every platform.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetch the page that starts at `position`.
    ///
    /// Calling this again with any cursor previously returned must be safe.
    async fn fetch_since(&self, position: &CursorPosition) -> Result<Page, FetchError>;
}

/// The closed set of production adapters.
pub enum Adapter {
    Journal(JournalAdapter),
    Microblog(MicroblogAdapter),
    ArtShare(ArtShareAdapter),
}

impl Adapter {
    /// Build the adapter for a source.
    ///
    /// Missing credential fields are an `Auth` failure for that source.
    pub fn build(
        source: &Source,
        credentials: &Credentials,
        http: &HttpConfig,
        page_size: usize,
    ) -> Result<Self, FetchError> {
        credentials.check(source.kind, &source.credential)?;
        let client = create_async_client(http)
            .map_err(|e| FetchError::Protocol(format!("cannot build HTTP client: {e}")))?;

        let adapter = match source.kind {
            SourceKind::Journal => {
                Self::Journal(JournalAdapter::new(client, source, credentials, page_size)?)
            }
            SourceKind::Microblog => {
                Self::Microblog(MicroblogAdapter::new(client, source, credentials, page_size)?)
            }
            SourceKind::ArtShare => {
                Self::ArtShare(ArtShareAdapter::new(client, source, credentials, page_size)?)
            }
        };
        Ok(adapter)
    }
}

#[async_trait]
impl PlatformAdapter for Adapter {
    fn kind(&self) -> SourceKind {
        match self {
            Self::Journal(_) => SourceKind::Journal,
            Self::Microblog(_) => SourceKind::Microblog,
            Self::ArtShare(_) => SourceKind::ArtShare,
        }
    }

    async fn fetch_since(&self, position: &CursorPosition) -> Result<Page, FetchError> {
        match self {
            Self::Journal(adapter) => adapter.fetch_since(position).await,
            Self::Microblog(adapter) => adapter.fetch_since(position).await,
            Self::ArtShare(adapter) => adapter.fetch_since(position).await,
        }
    }
}

//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Source;

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Run scheduling settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Backoff and retry bounds
    #[serde(default)]
    pub retry: RetryConfig,

    /// Persistence settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Configured platform accounts
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Look up a configured source by name or kind.
    pub fn find_source(&self, selector: &str) -> Option<&Source> {
        self.sources.iter().find(|s| {
            s.name.eq_ignore_ascii_case(selector)
                || selector
                    .parse()
                    .map(|kind: crate::models::SourceKind| kind == s.kind)
                    .unwrap_or(false)
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }
        if self.sync.max_concurrent == 0 {
            return Err(AppError::validation("sync.max_concurrent must be > 0"));
        }
        if self.sync.page_size == 0 {
            return Err(AppError::validation("sync.page_size must be > 0"));
        }
        if self.retry.max_transient_attempts == 0 {
            return Err(AppError::validation(
                "retry.max_transient_attempts must be > 0",
            ));
        }
        if self.retry.max_commit_attempts == 0 {
            return Err(AppError::validation("retry.max_commit_attempts must be > 0"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(AppError::validation(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms",
            ));
        }
        if self.store.path.trim().is_empty() {
            return Err(AppError::validation("store.path is empty"));
        }

        let mut kinds = HashSet::new();
        let mut names = HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(AppError::validation("source with empty name"));
            }
            if source.account.trim().is_empty() {
                return Err(AppError::validation(format!(
                    "source '{}' has no account",
                    source.name
                )));
            }
            if !names.insert(source.name.to_lowercase()) {
                return Err(AppError::validation(format!(
                    "duplicate source name '{}'",
                    source.name
                )));
            }
            if !kinds.insert(source.kind) {
                return Err(AppError::validation(format!(
                    "more than one {} source configured",
                    source.kind
                )));
            }
            if let Some(base) = &source.base_url {
                url::Url::parse(base)?;
            }
        }
        Ok(())
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for API requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
        }
    }
}

/// Run scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum sources synced at the same time
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Items requested per page (platforms may cap it lower)
    #[serde(default = "defaults::page_size")]
    pub page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            page_size: defaults::page_size(),
        }
    }
}

/// Backoff and retry bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per page before a transient failure fails the source
    #[serde(default = "defaults::max_transient_attempts")]
    pub max_transient_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "defaults::initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "defaults::max_backoff")]
    pub max_backoff_ms: u64,

    /// Rate-limit wait when the platform gives no hint
    #[serde(default = "defaults::default_rate_limit_wait")]
    pub default_rate_limit_wait_ms: u64,

    /// Ceiling applied to platform rate-limit hints
    #[serde(default = "defaults::max_rate_limit_wait")]
    pub max_rate_limit_wait_ms: u64,

    /// Consecutive commit failures before the source is failed
    #[serde(default = "defaults::max_commit_attempts")]
    pub max_commit_attempts: u32,
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn default_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.default_rate_limit_wait_ms)
    }

    pub fn max_rate_limit_wait(&self) -> Duration {
        Duration::from_millis(self.max_rate_limit_wait_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_attempts: defaults::max_transient_attempts(),
            initial_backoff_ms: defaults::initial_backoff(),
            max_backoff_ms: defaults::max_backoff(),
            default_rate_limit_wait_ms: defaults::default_rate_limit_wait(),
            max_rate_limit_wait_ms: defaults::max_rate_limit_wait(),
            max_commit_attempts: defaults::max_commit_attempts(),
        }
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "defaults::store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: defaults::store_path(),
        }
    }
}

mod defaults {
    // HTTP defaults
    pub fn user_agent() -> String {
        concat!("archiver/", env!("CARGO_PKG_VERSION")).into()
    }
    pub fn timeout() -> u64 {
        30
    }

    // Sync defaults
    pub fn max_concurrent() -> usize {
        3
    }
    pub fn page_size() -> usize {
        50
    }

    // Retry defaults
    pub fn max_transient_attempts() -> u32 {
        5
    }
    pub fn initial_backoff() -> u64 {
        500
    }
    pub fn max_backoff() -> u64 {
        60_000
    }
    pub fn default_rate_limit_wait() -> u64 {
        60_000
    }
    pub fn max_rate_limit_wait() -> u64 {
        15 * 60 * 1000
    }
    pub fn max_commit_attempts() -> u32 {
        3
    }

    // Store defaults
    pub fn store_path() -> String {
        "archive.sqlite3".into()
    }
}

// src/services/microblog.rs

//! Microblog adapter.
//!
//! Archives two feeds in turn: the account's own timeline, then its
//! favorites. Each feed is walked newest-first with `max_id`. Only the
//! timeline is bounded by `since_id`: favorites are ordered by status id,
//! not by when they were favorited, so an old status favorited later would
//! fall below any watermark. The favorites feed is re-walked every pass and
//! statuses already archived resolve to no-ops.

use reqwest::header::HeaderMap;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Page;
use crate::config::Credentials;
use crate::error::FetchError;
use crate::models::{CursorPosition, ItemKind, RawItem, Source};
use crate::utils::http::{classify_status, retry_after, until_epoch};

/// Error code the platform uses for "rate limit exceeded".
const RATE_LIMIT_CODE: i64 = 88;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Feed {
    #[default]
    Timeline,
    Favorites,
}

impl Feed {
    fn path(&self) -> &'static str {
        match self {
            Self::Timeline => "/1.1/statuses/user_timeline.json",
            Self::Favorites => "/1.1/favorites/list.json",
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Timeline => "timeline",
            Self::Favorites => "favorites",
        }
    }
}

/// Microblog cursor token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MicroblogCursor {
    #[serde(default)]
    feed: Feed,
    /// Upper bound (inclusive) for the next page of the current pass
    #[serde(default)]
    max_id: Option<u64>,
    /// Highest timeline id archived by earlier complete passes
    #[serde(default)]
    since_id: Option<u64>,
    /// Highest timeline id seen so far in the current pass
    #[serde(default)]
    pass_high: Option<u64>,
}

/// Adapter for the microblog platform.
pub struct MicroblogAdapter {
    client: Client,
    base_url: String,
    screen_name: String,
    token: String,
    page_size: usize,
}

impl MicroblogAdapter {
    pub fn new(
        client: Client,
        source: &Source,
        credentials: &Credentials,
        page_size: usize,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            base_url: source.base_url().to_string(),
            screen_name: source.account.clone(),
            token: credentials.require(&source.credential, "token")?.to_string(),
            // The platform caps timeline pages at 200 statuses.
            page_size: page_size.clamp(1, 200),
        })
    }

    pub async fn fetch_since(&self, position: &CursorPosition) -> Result<Page, FetchError> {
        let mut cursor: MicroblogCursor = position.decode()?;
        let feed = cursor.feed;

        let mut query = vec![
            ("screen_name", self.screen_name.clone()),
            ("count", self.page_size.to_string()),
            ("tweet_mode", "extended".to_string()),
        ];
        if feed == Feed::Timeline {
            query.push(("include_rts", "true".to_string()));
            if let Some(since_id) = cursor.since_id {
                query.push(("since_id", since_id.to_string()));
            }
        }
        if let Some(max_id) = cursor.max_id {
            query.push(("max_id", max_id.to_string()));
        }

        let response = self
            .client
            .get(format!("{}{}", self.base_url, feed.path()))
            .bearer_auth(&self.token)
            .query(&query)
            .send()
            .await?;
        let response = check_rate_limited(response).await?;
        let statuses: Vec<Value> = response
            .json()
            .await
            .map_err(|e| FetchError::protocol(format!("{} feed: {e}", feed.as_str())))?;

        log::debug!(
            "microblog: {} {} statuses (max_id {:?})",
            statuses.len(),
            feed.as_str(),
            cursor.max_id
        );

        if statuses.is_empty() {
            cursor.max_id = None;
            let exhausted = match feed {
                Feed::Timeline => {
                    // Timeline complete: remember how far this pass got.
                    cursor.since_id = cursor.since_id.max(cursor.pass_high);
                    cursor.pass_high = None;
                    cursor.feed = Feed::Favorites;
                    false
                }
                Feed::Favorites => {
                    cursor.feed = Feed::Timeline;
                    true
                }
            };
            return Ok(Page {
                items: Vec::new(),
                next_cursor: CursorPosition::encode(&cursor)?,
                exhausted,
            });
        }

        let ids: Vec<u64> = statuses.iter().filter_map(status_id).collect();
        let (Some(&low), Some(&high)) = (ids.iter().min(), ids.iter().max()) else {
            return Err(FetchError::protocol(format!(
                "{} page has no usable status ids",
                feed.as_str()
            )));
        };
        if cursor.max_id.is_some_and(|max| low > max) {
            return Err(FetchError::protocol(format!(
                "{} page did not move below max_id",
                feed.as_str()
            )));
        }

        cursor.max_id = low.checked_sub(1);
        if feed == Feed::Timeline {
            cursor.pass_high = cursor.pass_high.max(Some(high));
        }

        let items = statuses
            .into_iter()
            .map(|status| RawItem::new(ItemKind::Status, status).with_context("feed", feed.as_str()))
            .collect();

        Ok(Page {
            items,
            next_cursor: CursorPosition::encode(&cursor)?,
            exhausted: false,
        })
    }
}

fn status_id(status: &Value) -> Option<u64> {
    status
        .get("id_str")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .or_else(|| status.get("id").and_then(Value::as_u64))
}

/// Like `check_response`, but also recognizes the platform's rate-limit
/// error body, which is not always sent with a 429.
async fn check_rate_limited(response: Response) -> Result<Response, FetchError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let hint = reset_hint(response.headers());
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::TOO_MANY_REQUESTS || has_error_code(&body, RATE_LIMIT_CODE) {
        return Err(FetchError::RateLimited { retry_after: hint });
    }
    Err(classify_status(status, hint, &body))
}

fn reset_hint(headers: &HeaderMap) -> Option<std::time::Duration> {
    let now = chrono::Utc::now();
    headers
        .get("x-rate-limit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|epoch| until_epoch(epoch, now))
        .or_else(|| retry_after(headers, now))
}

fn has_error_code(body: &str, code: i64) -> bool {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("errors").and_then(Value::as_array).cloned())
        .is_some_and(|errors| {
            errors
                .iter()
                .any(|e| e.get("code").and_then(Value::as_i64) == Some(code))
        })
}

// src/services/artshare.rs

//! Art-share adapter.
//!
//! Pages through a user's gallery newest-first by offset. A complete pass
//! records the newest publish time it saw; the next pass stops as soon as it
//! reaches items at or before that time. Edits to older deviations do not
//! change their publish time, so every `FULL_REWALK_EVERY` passes the
//! watermark is dropped and the whole gallery is read again.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use super::Page;
use crate::config::Credentials;
use crate::error::FetchError;
use crate::models::{CursorPosition, ItemKind, RawItem, Source};
use crate::utils::http::check_response;

/// Early-stopping passes between two full gallery walks.
const FULL_REWALK_EVERY: u32 = 8;

/// Art-share cursor token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct GalleryCursor {
    #[serde(default)]
    offset: u64,
    /// Newest publish time of the last complete pass
    #[serde(default)]
    stop_at: Option<i64>,
    /// Newest publish time seen in the current pass
    #[serde(default)]
    pass_high: Option<i64>,
    /// Early-stopping passes completed since the last full walk
    #[serde(default)]
    incremental_passes: u32,
}

impl GalleryCursor {
    /// Cursor for the pass after this one completes.
    fn rewind(&self, pass_high: Option<i64>) -> Self {
        let passes = match self.stop_at {
            Some(_) => self.incremental_passes + 1,
            None => 0,
        };
        if passes >= FULL_REWALK_EVERY {
            return Self::default();
        }
        Self {
            offset: 0,
            stop_at: self.stop_at.max(pass_high),
            pass_high: None,
            incremental_passes: passes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GalleryResponse {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_offset: Option<u64>,
}

/// Adapter for the art-share platform.
pub struct ArtShareAdapter {
    client: Client,
    base_url: String,
    username: String,
    client_id: String,
    client_secret: String,
    page_size: usize,
    token: RwLock<Option<String>>,
}

impl ArtShareAdapter {
    pub fn new(
        client: Client,
        source: &Source,
        credentials: &Credentials,
        page_size: usize,
    ) -> Result<Self, FetchError> {
        Ok(Self {
            client,
            base_url: source.base_url().to_string(),
            username: source.account.clone(),
            client_id: credentials.require(&source.credential, "client_id")?.to_string(),
            client_secret: credentials
                .require(&source.credential, "client_secret")?
                .to_string(),
            // Gallery pages hold at most 24 deviations.
            page_size: page_size.clamp(1, 24),
            token: RwLock::new(None),
        })
    }

    pub async fn fetch_since(&self, position: &CursorPosition) -> Result<Page, FetchError> {
        let cursor: GalleryCursor = position.decode()?;
        let body = self.gallery_page(cursor.offset).await?;

        log::debug!(
            "art share: {} deviations at offset {} (has_more {})",
            body.results.len(),
            cursor.offset,
            body.has_more
        );

        let mut pass_high = cursor.pass_high;
        let mut reached_known = false;
        let mut items = Vec::with_capacity(body.results.len());
        let fetched = body.results.len() as u64;

        for deviation in body.results {
            let published = published_time(&deviation);
            if let (Some(stop_at), Some(published)) = (cursor.stop_at, published) {
                if published <= stop_at {
                    reached_known = true;
                    break;
                }
            }
            pass_high = pass_high.max(published);
            items.push(RawItem::new(ItemKind::Artwork, deviation));
        }

        let exhausted = reached_known || !body.has_more;
        let next = if exhausted {
            cursor.rewind(pass_high)
        } else {
            let offset = body.next_offset.unwrap_or(cursor.offset + fetched);
            if offset <= cursor.offset {
                return Err(FetchError::protocol(format!(
                    "gallery next_offset {offset} does not advance past {}",
                    cursor.offset
                )));
            }
            GalleryCursor {
                offset,
                pass_high,
                ..cursor
            }
        };

        Ok(Page {
            items,
            next_cursor: CursorPosition::encode(&next)?,
            exhausted,
        })
    }

    /// Fetch one gallery page, refreshing the access token once if the
    /// cached one is rejected.
    async fn gallery_page(&self, offset: u64) -> Result<GalleryResponse, FetchError> {
        let current = self.token.read().await.clone();
        let (token, cached) = match current {
            Some(token) => (token, true),
            None => (self.refresh_token().await?, false),
        };

        let mut response = self.send_gallery(&token, offset).await?;
        if response.status() == StatusCode::UNAUTHORIZED && cached {
            log::debug!("art share: access token rejected, refreshing");
            let token = self.refresh_token().await?;
            response = self.send_gallery(&token, offset).await?;
        }

        check_response(response)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::protocol(format!("gallery page: {e}")))
    }

    async fn send_gallery(&self, token: &str, offset: u64) -> Result<reqwest::Response, FetchError> {
        Ok(self
            .client
            .get(format!("{}/api/v1/oauth2/gallery/all", self.base_url))
            .bearer_auth(token)
            .query(&[
                ("username", self.username.clone()),
                ("offset", offset.to_string()),
                ("limit", self.page_size.to_string()),
                ("mature_content", "true".to_string()),
            ])
            .send()
            .await?)
    }

    /// Exchange client credentials for a fresh access token and cache it.
    async fn refresh_token(&self) -> Result<String, FetchError> {
        let response = self
            .client
            .post(format!("{}/oauth2/token", self.base_url))
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        // A rejected client is an auth failure whatever status the token
        // endpoint chose for it.
        let response = match check_response(response).await {
            Ok(response) => response,
            Err(FetchError::Protocol(detail)) if detail.starts_with("HTTP 400") => {
                return Err(FetchError::Auth(format!("token request rejected: {detail}")));
            }
            Err(e) => return Err(e),
        };

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| FetchError::protocol(format!("token response: {e}")))?;

        *self.token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

fn published_time(deviation: &Value) -> Option<i64> {
    match deviation.get("published_time")? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

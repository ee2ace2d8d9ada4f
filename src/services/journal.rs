// src/services/journal.rs

//! Journal adapter.
//!
//! A pass has two phases. Entries are walked in ascending `logtime` order
//! using a `lastsync` watermark; each entry carries its comment threads,
//! which are flattened into separate comment items. Comments left later on
//! older entries do not move `logtime`, so the pass then walks the account's
//! comment feed from a `dtalkid` watermark.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Page;
use crate::config::Credentials;
use crate::error::FetchError;
use crate::models::{CursorPosition, ItemKind, RawItem, Source};
use crate::utils::http::check_response;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    #[default]
    Entries,
    Comments,
}

/// Journal cursor token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct JournalCursor {
    /// Highest `logtime` already fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lastsync: Option<String>,
    /// Highest `dtalkid` read from the comment feed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment_id: Option<u64>,
    #[serde(default)]
    phase: Phase,
}

#[derive(Debug, Deserialize)]
struct EntriesResponse {
    #[serde(default)]
    entries: Vec<Value>,
    count: Option<usize>,
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<Value>,
    maxid: Option<u64>,
}

/// Adapter for the journal platform.
pub struct JournalAdapter {
    client: Client,
    entries_endpoint: String,
    comments_endpoint: String,
    username: String,
    password: String,
    page_size: usize,
}

impl JournalAdapter {
    pub fn new(
        client: Client,
        source: &Source,
        credentials: &Credentials,
        page_size: usize,
    ) -> Result<Self, FetchError> {
        let account = format!("{}/api/v1/journals/{}", source.base_url(), source.account);
        Ok(Self {
            client,
            entries_endpoint: format!("{account}/entries"),
            comments_endpoint: format!("{account}/comments"),
            username: credentials.require(&source.credential, "username")?.to_string(),
            password: credentials.require(&source.credential, "password")?.to_string(),
            page_size,
        })
    }

    pub async fn fetch_since(&self, position: &CursorPosition) -> Result<Page, FetchError> {
        let cursor: JournalCursor = position.decode()?;
        match cursor.phase {
            Phase::Entries => self.fetch_entries(cursor).await,
            Phase::Comments => self.fetch_comments(cursor).await,
        }
    }

    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, FetchError> {
        let request = self
            .client
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("limit", self.page_size.to_string())])
            .query(query);
        check_response(request.send().await?).await
    }

    async fn fetch_entries(&self, cursor: JournalCursor) -> Result<Page, FetchError> {
        let query: Vec<(&str, String)> = cursor
            .lastsync
            .iter()
            .map(|lastsync| ("lastsync", lastsync.clone()))
            .collect();
        let body: EntriesResponse = self
            .get(&self.entries_endpoint, &query)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::protocol(format!("journal entries: {e}")))?;

        log::debug!(
            "journal: {} entries ({:?} of {:?} since {:?})",
            body.entries.len(),
            body.count,
            body.total,
            cursor.lastsync
        );

        if body.entries.is_empty() {
            return comments_next(cursor);
        }

        let mut lastsync = cursor.lastsync.clone();
        let mut items = Vec::new();
        for entry in body.entries {
            if let Some(logtime) = entry.get("logtime").and_then(Value::as_str) {
                if lastsync.as_deref().is_none_or(|seen| logtime > seen) {
                    lastsync = Some(logtime.to_string());
                }
            }
            flatten_entry(entry, &mut items);
        }
        // Without both counters the walk only ends on an empty page.
        let last_page =
            matches!((body.count, body.total), (Some(count), Some(total)) if count >= total);
        if !last_page && lastsync == cursor.lastsync {
            return Err(FetchError::protocol(
                "journal page did not advance the lastsync watermark",
            ));
        }

        let next = JournalCursor { lastsync, ..cursor };
        if last_page {
            return Ok(Page {
                items,
                ..comments_next(next)?
            });
        }

        Ok(Page {
            items,
            next_cursor: CursorPosition::encode(&next)?,
            exhausted: false,
        })
    }

    async fn fetch_comments(&self, cursor: JournalCursor) -> Result<Page, FetchError> {
        let startid = cursor.comment_id.map_or(0, |id| id + 1);
        let body: CommentsResponse = self
            .get(&self.comments_endpoint, &[("startid", startid.to_string())])
            .await?
            .json()
            .await
            .map_err(|e| FetchError::protocol(format!("journal comments: {e}")))?;

        log::debug!(
            "journal: {} comments from {startid} (max {:?})",
            body.comments.len(),
            body.maxid
        );

        if body.comments.is_empty() {
            return Ok(Page {
                items: Vec::new(),
                next_cursor: CursorPosition::encode(&JournalCursor {
                    phase: Phase::Entries,
                    ..cursor
                })?,
                exhausted: true,
            });
        }

        let mut comment_id = cursor.comment_id;
        let mut items = Vec::with_capacity(body.comments.len());
        for comment in body.comments {
            let id = comment.get("dtalkid").and_then(Value::as_u64);
            if id > comment_id {
                comment_id = id;
            }
            items.push(feed_comment(comment));
        }
        if comment_id == cursor.comment_id {
            return Err(FetchError::protocol(
                "journal comment page did not advance the dtalkid watermark",
            ));
        }

        let exhausted =
            matches!((comment_id, body.maxid), (Some(seen), Some(max)) if seen >= max);
        let phase = if exhausted { Phase::Entries } else { Phase::Comments };
        Ok(Page {
            items,
            next_cursor: CursorPosition::encode(&JournalCursor {
                comment_id,
                phase,
                ..cursor
            })?,
            exhausted,
        })
    }
}

/// Entries are done; continue the pass on the comment feed.
fn comments_next(cursor: JournalCursor) -> Result<Page, FetchError> {
    Ok(Page {
        items: Vec::new(),
        next_cursor: CursorPosition::encode(&JournalCursor {
            phase: Phase::Comments,
            ..cursor
        })?,
        exhausted: false,
    })
}

/// A comment from the feed names its entry in `jitemid`; it is moved to the
/// context so the item matches the same comment read from its entry.
fn feed_comment(mut comment: Value) -> RawItem {
    let entry_id = comment
        .as_object_mut()
        .and_then(|obj| obj.remove("jitemid"))
        .as_ref()
        .and_then(scalar);
    let raw = RawItem::new(ItemKind::Comment, comment);
    match entry_id {
        Some(id) => raw.with_context("entry_id", id),
        None => raw,
    }
}

/// Split an entry into one entry item followed by its comments in thread
/// order.
fn flatten_entry(mut entry: Value, items: &mut Vec<RawItem>) {
    let comments = entry
        .as_object_mut()
        .and_then(|obj| obj.remove("comments"))
        .and_then(|c| match c {
            Value::Array(list) => Some(list),
            _ => None,
        })
        .unwrap_or_default();

    let entry_id = entry.get("itemid").and_then(scalar);
    items.push(RawItem::new(ItemKind::Entry, entry));

    for comment in comments {
        flatten_comment(comment, None, entry_id.as_deref(), items);
    }
}

fn flatten_comment(
    mut comment: Value,
    parent: Option<&Value>,
    entry_id: Option<&str>,
    items: &mut Vec<RawItem>,
) {
    let children = match comment.as_object_mut() {
        Some(obj) => {
            if let Some(parent) = parent {
                obj.entry("parentdtalkid").or_insert_with(|| parent.clone());
            }
            match obj.remove("children") {
                Some(Value::Array(list)) => list,
                _ => Vec::new(),
            }
        }
        None => Vec::new(),
    };

    let dtalkid = comment.get("dtalkid").cloned();
    let mut raw = RawItem::new(ItemKind::Comment, comment);
    if let Some(id) = entry_id {
        raw = raw.with_context("entry_id", id);
    }
    items.push(raw);

    for child in children {
        flatten_comment(child, dtalkid.as_ref(), entry_id, items);
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

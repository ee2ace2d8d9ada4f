// src/models/item.rs

//! Raw and canonical content items.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::SourceKind;

/// Source-specific fields that were not promoted to canonical attributes.
pub type Extras = BTreeMap<String, Value>;

/// What kind of archived unit an item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Journal post
    Entry,
    /// Reply to an entry or to another comment
    Comment,
    /// Microblog post
    Status,
    /// Art-share gallery item
    Artwork,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Comment => "comment",
            Self::Status => "status",
            Self::Artwork => "artwork",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "comment" => Some(Self::Comment),
            "status" => Some(Self::Status),
            "artwork" => Some(Self::Artwork),
            _ => None,
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An item exactly as a platform returned it.
///
/// `payload` is the platform's own JSON object. `context` carries what the
/// adapter knows from the surrounding response but the object itself does not
/// (e.g. the entry a nested comment belongs to, or the feed it came from).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    pub record: ItemKind,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,
}

impl RawItem {
    pub fn new(record: ItemKind, payload: Value) -> Self {
        Self {
            record,
            payload,
            context: Map::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyFormat {
    Plain,
    Html,
}

/// A reference to media hosted by the platform. The media itself is not
/// downloaded by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,

    /// Platform media type ("image", "video", "animated_gif", ...)
    pub media_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl MediaRef {
    pub fn image(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            media_type: "image".to_string(),
            width: None,
            height: None,
        }
    }
}

/// Text and/or media that make up an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Body {
    pub format: BodyFormat,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
}

impl Body {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            format: BodyFormat::Plain,
            text: text.into(),
            media: Vec::new(),
        }
    }
}

/// Canonical archived unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub source_kind: SourceKind,

    /// Platform identifier; unique per source kind
    pub source_native_id: String,

    pub item_kind: ItemKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Source-reported creation time
    pub created_at: Option<DateTime<Utc>>,

    /// Source-reported modification time
    pub updated_at: Option<DateTime<Utc>>,

    pub author: Option<String>,

    pub body: Body,

    /// Native id of the item this one replies to (same source kind)
    pub parent_native_id: Option<String>,

    pub extras: Extras,

    /// Digest of the normalized fields, used for change detection
    pub content_hash: String,
}

/// A content item as persisted: canonical fields plus local identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    /// Local surrogate id
    pub id: i64,

    /// Local time of first capture; never changes
    pub archived_at: DateTime<Utc>,

    /// Local id of the parent once it has been resolved
    pub parent_id: Option<i64>,

    pub item: ContentItem,
}

impl StoredItem {
    /// A parent reference that has not been resolved to a local row.
    pub fn is_dangling(&self) -> bool {
        self.item.parent_native_id.is_some() && self.parent_id.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_kind_parse() {
        for kind in [ItemKind::Entry, ItemKind::Comment, ItemKind::Status, ItemKind::Artwork] {
            assert_eq!(ItemKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ItemKind::parse("photo"), None);
    }

    #[test]
    fn test_raw_item_context() {
        let raw = RawItem::new(ItemKind::Comment, serde_json::json!({"dtalkid": 7}))
            .with_context("entry_id", "42");
        assert_eq!(raw.context_str("entry_id"), Some("42"));
        assert_eq!(raw.context_str("feed"), None);
    }
}

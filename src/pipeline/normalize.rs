//! Mapping of platform items into the canonical content model.
//!
//! Normalization is pure: the same raw item always produces the same
//! `ContentItem`, including its `content_hash`. Fields that are not promoted
//! to canonical attributes land in `extras` untouched.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::NormalizationError;
use crate::models::{
    Body, BodyFormat, ContentItem, Extras, ItemKind, MediaRef, RawItem, SourceKind,
};
use crate::utils;

/// Extras keys that change without the content changing. They are archived
/// but do not take part in change detection.
fn volatile_keys(kind: SourceKind) -> &'static [&'static str] {
    match kind {
        SourceKind::Journal => &["reply_count", "comment_alter"],
        SourceKind::Microblog => &[
            "favorite_count",
            "retweet_count",
            "favorited",
            "retweeted",
            "user",
        ],
        SourceKind::ArtShare => &["stats", "thumbs", "preview", "author", "is_favourited"],
    }
}

/// Map a raw platform item into a `ContentItem`.
pub fn normalize(raw: &RawItem, kind: SourceKind) -> Result<ContentItem, NormalizationError> {
    let Value::Object(payload) = &raw.payload else {
        return Err(NormalizationError::NotAnObject { kind });
    };
    let fields = Fields::new(kind, payload.clone());

    let mut item = match (kind, raw.record) {
        (SourceKind::Journal, ItemKind::Entry) => journal_entry(fields)?,
        (SourceKind::Journal, ItemKind::Comment) => journal_comment(fields, raw)?,
        (SourceKind::Microblog, ItemKind::Status) => microblog_status(fields, raw)?,
        (SourceKind::ArtShare, ItemKind::Artwork) => artwork(fields)?,
        (_, record) => {
            return Err(NormalizationError::InvalidField {
                kind,
                field: "record",
                reason: format!("{record} items are not produced by {kind} sources"),
            });
        }
    };

    item.content_hash = content_hash(&item);
    Ok(item)
}

/// SHA-256 over a canonical serialization of the normalized fields.
///
/// Excludes local identity, `archived_at` and volatile extras.
pub fn content_hash(item: &ContentItem) -> String {
    #[derive(Serialize)]
    struct Canonical<'a> {
        source_kind: SourceKind,
        source_native_id: &'a str,
        item_kind: ItemKind,
        title: &'a Option<String>,
        created_at: &'a Option<DateTime<Utc>>,
        updated_at: &'a Option<DateTime<Utc>>,
        author: &'a Option<String>,
        body: &'a Body,
        parent_native_id: &'a Option<String>,
        extras: Extras,
    }

    let volatile = volatile_keys(item.source_kind);
    let canonical = Canonical {
        source_kind: item.source_kind,
        source_native_id: &item.source_native_id,
        item_kind: item.item_kind,
        title: &item.title,
        created_at: &item.created_at,
        updated_at: &item.updated_at,
        author: &item.author,
        body: &item.body,
        parent_native_id: &item.parent_native_id,
        extras: item
            .extras
            .iter()
            .filter(|(key, _)| !volatile.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };

    // Serializing plain structs, strings and sorted maps cannot fail.
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

fn journal_entry(mut fields: Fields) -> Result<ContentItem, NormalizationError> {
    let native_id = fields.native_id("itemid")?;
    let html = fields.take_string("event").unwrap_or_default();
    let base = fields.peek_str("url").map(str::to_string);

    Ok(ContentItem {
        source_kind: SourceKind::Journal,
        item_kind: ItemKind::Entry,
        title: fields.take_string("subject"),
        created_at: fields.take_time("eventtime", parse_journal_time),
        updated_at: fields.take_time("logtime", parse_journal_time),
        author: fields.take_string("poster"),
        body: Body {
            format: BodyFormat::Html,
            media: html_images(&html, base.as_deref()),
            text: html,
        },
        parent_native_id: None,
        extras: fields.into_extras(),
        content_hash: String::new(),
        source_native_id: native_id,
    })
}

fn journal_comment(mut fields: Fields, raw: &RawItem) -> Result<ContentItem, NormalizationError> {
    let dtalkid = fields.native_id("dtalkid")?;

    let parent = match fields.take("parentdtalkid") {
        Some(value) => match scalar_string(&value) {
            Some(id) if id != "0" => Some(format!("c{id}")),
            _ => None,
        },
        None => None,
    };
    let parent = parent.or_else(|| raw.context_str("entry_id").map(str::to_string));
    if parent.is_none() {
        return Err(NormalizationError::InvalidField {
            kind: SourceKind::Journal,
            field: "parentdtalkid",
            reason: "comment has neither a parent comment nor an entry".to_string(),
        });
    }

    let text = fields.take_string("body").unwrap_or_default();
    let created_at = fields.take_time("datepost", parse_journal_time);
    let mut extras = fields.into_extras();

    Ok(ContentItem {
        source_kind: SourceKind::Journal,
        source_native_id: format!("c{dtalkid}"),
        item_kind: ItemKind::Comment,
        title: extras
            .remove("subject")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|s| !s.is_empty()),
        created_at,
        updated_at: created_at,
        author: extras
            .remove("postername")
            .and_then(|v| v.as_str().map(str::to_string)),
        body: Body {
            format: BodyFormat::Html,
            media: html_images(&text, None),
            text,
        },
        parent_native_id: parent,
        extras,
        content_hash: String::new(),
    })
}

fn microblog_status(mut fields: Fields, raw: &RawItem) -> Result<ContentItem, NormalizationError> {
    let native_id = match fields.take_string("id_str") {
        Some(id) if !id.is_empty() => {
            fields.take("id");
            id
        }
        _ => fields.native_id("id")?,
    };

    let text = fields
        .take_string("full_text")
        .or_else(|| fields.take_string("text"))
        .unwrap_or_default();

    let entities = fields.take("entities");
    let extended = fields.take("extended_entities");
    // extended_entities carries every attached photo, entities only the first.
    let media = status_media(extended.as_ref().or(entities.as_ref()));
    let hashtags = status_hashtags(entities.as_ref(), &text);

    let author = fields
        .peek("user")
        .and_then(|user| user.get("screen_name"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let parent = fields
        .take_string("in_reply_to_status_id_str")
        .or_else(|| fields.peek("in_reply_to_status_id").and_then(scalar_string));
    fields.take("in_reply_to_status_id");

    let created_at = fields.take_time("created_at", parse_microblog_time);

    let mut extras = fields.into_extras();
    if !hashtags.is_empty() {
        extras.insert(
            "hashtags".to_string(),
            Value::Array(hashtags.into_iter().map(Value::String).collect()),
        );
    }
    // Membership is merged with the archived set when resolving.
    if let Some(feed) = raw.context_str("feed") {
        extras.insert(
            "feeds".to_string(),
            Value::Array(vec![Value::String(feed.to_string())]),
        );
    }

    Ok(ContentItem {
        source_kind: SourceKind::Microblog,
        source_native_id: native_id,
        item_kind: ItemKind::Status,
        title: None,
        created_at,
        updated_at: created_at,
        author,
        body: Body {
            format: BodyFormat::Plain,
            text,
            media,
        },
        parent_native_id: parent,
        extras,
        content_hash: String::new(),
    })
}

fn artwork(mut fields: Fields) -> Result<ContentItem, NormalizationError> {
    let native_id = fields.native_id("deviationid")?;

    let author = fields
        .peek("author")
        .and_then(|author| author.get("username"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let media = fields
        .take("content")
        .and_then(|content| {
            let src = content.get("src")?.as_str()?.to_string();
            Some(MediaRef {
                url: src,
                media_type: "image".to_string(),
                width: content.get("width").and_then(as_u32),
                height: content.get("height").and_then(as_u32),
            })
        })
        .into_iter()
        .collect();

    let created_at = fields.take_time("published_time", parse_epoch_time);

    Ok(ContentItem {
        source_kind: SourceKind::ArtShare,
        source_native_id: native_id,
        item_kind: ItemKind::Artwork,
        title: fields.take_string("title"),
        created_at,
        updated_at: created_at,
        author,
        body: Body {
            format: BodyFormat::Plain,
            text: fields.take_string("excerpt").unwrap_or_default(),
            media,
        },
        parent_native_id: None,
        extras: fields.into_extras(),
        content_hash: String::new(),
    })
}

/// A payload object being taken apart. Whatever is not taken becomes extras.
struct Fields {
    kind: SourceKind,
    map: Map<String, Value>,
}

impl Fields {
    fn new(kind: SourceKind, map: Map<String, Value>) -> Self {
        Self { kind, map }
    }

    fn take(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key)
    }

    fn peek(&self, key: &str) -> Option<&Value> {
        self.map.get(key)
    }

    fn peek_str(&self, key: &str) -> Option<&str> {
        self.map.get(key).and_then(Value::as_str)
    }

    /// Remove a string field; non-string values are left for extras.
    fn take_string(&mut self, key: &str) -> Option<String> {
        match self.map.get(key) {
            Some(Value::String(_)) => match self.map.remove(key) {
                Some(Value::String(s)) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    /// Remove the natural key, accepting strings and integers.
    fn native_id(&mut self, key: &'static str) -> Result<String, NormalizationError> {
        let id = self
            .map
            .get(key)
            .and_then(scalar_string)
            .filter(|id| !id.is_empty())
            .ok_or(NormalizationError::MissingNativeId {
                kind: self.kind,
                field: key,
            })?;
        self.map.remove(key);
        Ok(id)
    }

    /// Remove a timestamp field only when it parses; otherwise the raw
    /// value stays in extras.
    fn take_time(
        &mut self,
        key: &str,
        parse: fn(&Value) -> Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        let parsed = self.map.get(key).and_then(parse)?;
        self.map.remove(key);
        Some(parsed)
    }

    fn into_extras(self) -> Extras {
        self.map.into_iter().collect()
    }
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

fn parse_journal_time(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_microblog_time(value: &Value) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(value.as_str()?, "%a %b %d %H:%M:%S %z %Y")
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn parse_epoch_time(value: &Value) -> Option<DateTime<Utc>> {
    let secs = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    DateTime::from_timestamp(secs, 0)
}

/// `<img src>` references inside an HTML body.
fn html_images(html: &str, base: Option<&str>) -> Vec<MediaRef> {
    if html.is_empty() {
        return Vec::new();
    }
    let Ok(selector) = Selector::parse("img[src]") else {
        return Vec::new();
    };

    let document = Html::parse_fragment(html);
    document
        .select(&selector)
        .filter_map(|img| img.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .map(|src| MediaRef::image(utils::resolve(base, src)))
        .collect()
}

fn status_media(entities: Option<&Value>) -> Vec<MediaRef> {
    let Some(media) = entities
        .and_then(|e| e.get("media"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    media
        .iter()
        .filter_map(|m| {
            let url = m
                .get("media_url_https")
                .or_else(|| m.get("media_url"))?
                .as_str()?;
            let large = m.get("sizes").and_then(|s| s.get("large"));
            Some(MediaRef {
                url: url.to_string(),
                media_type: m
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("photo")
                    .to_string(),
                width: large.and_then(|l| l.get("w")).and_then(as_u32),
                height: large.and_then(|l| l.get("h")).and_then(as_u32),
            })
        })
        .collect()
}

/// Hashtags from the entity list, falling back to scanning the text when the
/// platform sent no entities.
fn status_hashtags(entities: Option<&Value>, text: &str) -> Vec<String> {
    if let Some(tags) = entities
        .and_then(|e| e.get("hashtags"))
        .and_then(Value::as_array)
    {
        return tags
            .iter()
            .filter_map(|tag| tag.get("text").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
    }

    let Ok(pattern) = Regex::new(r"(?:^|[^\w&])#(\w+)") else {
        return Vec::new();
    };
    pattern
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .collect()
}

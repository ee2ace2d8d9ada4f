//! Dedup/merge resolution.
//!
//! Decides, per normalized candidate, whether the store must insert it,
//! update an existing row, or leave it alone. Matching is on the natural key
//! `(source_kind, source_native_id)` only.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::{ContentItem, StoredItem};
use crate::pipeline::normalize::content_hash;

/// Extras that accumulate across fetches instead of being replaced: the
/// stored and the fetched values are merged as a sorted set of strings.
const MEMBERSHIP_KEYS: &[&str] = &["feeds"];

/// Write decision for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Not archived yet
    Insert(ContentItem),
    /// Archived with a different hash; local identity is carried over
    Update {
        id: i64,
        archived_at: DateTime<Utc>,
        item: ContentItem,
    },
    /// Archived with the same hash
    NoOp { id: i64 },
}

/// Resolve a single candidate against what the store holds for its key.
pub fn resolve(mut candidate: ContentItem, existing: Option<&StoredItem>) -> Action {
    let Some(stored) = existing else {
        return Action::Insert(candidate);
    };

    if merge_memberships(&mut candidate, &stored.item) {
        candidate.content_hash = content_hash(&candidate);
    }

    if stored.item.content_hash == candidate.content_hash {
        Action::NoOp { id: stored.id }
    } else {
        Action::Update {
            id: stored.id,
            archived_at: stored.archived_at,
            item: candidate,
        }
    }
}

/// Carry memberships recorded on the stored row over to the candidate.
/// Returns whether the candidate changed.
fn merge_memberships(candidate: &mut ContentItem, stored: &ContentItem) -> bool {
    let mut changed = false;
    for &key in MEMBERSHIP_KEYS {
        let Some(Value::Array(previous)) = stored.extras.get(key) else {
            continue;
        };

        let mut members: BTreeSet<String> = match candidate.extras.get(key) {
            Some(Value::Array(current)) => current
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => BTreeSet::new(),
        };
        let before = members.len();
        members.extend(previous.iter().filter_map(Value::as_str).map(str::to_string));
        if members.len() != before {
            candidate.extras.insert(
                key.to_string(),
                Value::Array(members.into_iter().map(Value::String).collect()),
            );
            changed = true;
        }
    }
    changed
}

/// Collapse repeated native ids within one page.
///
/// The later-seen item wins and takes the position of its last occurrence.
/// Returns the surviving items and the number of collapsed duplicates.
pub fn dedupe_batch(items: Vec<ContentItem>) -> (Vec<ContentItem>, usize) {
    let total = items.len();
    let mut seen = HashSet::new();
    let mut kept: Vec<ContentItem> = items
        .into_iter()
        .rev()
        .filter(|item| seen.insert(item.source_native_id.clone()))
        .collect();
    kept.reverse();
    let duplicates = total - kept.len();
    (kept, duplicates)
}

/// Resolve a deduplicated page against the stored rows keyed by native id.
pub fn resolve_batch(
    items: Vec<ContentItem>,
    existing: &HashMap<String, StoredItem>,
) -> Vec<Action> {
    items
        .into_iter()
        .map(|item| {
            let current = existing.get(&item.source_native_id);
            resolve(item, current)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Body, Extras, ItemKind, RawItem, SourceKind};
    use crate::pipeline::normalize::normalize;
    use serde_json::json;

    fn item(id: &str, hash: &str) -> ContentItem {
        ContentItem {
            source_kind: SourceKind::Microblog,
            source_native_id: id.to_string(),
            item_kind: ItemKind::Status,
            title: None,
            created_at: None,
            updated_at: None,
            author: Some("someone".into()),
            body: Body::plain(format!("status {id}")),
            parent_native_id: None,
            extras: Extras::new(),
            content_hash: hash.to_string(),
        }
    }

    fn stored(id: i64, item: ContentItem) -> StoredItem {
        StoredItem {
            id,
            archived_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            parent_id: None,
            item,
        }
    }

    #[test]
    fn test_absent_is_insert() {
        let action = resolve(item("1", "aa"), None);
        assert!(matches!(action, Action::Insert(_)));
    }

    #[test]
    fn test_same_hash_is_noop() {
        let existing = stored(7, item("1", "aa"));
        assert_eq!(resolve(item("1", "aa"), Some(&existing)), Action::NoOp { id: 7 });
    }

    #[test]
    fn test_changed_hash_keeps_identity() {
        let existing = stored(7, item("1", "aa"));
        match resolve(item("1", "bb"), Some(&existing)) {
            Action::Update { id, archived_at, item } => {
                assert_eq!(id, 7);
                assert_eq!(archived_at, existing.archived_at);
                assert_eq!(item.content_hash, "bb");
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_dedupe_keeps_later_occurrence() {
        let (kept, duplicates) = dedupe_batch(vec![
            item("1", "first"),
            item("2", "x"),
            item("1", "second"),
        ]);
        assert_eq!(duplicates, 1);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].source_native_id, "2");
        assert_eq!(kept[1].content_hash, "second");
    }

    #[test]
    fn test_resolve_batch_in_page_order() {
        let mut existing = HashMap::new();
        existing.insert("1".to_string(), stored(1, item("1", "aa")));
        existing.insert("2".to_string(), stored(2, item("2", "aa")));

        let actions = resolve_batch(
            vec![item("1", "aa"), item("2", "changed"), item("3", "new")],
            &existing,
        );
        assert_eq!(actions.len(), 3);
        assert_eq!(actions[0], Action::NoOp { id: 1 });
        assert!(matches!(actions[1], Action::Update { id: 2, .. }));
        assert!(matches!(&actions[2], Action::Insert(item) if item.source_native_id == "3"));
    }

    fn status_in(feed: &str) -> ContentItem {
        let raw = RawItem::new(
            ItemKind::Status,
            json!({"id_str": "7", "full_text": "kestrel over the field"}),
        )
        .with_context("feed", feed);
        normalize(&raw, SourceKind::Microblog).unwrap()
    }

    #[test]
    fn test_new_feed_membership_is_an_update() {
        let existing = stored(3, status_in("timeline"));

        let merged = match resolve(status_in("favorites"), Some(&existing)) {
            Action::Update { id, item, .. } => {
                assert_eq!(id, 3);
                assert_eq!(item.extras.get("feeds"), Some(&json!(["favorites", "timeline"])));
                assert_eq!(item.content_hash, content_hash(&item));
                item
            }
            other => panic!("expected update, got {other:?}"),
        };

        // Seen again in either feed, nothing is lost and nothing changes.
        let existing = stored(3, merged);
        assert_eq!(resolve(status_in("timeline"), Some(&existing)), Action::NoOp { id: 3 });
        assert_eq!(resolve(status_in("favorites"), Some(&existing)), Action::NoOp { id: 3 });
    }
}

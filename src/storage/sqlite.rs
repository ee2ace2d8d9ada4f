//! SQLite-backed archive store.
//!
//! rusqlite is synchronous, so every operation runs on tokio's blocking
//! pool with the connection behind a mutex.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{ArchiveStore, CommitReport, StoreResult};
use crate::error::StoreError;
use crate::models::{
    ContentItem, CursorPosition, ItemKind, ReconcileReport, RunSummary, SourceKind, StoredItem,
    SyncCursor,
};
use crate::pipeline::Action;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS content_items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_kind TEXT NOT NULL,
        source_native_id TEXT NOT NULL,
        item_kind TEXT NOT NULL,
        title TEXT,
        created_at TEXT,
        updated_at TEXT,
        author TEXT,
        body TEXT NOT NULL,
        parent_native_id TEXT,
        parent_id INTEGER REFERENCES content_items(id),
        extras TEXT NOT NULL,
        archived_at TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        UNIQUE(source_kind, source_native_id)
    );

    CREATE INDEX IF NOT EXISTS idx_content_items_dangling
        ON content_items(source_kind, parent_native_id)
        WHERE parent_native_id IS NOT NULL AND parent_id IS NULL;

    CREATE TABLE IF NOT EXISTS sync_cursors (
        source_kind TEXT PRIMARY KEY,
        position TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at TEXT NOT NULL,
        finished_at TEXT NOT NULL,
        summary TEXT NOT NULL
    );
";

const ITEM_COLUMNS: &str = "id, source_kind, source_native_id, item_kind, title, created_at, \
     updated_at, author, body, parent_native_id, parent_id, extras, archived_at, content_hash";

/// Archive store backed by a single SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Opens an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            op(&mut guard)
        })
        .await?
    }
}

#[async_trait]
impl ArchiveStore for SqliteStore {
    async fn load_cursor(&self, kind: SourceKind) -> StoreResult<SyncCursor> {
        self.with_conn(move |conn| {
            let row: Option<(String, i64)> = conn
                .query_row(
                    "SELECT position, sequence FROM sync_cursors WHERE source_kind = ?1",
                    params![kind.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                None => Ok(SyncCursor::beginning(kind)),
                Some((position, sequence)) => Ok(SyncCursor {
                    source_kind: kind,
                    position: serde_json::from_str(&position)?,
                    sequence: sequence as u64,
                }),
            }
        })
        .await
    }

    async fn find_existing(
        &self,
        kind: SourceKind,
        native_ids: &[String],
    ) -> StoreResult<HashMap<String, StoredItem>> {
        let native_ids = native_ids.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {ITEM_COLUMNS} FROM content_items
                 WHERE source_kind = ?1 AND source_native_id = ?2"
            ))?;

            let mut found = HashMap::new();
            for native_id in native_ids {
                let row = stmt
                    .query_row(params![kind.as_str(), native_id], read_row)
                    .optional()?;
                if let Some(row) = row {
                    found.insert(native_id, row.into_stored()?);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn commit_page(
        &self,
        actions: &[Action],
        expected_sequence: u64,
        cursor: &SyncCursor,
    ) -> StoreResult<CommitReport> {
        let actions = actions.to_vec();
        let cursor = cursor.clone();
        self.with_conn(move |conn| commit(conn, &actions, expected_sequence, &cursor))
            .await
    }

    async fn reconcile_dangling(&self) -> StoreResult<ReconcileReport> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let linked = tx.execute(
                "UPDATE content_items SET parent_id = (
                    SELECT p.id FROM content_items p
                    WHERE p.source_kind = content_items.source_kind
                      AND p.source_native_id = content_items.parent_native_id
                 )
                 WHERE parent_native_id IS NOT NULL
                   AND parent_id IS NULL
                   AND EXISTS (
                    SELECT 1 FROM content_items p
                    WHERE p.source_kind = content_items.source_kind
                      AND p.source_native_id = content_items.parent_native_id
                   )",
                [],
            )?;
            let dangling: i64 = tx.query_row(
                "SELECT COUNT(*) FROM content_items
                 WHERE parent_native_id IS NOT NULL AND parent_id IS NULL",
                [],
                |row| row.get(0),
            )?;
            tx.commit()?;

            Ok(ReconcileReport {
                linked,
                dangling: dangling as usize,
            })
        })
        .await
    }

    async fn item(&self, kind: SourceKind, native_id: &str) -> StoreResult<Option<StoredItem>> {
        let native_id = native_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {ITEM_COLUMNS} FROM content_items
                         WHERE source_kind = ?1 AND source_native_id = ?2"
                    ),
                    params![kind.as_str(), native_id],
                    read_row,
                )
                .optional()?;
            row.map(ItemRow::into_stored).transpose()
        })
        .await
    }

    async fn count_items(&self, kind: Option<SourceKind>) -> StoreResult<usize> {
        self.with_conn(move |conn| {
            let count: i64 = match kind {
                Some(kind) => conn.query_row(
                    "SELECT COUNT(*) FROM content_items WHERE source_kind = ?1",
                    params![kind.as_str()],
                    |row| row.get(0),
                )?,
                None => {
                    conn.query_row("SELECT COUNT(*) FROM content_items", [], |row| row.get(0))?
                }
            };
            Ok(count as usize)
        })
        .await
    }

    async fn cursors(&self) -> StoreResult<Vec<SyncCursor>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT source_kind, position, sequence FROM sync_cursors ORDER BY source_kind",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(kind, position, sequence)| {
                    Ok(SyncCursor {
                        source_kind: parse_kind(&kind)?,
                        position: serde_json::from_str::<CursorPosition>(&position)?,
                        sequence: sequence as u64,
                    })
                })
                .collect()
        })
        .await
    }

    async fn record_run(&self, summary: &RunSummary) -> StoreResult<()> {
        let started_at = summary.started_at.to_rfc3339();
        let finished_at = summary.finished_at.to_rfc3339();
        let json = serde_json::to_string(summary)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sync_runs (started_at, finished_at, summary) VALUES (?1, ?2, ?3)",
                params![started_at, finished_at, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn latest_run(&self) -> StoreResult<Option<RunSummary>> {
        self.with_conn(|conn| {
            let summary: Option<String> = conn
                .query_row(
                    "SELECT summary FROM sync_runs ORDER BY id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let summary = summary
                .map(|json| serde_json::from_str::<RunSummary>(&json))
                .transpose()?;
            Ok(summary)
        })
        .await
    }
}

/// Apply one page and advance its cursor in a single transaction.
fn commit(
    conn: &mut Connection,
    actions: &[Action],
    expected_sequence: u64,
    cursor: &SyncCursor,
) -> StoreResult<CommitReport> {
    let kind = cursor.source_kind;
    let tx = conn.transaction()?;

    let found = stored_sequence(&tx, kind)?;
    if found != expected_sequence {
        return Err(StoreError::StaleCursor {
            kind,
            expected: expected_sequence,
            found,
        });
    }

    let now = Utc::now();
    let mut report = CommitReport::default();
    for action in actions {
        match action {
            Action::Insert(item) => {
                ensure_kind(item, kind)?;
                let id = insert_item(&tx, item, now)?;
                report.inserted += 1;
                report.linked += link_children(&tx, item, id)?;
            }
            Action::Update {
                id,
                archived_at,
                item,
            } => {
                ensure_kind(item, kind)?;
                update_item(&tx, *id, *archived_at, item)?;
                report.updated += 1;
                report.linked += link_children(&tx, item, *id)?;
            }
            Action::NoOp { .. } => report.unchanged += 1,
        }
    }

    tx.execute(
        "INSERT INTO sync_cursors (source_kind, position, sequence, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(source_kind) DO UPDATE SET
            position = excluded.position,
            sequence = excluded.sequence,
            updated_at = excluded.updated_at",
        params![
            kind.as_str(),
            serde_json::to_string(&cursor.position)?,
            cursor.sequence as i64,
            now.to_rfc3339(),
        ],
    )?;

    // Dropping the transaction without commit rolls everything back.
    tx.commit()?;
    Ok(report)
}

fn stored_sequence(conn: &Connection, kind: SourceKind) -> StoreResult<u64> {
    let sequence: Option<i64> = conn
        .query_row(
            "SELECT sequence FROM sync_cursors WHERE source_kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(sequence.unwrap_or(0) as u64)
}

fn ensure_kind(item: &ContentItem, kind: SourceKind) -> StoreResult<()> {
    if item.source_kind != kind {
        return Err(StoreError::Corrupt(format!(
            "{} item {} committed under {} cursor",
            item.source_kind, item.source_native_id, kind
        )));
    }
    Ok(())
}

fn parent_id(conn: &Connection, item: &ContentItem) -> StoreResult<Option<i64>> {
    let Some(parent) = &item.parent_native_id else {
        return Ok(None);
    };
    Ok(conn
        .query_row(
            "SELECT id FROM content_items WHERE source_kind = ?1 AND source_native_id = ?2",
            params![item.source_kind.as_str(), parent],
            |row| row.get(0),
        )
        .optional()?)
}

fn insert_item(conn: &Connection, item: &ContentItem, archived_at: DateTime<Utc>) -> StoreResult<i64> {
    let parent = parent_id(conn, item)?;
    conn.execute(
        "INSERT INTO content_items (
            source_kind, source_native_id, item_kind, title, created_at, updated_at,
            author, body, parent_native_id, parent_id, extras, archived_at, content_hash
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            item.source_kind.as_str(),
            item.source_native_id,
            item.item_kind.as_str(),
            item.title,
            item.created_at.map(|t| t.to_rfc3339()),
            item.updated_at.map(|t| t.to_rfc3339()),
            item.author,
            serde_json::to_string(&item.body)?,
            item.parent_native_id,
            parent,
            serde_json::to_string(&item.extras)?,
            archived_at.to_rfc3339(),
            item.content_hash,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Overwrite the canonical fields of a row, which must still carry the
/// identity and `archived_at` the update was resolved against.
fn update_item(
    conn: &Connection,
    id: i64,
    archived_at: DateTime<Utc>,
    item: &ContentItem,
) -> StoreResult<()> {
    let parent = parent_id(conn, item)?;
    let changed = conn.execute(
        "UPDATE content_items SET
            item_kind = ?1, title = ?2, created_at = ?3, updated_at = ?4, author = ?5,
            body = ?6, parent_native_id = ?7, parent_id = ?8, extras = ?9, content_hash = ?10
         WHERE id = ?11 AND source_kind = ?12 AND source_native_id = ?13 AND archived_at = ?14",
        params![
            item.item_kind.as_str(),
            item.title,
            item.created_at.map(|t| t.to_rfc3339()),
            item.updated_at.map(|t| t.to_rfc3339()),
            item.author,
            serde_json::to_string(&item.body)?,
            item.parent_native_id,
            parent,
            serde_json::to_string(&item.extras)?,
            item.content_hash,
            id,
            item.source_kind.as_str(),
            item.source_native_id,
            archived_at.to_rfc3339(),
        ],
    )?;
    if changed != 1 {
        return Err(StoreError::Corrupt(format!(
            "row {id} no longer holds {} item {} archived at {archived_at}",
            item.source_kind, item.source_native_id
        )));
    }
    Ok(())
}

/// Point children that were waiting for this item at its local id.
fn link_children(conn: &Connection, item: &ContentItem, id: i64) -> StoreResult<usize> {
    Ok(conn.execute(
        "UPDATE content_items SET parent_id = ?1
         WHERE source_kind = ?2 AND parent_native_id = ?3 AND parent_id IS NULL",
        params![id, item.source_kind.as_str(), item.source_native_id],
    )?)
}

fn parse_kind(value: &str) -> StoreResult<SourceKind> {
    value
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown source kind '{value}'")))
}

fn parse_time(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{value}': {e}")))
}

fn parse_optional_time(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

/// Raw column values of one `content_items` row.
struct ItemRow {
    id: i64,
    source_kind: String,
    source_native_id: String,
    item_kind: String,
    title: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    author: Option<String>,
    body: String,
    parent_native_id: Option<String>,
    parent_id: Option<i64>,
    extras: String,
    archived_at: String,
    content_hash: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<ItemRow> {
    Ok(ItemRow {
        id: row.get(0)?,
        source_kind: row.get(1)?,
        source_native_id: row.get(2)?,
        item_kind: row.get(3)?,
        title: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        author: row.get(7)?,
        body: row.get(8)?,
        parent_native_id: row.get(9)?,
        parent_id: row.get(10)?,
        extras: row.get(11)?,
        archived_at: row.get(12)?,
        content_hash: row.get(13)?,
    })
}

impl ItemRow {
    fn into_stored(self) -> StoreResult<StoredItem> {
        let item_kind = ItemKind::parse(&self.item_kind)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown item kind '{}'", self.item_kind)))?;

        Ok(StoredItem {
            id: self.id,
            archived_at: parse_time(&self.archived_at)?,
            parent_id: self.parent_id,
            item: ContentItem {
                source_kind: parse_kind(&self.source_kind)?,
                source_native_id: self.source_native_id,
                item_kind,
                title: self.title,
                created_at: parse_optional_time(self.created_at)?,
                updated_at: parse_optional_time(self.updated_at)?,
                author: self.author,
                body: serde_json::from_str(&self.body)?,
                parent_native_id: self.parent_native_id,
                extras: serde_json::from_str(&self.extras)?,
                content_hash: self.content_hash,
            },
        })
    }
}

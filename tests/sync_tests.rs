//! End-to-end sync runs against mocked platform APIs.

use std::collections::HashMap;
use std::sync::Arc;

use archiver::config::Credentials;
use archiver::error::ErrorKind;
use archiver::models::{
    Config, RetryConfig, RunOutcome, Source, SourceKind, SourceState, SyncConfig,
};
use archiver::pipeline::{request_all, run_reconcile, run_sync};
use archiver::storage::{ArchiveStore, SqliteStore};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ENTRIES: &str = "/api/v1/journals/writer/entries";
const COMMENTS: &str = "/api/v1/journals/writer/comments";
const TIMELINE: &str = "/1.1/statuses/user_timeline.json";
const FAVORITES: &str = "/1.1/favorites/list.json";
const GALLERY: &str = "/api/v1/oauth2/gallery/all";

fn config(sources: Vec<Source>) -> Config {
    Config {
        sync: SyncConfig {
            max_concurrent: 3,
            page_size: 10,
        },
        retry: RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            default_rate_limit_wait_ms: 5,
            max_rate_limit_wait_ms: 20,
            ..RetryConfig::default()
        },
        sources,
        ..Config::default()
    }
}

fn credentials() -> HashMap<String, Credentials> {
    HashMap::from([
        ("lj".to_string(), Credentials::basic("writer", "secret")),
        ("twitter".to_string(), Credentials::bearer("tok")),
        ("da".to_string(), Credentials::client("id", "secret")),
    ])
}

fn journal_source(server: &MockServer) -> Source {
    Source::new(SourceKind::Journal, "lj", "writer", "lj").with_base_url(server.uri())
}

fn microblog_source(server: &MockServer) -> Source {
    Source::new(SourceKind::Microblog, "tweets", "birder", "twitter").with_base_url(server.uri())
}

fn artshare_source(server: &MockServer) -> Source {
    Source::new(SourceKind::ArtShare, "gallery", "painter", "da").with_base_url(server.uri())
}

fn entry(itemid: u64, logtime: &str, comments: Value) -> Value {
    json!({
        "itemid": itemid,
        "subject": format!("Entry {itemid}"),
        "event": "<p>Hello</p>",
        "poster": "writer",
        "eventtime": "2009-03-01 12:00:00",
        "logtime": logtime,
        "url": format!("https://writer.journal.example/{itemid}.html"),
        "comments": comments
    })
}

fn status(id: u64) -> Value {
    json!({
        "id": id,
        "id_str": id.to_string(),
        "full_text": format!("status {id} #birds"),
        "created_at": "Wed Aug 27 13:08:45 +0000 2014",
        "user": {"screen_name": "birder"}
    })
}

fn deviation(id: &str, published: i64) -> Value {
    json!({
        "deviationid": id,
        "title": format!("Painting {id}"),
        "published_time": published.to_string(),
        "author": {"username": "painter"},
        "content": {"src": format!("https://img.example/{id}.png"), "width": 800, "height": 600}
    })
}

fn comment(dtalkid: u64, jitemid: u64, parent: u64, body: &str) -> Value {
    json!({
        "dtalkid": dtalkid,
        "jitemid": jitemid,
        "parentdtalkid": parent,
        "body": body,
        "datepost": "2009-03-01 14:00:00"
    })
}

async fn mount_comments(server: &MockServer, startid: u64, comments: Vec<Value>, maxid: u64) {
    Mock::given(method("GET"))
        .and(path(COMMENTS))
        .and(query_param("startid", startid.to_string().as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "comments": comments,
            "maxid": maxid
        })))
        .mount(server)
        .await;
}

/// Two entries, the first with a comment and a reply. The comment feed
/// repeats both comments and has nothing newer.
async fn mount_journal(server: &MockServer) {
    mount_entries(server).await;
    mount_comments(server, 0, thread(), 6).await;
    mount_comments(server, 7, Vec::new(), 6).await;
}

fn thread() -> Vec<Value> {
    vec![
        json!({
            "dtalkid": 5,
            "jitemid": 101,
            "parentdtalkid": 0,
            "body": "first!",
            "postername": "reader",
            "datepost": "2009-03-01 13:00:00"
        }),
        comment(6, 101, 5, "reply"),
    ]
}

async fn mount_entries(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path(ENTRIES))
        .and(query_param("lastsync", "2009-03-02 09:00:00"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [], "count": 0, "total": 0
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(ENTRIES))
        .and(query_param("lastsync", "2009-03-01 12:31:05"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [entry(102, "2009-03-02 09:00:00", json!([]))],
            "count": 1,
            "total": 1
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(ENTRIES))
        .and(query_param_is_missing("lastsync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [entry(101, "2009-03-01 12:31:05", json!([
                {
                    "dtalkid": 5,
                    "body": "first!",
                    "postername": "reader",
                    "datepost": "2009-03-01 13:00:00",
                    "children": [
                        {"dtalkid": 6, "body": "reply", "datepost": "2009-03-01 14:00:00"}
                    ]
                }
            ]))],
            "count": 1,
            "total": 2
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_journal_sync_is_incremental_and_idempotent() {
    let server = MockServer::start().await;
    mount_journal(&server).await;

    let config = config(vec![journal_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    let first = run_sync(
        &config,
        request_all(&config, false),
        &credentials(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(first.outcome, RunOutcome::Complete);
    let report = &first.sources[0];
    assert_eq!(report.state, SourceState::Done);
    assert_eq!(report.pages_fetched, 3);
    assert_eq!(report.inserted, 4);
    // The comment feed repeats the thread already read with its entry.
    assert_eq!(report.unchanged, 2);
    assert_eq!(store.count_items(Some(SourceKind::Journal)).await.unwrap(), 4);

    let entry = store.item(SourceKind::Journal, "101").await.unwrap().unwrap();
    let comment = store.item(SourceKind::Journal, "c5").await.unwrap().unwrap();
    let reply = store.item(SourceKind::Journal, "c6").await.unwrap().unwrap();
    assert_eq!(comment.parent_id, Some(entry.id));
    assert_eq!(reply.parent_id, Some(comment.id));

    let second = run_sync(
        &config,
        request_all(&config, false),
        &credentials(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(second.outcome, RunOutcome::Complete);
    assert_eq!(second.sources[0].writes(), 0);
    assert_eq!(store.count_items(None).await.unwrap(), 4);
    assert_eq!(
        store.item(SourceKind::Journal, "101").await.unwrap().unwrap().archived_at,
        entry.archived_at
    );

    let report = run_reconcile(store.as_ref()).await.unwrap();
    assert_eq!(report.dangling, 0);
}

#[tokio::test]
async fn test_new_comment_on_old_entry_is_archived() {
    let server = MockServer::start().await;
    mount_entries(&server).await;
    mount_comments(&server, 0, thread(), 6).await;
    mount_comments(&server, 7, vec![comment(8, 101, 5, "months later")], 8).await;

    let config = config(vec![journal_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for _ in 0..2 {
        let summary = run_sync(
            &config,
            request_all(&config, false),
            &credentials(),
            Arc::clone(&store),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(summary.outcome, RunOutcome::Complete);
    }

    let first = store.item(SourceKind::Journal, "c5").await.unwrap().unwrap();
    let late = store.item(SourceKind::Journal, "c8").await.unwrap().unwrap();
    assert_eq!(late.item.body.text, "months later");
    assert_eq!(late.parent_id, Some(first.id));
    assert_eq!(store.count_items(None).await.unwrap(), 5);
}

#[tokio::test]
async fn test_microblog_waits_out_rate_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TIMELINE))
        .and(query_param("max_id", "18"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(TIMELINE))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(TIMELINE))
        .and(query_param_is_missing("max_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([status(20), status(19)])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(FAVORITES))
        .and(query_param("max_id", "6"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(FAVORITES))
        .and(query_param_is_missing("max_id"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([status(7)])))
        .mount(&server)
        .await;

    let config = config(vec![microblog_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let summary = run_sync(
        &config,
        request_all(&config, false),
        &credentials(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .await;

    let report = &summary.sources[0];
    assert_eq!(report.state, SourceState::Done);
    assert_eq!(report.rate_limit_waits, 1);
    assert_eq!(report.inserted, 3);
    assert_eq!(report.error_count(ErrorKind::RateLimited), 1);

    let status = store.item(SourceKind::Microblog, "20").await.unwrap().unwrap();
    assert_eq!(status.item.author.as_deref(), Some("birder"));
}

#[tokio::test]
async fn test_status_in_both_feeds_keeps_both_memberships() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(TIMELINE))
        .and(query_param("since_id", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    for feed in [TIMELINE, FAVORITES] {
        Mock::given(method("GET"))
            .and(path(feed))
            .and(query_param("max_id", "6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(feed))
            .and(query_param_is_missing("max_id"))
            .and(query_param_is_missing("since_id"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([status(7)])))
            .mount(&server)
            .await;
    }

    let config = config(vec![microblog_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let secrets = credentials();
    let run = || {
        run_sync(
            &config,
            request_all(&config, false),
            &secrets,
            Arc::clone(&store),
            CancellationToken::new(),
        )
    };

    let first = run().await;
    let report = &first.sources[0];
    assert_eq!(report.state, SourceState::Done);
    assert_eq!((report.inserted, report.updated), (1, 1));

    let second = run().await;
    assert_eq!(second.sources[0].writes(), 0);
    assert_eq!(second.sources[0].unchanged, 1);

    let stored = store.item(SourceKind::Microblog, "7").await.unwrap().unwrap();
    assert_eq!(
        stored.item.extras.get("feeds"),
        Some(&json!(["favorites", "timeline"]))
    );
    assert_eq!(store.count_items(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_artshare_second_pass_stops_at_known_items() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "t1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(GALLERY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [deviation("b", 200), deviation("a", 100)],
            "has_more": false
        })))
        .mount(&server)
        .await;

    let config = config(vec![artshare_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());

    let first = run_sync(
        &config,
        request_all(&config, false),
        &credentials(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .await;
    assert_eq!(first.sources[0].inserted, 2);

    let second = run_sync(
        &config,
        request_all(&config, false),
        &credentials(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .await;
    assert_eq!(second.sources[0].state, SourceState::Done);
    assert_eq!(second.sources[0].writes(), 0);
    assert_eq!(second.sources[0].unchanged, 0);

    let painting = store.item(SourceKind::ArtShare, "b").await.unwrap().unwrap();
    assert_eq!(painting.item.body.media.len(), 1);
}

#[tokio::test]
async fn test_one_failing_source_leaves_others_complete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ENTRIES))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access_token": "t1"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(GALLERY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "results": [deviation("a", 100)],
            "has_more": false
        })))
        .mount(&server)
        .await;

    let config = config(vec![journal_source(&server), artshare_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let summary = run_sync(
        &config,
        request_all(&config, false),
        &credentials(),
        Arc::clone(&store),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(summary.outcome, RunOutcome::Partial);
    assert_eq!(summary.sources[0].kind, SourceKind::Journal);
    assert!(matches!(
        summary.sources[0].state,
        SourceState::Failed { kind: ErrorKind::Auth, .. }
    ));
    assert_eq!(summary.sources[1].state, SourceState::Done);
    assert_eq!(store.count_items(Some(SourceKind::ArtShare)).await.unwrap(), 1);

    let recorded = store.latest_run().await.unwrap().unwrap();
    assert_eq!(recorded.outcome, RunOutcome::Partial);
}

#[tokio::test]
async fn test_force_full_rereads_without_duplicates() {
    let server = MockServer::start().await;
    mount_journal(&server).await;

    let config = config(vec![journal_source(&server)]);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    for force_full in [false, true] {
        let summary = run_sync(
            &config,
            request_all(&config, force_full),
            &credentials(),
            Arc::clone(&store),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(summary.outcome, RunOutcome::Complete);
    }

    let cursor = store.load_cursor(SourceKind::Journal).await.unwrap();
    assert!(cursor.sequence >= 2);
    assert_eq!(store.count_items(None).await.unwrap(), 4);
}

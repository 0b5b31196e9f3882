//! Integration tests for the source lifecycle: import, poll, disable, reset.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use std::sync::Arc;

use feedtide::config::Config;
use feedtide::feed::FixedAgent;
use feedtide::poller::Poller;
use feedtide::storage::{Database, DEFAULT_INTERVAL};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0">
<channel>
    <title>Lifecycle Blog</title>
    <link>https://lifecycle.example/</link>
    <description>Posts</description>
    <item>
        <guid>post-1</guid>
        <title>Hello</title>
        <link>https://lifecycle.example/hello</link>
        <pubDate>Mon, 01 Jan 2024 10:00:00 GMT</pubDate>
        <description>&lt;p&gt;Hello &lt;script&gt;alert(1)&lt;/script&gt;world&lt;/p&gt;</description>
    </item>
</channel>
</rss>"#;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn test_poller(db: &Database) -> Poller {
    let config = Config {
        request_timeout_secs: 5,
        ..Config::default()
    };
    Poller::with_agents(db.clone(), &config, Arc::new(FixedAgent("Test/1.0".into()))).unwrap()
}

// ============================================================================
// Import
// ============================================================================

#[tokio::test]
async fn test_imported_source_is_due_immediately() {
    let db = test_db().await;
    let id = db
        .insert_source("https://lifecycle.example/feed.xml", Some("Lifecycle"))
        .await
        .unwrap();

    let due = db.due_sources(chrono::Utc::now().timestamp(), 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, id);
    assert_eq!(due[0].interval, DEFAULT_INTERVAL);
    assert!(due[0].live);
    assert_eq!(due[0].display_name(), "Lifecycle");
}

#[tokio::test]
async fn test_reimport_keeps_one_source() {
    let db = test_db().await;
    let first = db.insert_source("https://lifecycle.example/feed.xml", None).await.unwrap();
    let second = db
        .insert_source("https://lifecycle.example/feed.xml", Some("Named later"))
        .await
        .unwrap();
    assert_eq!(first, second);

    let source = db
        .get_source_by_url("https://lifecycle.example/feed.xml")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(source.name.as_deref(), Some("Named later"));
}

// ============================================================================
// Poll, disable, reset
// ============================================================================

#[tokio::test]
async fn test_full_lifecycle_poll_disable_reset() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(RSS, "application/rss+xml"))
        .mount(&server)
        .await;

    let db = test_db().await;
    let poller = test_poller(&db);
    let url = format!("{}/feed.xml", server.uri());
    let id = db.insert_source(&url, None).await.unwrap();

    // 1. First poll stores the entry and the feed's metadata
    let report = poller.poll_source(id, false).await.unwrap();
    assert_eq!(report.new_entries, 1);
    let source = db.get_source(id).await.unwrap().unwrap();
    assert_eq!(source.name.as_deref(), Some("Lifecycle Blog"));
    assert_eq!(source.site_url.as_deref(), Some("https://lifecycle.example/"));

    let entries = db.entries_for_source(id).await.unwrap();
    assert_eq!(entries[0].guid, "post-1");
    assert_eq!(entries[0].link.as_deref(), Some("https://lifecycle.example/hello"));
    assert!(entries[0].body.contains("world"));
    assert!(!entries[0].body.contains("script"));

    // 2. The feed disappears for good
    server.reset().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;
    let report = poller.poll_source(id, false).await.unwrap();
    assert!(!report.live);
    assert!(db.live_sources().await.unwrap().is_empty());
    assert_eq!(db.count_entries(id).await.unwrap(), 1);

    // 3. A manual reset brings it back into rotation
    assert!(db.reset_source(&url).await.unwrap());
    let due = db.due_sources(chrono::Utc::now().timestamp(), 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert!(due[0].live);

    assert!(!db.reset_source("https://unknown.example/feed").await.unwrap());
}

#[tokio::test]
async fn test_no_cache_poll_refetches_full_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"abc\"")
                .set_body_raw(RSS, "application/rss+xml"),
        )
        .mount(&server)
        .await;

    let db = test_db().await;
    let poller = test_poller(&db);
    let id = db
        .insert_source(&format!("{}/feed.xml", server.uri()), None)
        .await
        .unwrap();

    poller.poll_source(id, false).await.unwrap();
    poller.poll_source(id, true).await.unwrap();

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);
    assert!(received[1].headers.get("if-none-match").is_none());
    assert_eq!(
        received[1].headers.get("pragma").and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );
}

#[tokio::test]
async fn test_no_cache_applies_to_due_batch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(RSS, "application/rss+xml"))
        .mount(&server)
        .await;

    let db = test_db().await;
    let poller = test_poller(&db);
    db.insert_source(&format!("{}/feed.xml", server.uri()), None)
        .await
        .unwrap();

    let reports = poller.poll_due(true).await.unwrap();
    assert_eq!(reports.len(), 1);

    let received = server.received_requests().await.unwrap();
    assert_eq!(
        received[0].headers.get("pragma").and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );
}

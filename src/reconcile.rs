//! Merge parsed feed documents into stored entries.
//!
//! A reconcile pass runs in one transaction: the source row is locked first,
//! every entry of every page is created or refreshed, enclosures are rebuilt,
//! and new entries get their indices before commit. A pass either lands as a
//! whole or leaves the stored entries as they were.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::feed::{FeedDocument, FeedMeta, ParsedEntry};
use crate::storage::{
    assign_pending_indices, find_entry_id, insert_entry, lock_source, replace_enclosures,
    update_entry, update_source_metadata, Database, DatabaseError, EntryRecord, NewEnclosure,
    Source,
};

const YOUTUBE_WATCH_PREFIX: &str = "https://www.youtube.com";
const YOUTUBE_EMBED_PREFIX: &str = "https://www.youtube.com/embed/";

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// No id, no link, and nothing to digest
    #[error("Entry has no id, link or content to identify it")]
    NoIdentity,
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub changed: bool,
    pub new_entries: usize,
    /// Entries dropped because they could not be identified
    pub skipped: usize,
}

/// Stable identity for an entry: its declared id, else its link, else a
/// digest of its content.
pub fn stable_id(entry: &ParsedEntry) -> Result<String, ReconcileError> {
    if let Some(id) = entry.id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    if let Some(link) = entry.link.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
        return Ok(link.to_string());
    }
    let content = if entry.body.trim().is_empty() {
        entry.title.trim()
    } else {
        entry.body.as_str()
    };
    if content.is_empty() {
        return Err(ReconcileError::NoIdentity);
    }
    Ok(format!("{:x}", Sha256::digest(content.as_bytes())))
}

/// Enclosures for an entry: the declared ones, then media items with new
/// hrefs, then an embed for a video-page link nothing else covers.
pub fn merged_enclosures(entry: &ParsedEntry) -> Vec<NewEnclosure> {
    let mut merged: Vec<NewEnclosure> = Vec::new();
    for enclosure in entry.enclosures.iter().chain(&entry.media) {
        if !merged.iter().any(|e| e.href == enclosure.href) {
            merged.push(enclosure.clone());
        }
    }

    if let Some(embed) = entry.link.as_deref().and_then(video_embed) {
        if !merged.iter().any(|e| e.href == embed) {
            merged.push(NewEnclosure {
                href: embed,
                mime_type: "youtube".to_string(),
                length: 0,
                medium: Some("video".to_string()),
                description: None,
            });
        }
    }
    merged
}

/// `https://www.youtube.com/watch?v=ID&..` → `https://www.youtube.com/embed/ID`
fn video_embed(link: &str) -> Option<String> {
    if !link.starts_with(YOUTUBE_WATCH_PREFIX) {
        return None;
    }
    let (_, rest) = link.split_once("?v=")?;
    let id = rest.split('&').next().unwrap_or_default();
    (!id.is_empty()).then(|| format!("{YOUTUBE_EMBED_PREFIX}{id}"))
}

pub struct Reconciler {
    force_update: bool,
}

impl Reconciler {
    /// `force_update` overwrites source metadata on every pass instead of
    /// only filling fields that are still empty.
    pub fn new(force_update: bool) -> Self {
        Self { force_update }
    }

    /// Merge `pages` (the first page is the newest) into the source's entries.
    ///
    /// Metadata comes from the first page. Pages are applied oldest first so
    /// newly found entries are indexed in publication order.
    pub async fn reconcile(
        &self,
        db: &Database,
        source: &mut Source,
        pages: &[FeedDocument],
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary, DatabaseError> {
        let mut tx = db.begin().await?;
        let max_index = lock_source(&mut *tx, source.id).await?;

        if let Some(first) = pages.first() {
            self.apply_metadata(source, &first.meta);
            update_source_metadata(&mut *tx, source).await?;
        }

        let mut summary = ReconcileSummary::default();
        for page in pages.iter().rev() {
            for entry in &page.entries {
                let guid = match stable_id(entry) {
                    Ok(guid) => guid,
                    Err(e) => {
                        tracing::warn!(source_id = source.id, title = %entry.title, error = %e, "Skipping entry");
                        summary.skipped += 1;
                        continue;
                    }
                };

                let record = EntryRecord {
                    title: &entry.title,
                    body: &entry.body,
                    link: entry.link.as_deref(),
                    created: entry.created,
                    author: entry.author.as_deref(),
                    image_url: entry.image_url.as_deref(),
                };

                let entry_id = match find_entry_id(&mut *tx, source.id, &guid).await? {
                    Some(id) => {
                        update_entry(&mut *tx, id, &record).await?;
                        id
                    }
                    None => {
                        summary.changed = true;
                        summary.new_entries += 1;
                        insert_entry(&mut *tx, source.id, &guid, &record, now.timestamp()).await?
                    }
                };

                replace_enclosures(&mut *tx, entry_id, &merged_enclosures(entry)).await?;
            }
        }

        source.max_index = if summary.changed {
            assign_pending_indices(&mut *tx, source.id, max_index).await?
        } else {
            max_index
        };

        tx.commit().await?;

        tracing::debug!(
            source_id = source.id,
            new_entries = summary.new_entries,
            skipped = summary.skipped,
            max_index = source.max_index,
            "Reconciled feed"
        );
        Ok(summary)
    }

    fn apply_metadata(&self, source: &mut Source, meta: &FeedMeta) {
        let force = self.force_update;
        let set = |field: &mut Option<String>, value: &Option<String>| {
            if value.is_some() && (force || field.as_deref().map_or(true, str::is_empty)) {
                field.clone_from(value);
            }
        };

        set(&mut source.name, &meta.title);
        set(&mut source.title, &meta.title);
        set(&mut source.subtitle, &meta.subtitle);
        set(&mut source.site_url, &meta.site_url);
        set(&mut source.image_url, &meta.image_url);
        set(&mut source.icon_url, &meta.icon_url);
        set(&mut source.author, &meta.author);
        set(&mut source.description, &meta.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn entry(id: Option<&str>, link: Option<&str>, title: &str, body: &str) -> ParsedEntry {
        ParsedEntry {
            id: id.map(String::from),
            title: title.to_string(),
            body: body.to_string(),
            link: link.map(String::from),
            ..ParsedEntry::default()
        }
    }

    fn enclosure(href: &str) -> NewEnclosure {
        NewEnclosure {
            href: href.to_string(),
            mime_type: "audio/mpeg".to_string(),
            length: 0,
            medium: Some("audio".to_string()),
            description: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()
    }

    async fn test_db() -> (Database, Source) {
        let db = Database::open(":memory:").await.unwrap();
        let id = db.insert_source("https://blog.example/feed.xml", None).await.unwrap();
        let source = db.get_source(id).await.unwrap().unwrap();
        (db, source)
    }

    fn page(entries: Vec<ParsedEntry>) -> FeedDocument {
        FeedDocument {
            meta: FeedMeta {
                title: Some("Example".into()),
                ..FeedMeta::default()
            },
            entries,
            ..FeedDocument::default()
        }
    }

    #[test]
    fn test_stable_id_fallbacks() {
        assert_eq!(stable_id(&entry(Some(" a "), Some("l"), "t", "b")).unwrap(), "a");
        assert_eq!(stable_id(&entry(None, Some("https://x/1"), "t", "b")).unwrap(), "https://x/1");

        let digest = stable_id(&entry(None, None, "t", "body")).unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, stable_id(&entry(None, None, "other", "body")).unwrap());

        let by_title = stable_id(&entry(None, None, "title only", "")).unwrap();
        assert_ne!(by_title, digest);

        assert!(matches!(stable_id(&entry(None, None, " ", "")), Err(ReconcileError::NoIdentity)));
    }

    #[test]
    fn test_merged_enclosures_dedupes_media() {
        let mut e = entry(Some("1"), None, "t", "b");
        e.enclosures = vec![enclosure("https://a/1.mp3")];
        e.media = vec![enclosure("https://a/1.mp3"), enclosure("https://a/2.mp4")];
        let hrefs: Vec<_> = merged_enclosures(&e).into_iter().map(|e| e.href).collect();
        assert_eq!(hrefs, vec!["https://a/1.mp3".to_string(), "https://a/2.mp4".to_string()]);
    }

    #[test]
    fn test_merged_enclosures_adds_video_embed() {
        let e = entry(Some("1"), Some("https://www.youtube.com/watch?v=abc123&t=10"), "t", "b");
        let merged = merged_enclosures(&e);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].href, "https://www.youtube.com/embed/abc123");
        assert_eq!(merged[0].mime_type, "youtube");

        let mut covered = e.clone();
        covered.media = vec![enclosure("https://www.youtube.com/embed/abc123")];
        assert_eq!(merged_enclosures(&covered).len(), 1);

        assert!(merged_enclosures(&entry(Some("1"), Some("https://vimeo.com/1"), "t", "b")).is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_inserts_and_indexes() {
        let (db, mut source) = test_db().await;
        let mut first = entry(Some("1"), None, "First", "one");
        first.created = Some(100);
        let mut second = entry(Some("2"), None, "Second", "two");
        second.created = Some(200);

        let summary = Reconciler::new(true)
            .reconcile(&db, &mut source, &[page(vec![first, second])], now())
            .await
            .unwrap();
        assert_eq!(summary, ReconcileSummary { changed: true, new_entries: 2, skipped: 0 });
        assert_eq!(source.max_index, 2);
        assert_eq!(source.name.as_deref(), Some("Example"));

        let stored = db.entries_for_source(source.id).await.unwrap();
        let indexed: Vec<_> = stored.iter().map(|e| (e.guid.as_str(), e.index)).collect();
        assert_eq!(indexed, vec![("1", 1), ("2", 2)]);
        assert_eq!(db.get_source(source.id).await.unwrap().unwrap().max_index, 2);
    }

    #[tokio::test]
    async fn test_reconcile_twice_changes_nothing() {
        let (db, mut source) = test_db().await;
        let mut e = entry(Some("1"), None, "First", "one");
        e.enclosures = vec![enclosure("https://a/1.mp3")];
        let pages = [page(vec![e])];
        let reconciler = Reconciler::new(true);

        reconciler.reconcile(&db, &mut source, &pages, now()).await.unwrap();
        let again = reconciler.reconcile(&db, &mut source, &pages, now()).await.unwrap();
        assert!(!again.changed);
        assert_eq!(again.new_entries, 0);
        assert_eq!(db.count_entries(source.id).await.unwrap(), 1);
        assert_eq!(db.count_enclosures(source.id).await.unwrap(), 1);
        assert_eq!(source.max_index, 1);
    }

    #[tokio::test]
    async fn test_reconcile_skips_unidentifiable_entries() {
        let (db, mut source) = test_db().await;
        let summary = Reconciler::new(true)
            .reconcile(
                &db,
                &mut source,
                &[page(vec![entry(None, None, "", ""), entry(Some("ok"), None, "t", "b")])],
                now(),
            )
            .await
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.new_entries, 1);
    }

    #[tokio::test]
    async fn test_reconcile_pages_oldest_first() {
        let (db, mut source) = test_db().await;
        // Same timestamp everywhere so only processing order decides indices
        let newest = page(vec![entry(Some("c"), None, "c", "c")]);
        let oldest = page(vec![entry(Some("a"), None, "a", "a"), entry(Some("b"), None, "b", "b")]);

        Reconciler::new(true)
            .reconcile(&db, &mut source, &[newest, oldest], now())
            .await
            .unwrap();

        let stored = db.entries_for_source(source.id).await.unwrap();
        let order: Vec<_> = stored.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_metadata_only_fills_empty_fields_without_force() {
        let (db, mut source) = test_db().await;
        source.name = Some("My name".into());
        let mut doc = page(vec![entry(Some("1"), None, "t", "b")]);
        doc.meta.site_url = Some("https://blog.example/".into());

        Reconciler::new(false)
            .reconcile(&db, &mut source, &[doc], now())
            .await
            .unwrap();
        let stored = db.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("My name"));
        assert_eq!(stored.site_url.as_deref(), Some("https://blog.example/"));
        assert_eq!(stored.title.as_deref(), Some("Example"));
    }
}

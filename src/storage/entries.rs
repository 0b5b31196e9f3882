use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{DatabaseError, Enclosure, Entry, EntryRecord, NewEnclosure, Source};

// ============================================================================
// Reconciliation primitives
// ============================================================================
//
// These run on a caller-owned connection so the reconciler can group a whole
// feed document (every page of it) into one transaction.

/// Take the write lock for `source_id` before reading anything else.
///
/// A no-op UPDATE as the first statement stops two overlapping transactions
/// from both reading under a shared lock and then failing the upgrade.
pub(crate) async fn lock_source(
    conn: &mut SqliteConnection,
    source_id: i64,
) -> Result<i64, DatabaseError> {
    let row: (i64,) = sqlx::query_as(
        "UPDATE sources SET max_index = max_index WHERE id = ? RETURNING max_index",
    )
    .bind(source_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

pub(crate) async fn find_entry_id(
    conn: &mut SqliteConnection,
    source_id: i64,
    guid: &str,
) -> Result<Option<i64>, DatabaseError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM entries WHERE source_id = ? AND guid = ?")
            .bind(source_id)
            .bind(guid)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|r| r.0))
}

/// Create an entry with index 0 (unassigned). `found` is stamped here and
/// never touched again.
pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    source_id: i64,
    guid: &str,
    record: &EntryRecord<'_>,
    now: i64,
) -> Result<i64, DatabaseError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO entries (source_id, guid, title, body, link, created, author, image_url, found, idx)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
        RETURNING id
    "#,
    )
    .bind(source_id)
    .bind(guid)
    .bind(record.title)
    .bind(record.body)
    .bind(record.link)
    .bind(record.created.unwrap_or(now))
    .bind(record.author)
    .bind(record.image_url)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.0)
}

/// Overwrite the mapped fields of an existing entry.
///
/// `created` is only replaced when the feed supplies one, so an undated entry
/// keeps the time it was first seen.
pub(crate) async fn update_entry(
    conn: &mut SqliteConnection,
    entry_id: i64,
    record: &EntryRecord<'_>,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        UPDATE entries SET
            title = ?,
            body = ?,
            link = ?,
            created = COALESCE(?, created),
            author = ?,
            image_url = ?
        WHERE id = ?
    "#,
    )
    .bind(record.title)
    .bind(record.body)
    .bind(record.link)
    .bind(record.created)
    .bind(record.author)
    .bind(record.image_url)
    .bind(entry_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delete every enclosure of `entry_id` and recreate it from `enclosures`.
///
/// Duplicated hrefs in `enclosures` keep their first occurrence.
pub(crate) async fn replace_enclosures(
    conn: &mut SqliteConnection,
    entry_id: i64,
    enclosures: &[NewEnclosure],
) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM enclosures WHERE entry_id = ?")
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;

    for enclosure in enclosures {
        sqlx::query(
            r#"
            INSERT INTO enclosures (entry_id, href, mime_type, length, medium, description)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(entry_id, href) DO NOTHING
        "#,
        )
        .bind(entry_id)
        .bind(&enclosure.href)
        .bind(&enclosure.mime_type)
        .bind(enclosure.length)
        .bind(&enclosure.medium)
        .bind(&enclosure.description)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Number every unindexed entry of the source after `max_index`, oldest first,
/// and persist the new `max_index`. Returns it.
pub(crate) async fn assign_pending_indices(
    conn: &mut SqliteConnection,
    source_id: i64,
    max_index: i64,
) -> Result<i64, DatabaseError> {
    let pending: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM entries WHERE source_id = ? AND idx = 0 ORDER BY created ASC, id ASC",
    )
    .bind(source_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut next = max_index;
    for (entry_id,) in pending {
        next += 1;
        sqlx::query("UPDATE entries SET idx = ? WHERE id = ?")
            .bind(next)
            .bind(entry_id)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("UPDATE sources SET max_index = ? WHERE id = ?")
        .bind(next)
        .bind(source_id)
        .execute(&mut *conn)
        .await?;
    Ok(next)
}

/// Source metadata written back after a successful parse.
pub(crate) async fn update_source_metadata(
    conn: &mut SqliteConnection,
    source: &Source,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        UPDATE sources SET
            name = ?, title = ?, subtitle = ?, site_url = ?, image_url = ?,
            icon_url = ?, author = ?, description = ?
        WHERE id = ?
    "#,
    )
    .bind(&source.name)
    .bind(&source.title)
    .bind(&source.subtitle)
    .bind(&source.site_url)
    .bind(&source.image_url)
    .bind(&source.icon_url)
    .bind(&source.author)
    .bind(&source.description)
    .bind(source.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    pub async fn count_entries(&self, source_id: i64) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM entries WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// All entries of a source in index order (unindexed entries last).
    pub async fn entries_for_source(&self, source_id: i64) -> Result<Vec<Entry>, DatabaseError> {
        let entries = sqlx::query_as::<_, Entry>(
            r#"
            SELECT id, source_id, title, body, link, created, guid, author, image_url, found, idx
            FROM entries
            WHERE source_id = ?
            ORDER BY idx = 0, idx ASC, id ASC
        "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn enclosures_for_entry(
        &self,
        entry_id: i64,
    ) -> Result<Vec<Enclosure>, DatabaseError> {
        let enclosures = sqlx::query_as::<_, Enclosure>(
            r#"
            SELECT id, entry_id, href, mime_type, length, medium, description
            FROM enclosures
            WHERE entry_id = ?
            ORDER BY href ASC
        "#,
        )
        .bind(entry_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(enclosures)
    }

    pub async fn count_enclosures(&self, source_id: i64) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM enclosures
            JOIN entries ON entries.id = enclosures.entry_id
            WHERE entries.source_id = ?
        "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// `created` of the `limit` newest entries of a source, newest first.
    pub async fn recent_entry_times(
        &self,
        source_id: i64,
        limit: i64,
    ) -> Result<Vec<i64>, DatabaseError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "SELECT created FROM entries WHERE source_id = ? ORDER BY created DESC, id DESC LIMIT ?",
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    async fn test_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let source_id = db
            .insert_source("https://example.com/feed.xml", None)
            .await
            .unwrap();
        (db, source_id)
    }

    fn record<'a>(title: &'a str, created: Option<i64>) -> EntryRecord<'a> {
        EntryRecord {
            title,
            body: "",
            link: None,
            created,
            author: None,
            image_url: None,
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

    #[tokio::test]
    async fn test_insert_and_find_entry() {
        let (db, source_id) = test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();

        assert_eq!(find_entry_id(&mut conn, source_id, "g1").await.unwrap(), None);
        let id = insert_entry(&mut conn, source_id, "g1", &record("One", Some(100)), 500)
            .await
            .unwrap();
        assert_eq!(find_entry_id(&mut conn, source_id, "g1").await.unwrap(), Some(id));
        drop(conn);

        let entries = db.entries_for_source(source_id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].created, 100);
        assert_eq!(entries[0].found, 500);
        assert_eq!(entries[0].index, 0);
    }

    #[tokio::test]
    async fn test_update_entry_keeps_found_and_created_when_undated() {
        let (db, source_id) = test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();

        let id = insert_entry(&mut conn, source_id, "g1", &record("Old", Some(100)), 500)
            .await
            .unwrap();
        update_entry(&mut conn, id, &record("New", None)).await.unwrap();
        drop(conn);

        let entry = &db.entries_for_source(source_id).await.unwrap()[0];
        assert_eq!(entry.title, "New");
        assert_eq!(entry.created, 100);
        assert_eq!(entry.found, 500);
    }

    #[tokio::test]
    async fn test_replace_enclosures_drops_stale() {
        let (db, source_id) = test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        let id = insert_entry(&mut conn, source_id, "g1", &record("One", Some(100)), 500)
            .await
            .unwrap();

        replace_enclosures(&mut conn, id, &[enclosure("https://a/1"), enclosure("https://b/2")])
            .await
            .unwrap();
        replace_enclosures(
            &mut conn,
            id,
            &[enclosure("https://a/1"), enclosure("https://c/3"), enclosure("https://c/3")],
        )
        .await
        .unwrap();
        drop(conn);

        let hrefs: Vec<String> = db
            .enclosures_for_entry(id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.href)
            .collect();
        assert_eq!(hrefs, vec!["https://a/1".to_string(), "https://c/3".to_string()]);
        assert_eq!(db.count_enclosures(source_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_assign_pending_indices_orders_by_created() {
        let (db, source_id) = test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();

        insert_entry(&mut conn, source_id, "late", &record("Late", Some(300)), 1)
            .await
            .unwrap();
        insert_entry(&mut conn, source_id, "early", &record("Early", Some(100)), 1)
            .await
            .unwrap();
        let max = assign_pending_indices(&mut conn, source_id, 0).await.unwrap();
        assert_eq!(max, 2);

        insert_entry(&mut conn, source_id, "newest", &record("Newest", Some(50)), 2)
            .await
            .unwrap();
        let max = assign_pending_indices(&mut conn, source_id, max).await.unwrap();
        assert_eq!(max, 3);
        drop(conn);

        let indexed: Vec<(String, i64)> = db
            .entries_for_source(source_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.guid, e.index))
            .collect();
        assert_eq!(
            indexed,
            vec![
                ("early".to_string(), 1),
                ("late".to_string(), 2),
                ("newest".to_string(), 3),
            ]
        );
        let source = db.get_source(source_id).await.unwrap().unwrap();
        assert_eq!(source.max_index, 3);
    }

    #[tokio::test]
    async fn test_recent_entry_times_newest_first() {
        let (db, source_id) = test_db().await;
        let mut conn = db.pool.acquire().await.unwrap();
        for (guid, created) in [("a", 10), ("b", 30), ("c", 20)] {
            insert_entry(&mut conn, source_id, guid, &record(guid, Some(created)), 1)
                .await
                .unwrap();
        }
        drop(conn);

        assert_eq!(db.recent_entry_times(source_id, 2).await.unwrap(), vec![30, 20]);
        assert_eq!(db.count_entries(source_id).await.unwrap(), 3);
    }
}

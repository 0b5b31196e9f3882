use super::schema::Database;
use super::types::{DatabaseError, Source};

const SOURCE_COLUMNS: &str = "id, feed_url, name, title, subtitle, site_url, image_url, icon_url, \
     author, description, last_polled, due_poll, etag, last_modified, last_result, status_code, \
     live, interval, last_success, last_change, last_302_url, last_302_start, max_index, \
     num_subs, is_blocked";

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Import a source, returning its ID.
    ///
    /// Get-or-create by feed URL: an existing source keeps its polling state and
    /// only has its name replaced when one is given.
    pub async fn insert_source(
        &self,
        feed_url: &str,
        name: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (feed_url, name)
            VALUES (?, ?)
            ON CONFLICT(feed_url) DO UPDATE SET
                name = COALESCE(excluded.name, sources.name)
            RETURNING id
        "#,
        )
        .bind(feed_url)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>, DatabaseError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?");
        let source = sqlx::query_as::<_, Source>(&sql)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    pub async fn get_source_by_url(&self, feed_url: &str) -> Result<Option<Source>, DatabaseError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE feed_url = ?");
        let source = sqlx::query_as::<_, Source>(&sql)
            .bind(feed_url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }

    /// Live sources whose `due_poll` has passed, most overdue first.
    pub async fn due_sources(&self, now: i64, limit: i64) -> Result<Vec<Source>, DatabaseError> {
        let sql = format!(
            "SELECT {SOURCE_COLUMNS} FROM sources \
             WHERE live = 1 AND due_poll <= ? \
             ORDER BY due_poll ASC, id ASC \
             LIMIT ?"
        );
        let sources = sqlx::query_as::<_, Source>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    /// Every live source, regardless of when it is due.
    pub async fn live_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE live = 1 ORDER BY due_poll ASC, id ASC");
        let sources = sqlx::query_as::<_, Source>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    /// Persist everything a poll cycle may have changed on a source.
    ///
    /// `max_index` is deliberately absent: it is only ever written inside the
    /// reconciliation transaction together with the entries it numbers.
    pub async fn save_poll_state(&self, source: &Source) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE sources SET
                feed_url = ?,
                name = ?, title = ?, subtitle = ?, site_url = ?, image_url = ?,
                icon_url = ?, author = ?, description = ?,
                last_polled = ?, due_poll = ?, etag = ?, last_modified = ?,
                last_result = ?, status_code = ?, live = ?, interval = ?,
                last_success = ?, last_change = ?, last_302_url = ?, last_302_start = ?,
                is_blocked = ?
            WHERE id = ?
        "#,
        )
        .bind(&source.feed_url)
        .bind(&source.name)
        .bind(&source.title)
        .bind(&source.subtitle)
        .bind(&source.site_url)
        .bind(&source.image_url)
        .bind(&source.icon_url)
        .bind(&source.author)
        .bind(&source.description)
        .bind(source.last_polled)
        .bind(source.due_poll)
        .bind(&source.etag)
        .bind(&source.last_modified)
        .bind(&source.last_result)
        .bind(source.status_code)
        .bind(source.live)
        .bind(source.interval)
        .bind(source.last_success)
        .bind(source.last_change)
        .bind(&source.last_302_url)
        .bind(source.last_302_start)
        .bind(source.is_blocked)
        .bind(source.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a permanent move right away, independently of the rest of the cycle.
    pub async fn update_feed_url(
        &self,
        source_id: i64,
        feed_url: &str,
        last_result: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            UPDATE sources
            SET feed_url = ?, last_result = ?, last_302_url = NULL, last_302_start = NULL
            WHERE id = ?
        "#,
        )
        .bind(feed_url)
        .bind(last_result)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Manually re-enable a source that the fetch state machine disabled.
    ///
    /// Clears the anti-bot flag and makes the source due immediately.
    /// Returns whether a source with this URL exists.
    pub async fn reset_source(&self, feed_url: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE sources SET live = 1, is_blocked = 0, due_poll = 0 WHERE feed_url = ?",
        )
        .bind(feed_url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

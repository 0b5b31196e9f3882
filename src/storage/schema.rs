use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::{is_lock_message, DatabaseError};

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool's
    /// connections, which is what the tests use.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema could not be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: concurrent poll cycles queue on the write lock for
        // up to 5 seconds before SQLITE_BUSY surfaces.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            if is_lock_message(&e.to_string()) {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Start a transaction on the pool.
    pub(crate) async fn begin(&self) -> Result<Transaction<'static, Sqlite>, DatabaseError> {
        Ok(self.pool.begin().await?)
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // due_poll defaults to 0 so newly imported sources go to the front of the queue
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                feed_url TEXT UNIQUE NOT NULL,
                name TEXT,
                title TEXT,
                subtitle TEXT,
                site_url TEXT,
                image_url TEXT,
                icon_url TEXT,
                author TEXT,
                description TEXT,
                last_polled INTEGER,
                due_poll INTEGER NOT NULL DEFAULT 0,
                etag TEXT,
                last_modified TEXT,
                last_result TEXT,
                status_code INTEGER NOT NULL DEFAULT 0,
                live INTEGER NOT NULL DEFAULT 1,
                interval INTEGER NOT NULL DEFAULT 400,
                last_success INTEGER,
                last_change INTEGER,
                last_302_url TEXT,
                last_302_start INTEGER,
                max_index INTEGER NOT NULL DEFAULT 0,
                num_subs INTEGER NOT NULL DEFAULT 1,
                is_blocked INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                title TEXT NOT NULL DEFAULT '',
                body TEXT NOT NULL DEFAULT '',
                link TEXT,
                created INTEGER NOT NULL,
                guid TEXT NOT NULL,
                author TEXT,
                image_url TEXT,
                found INTEGER NOT NULL,
                idx INTEGER NOT NULL DEFAULT 0,
                UNIQUE(source_id, guid)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS enclosures (
                id INTEGER PRIMARY KEY,
                entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
                href TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                length INTEGER NOT NULL DEFAULT 0,
                medium TEXT,
                description TEXT,
                UNIQUE(entry_id, href)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxies (
                id INTEGER PRIMARY KEY,
                address TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Due-source selection: WHERE live = 1 AND due_poll <= ? ORDER BY due_poll
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sources_due ON sources(live, due_poll)")
            .execute(&mut *tx)
            .await?;

        // Index assignment and scheduler history both scan a source's entries by created
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_source_created ON entries(source_id, created)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entries_source_idx ON entries(source_id, idx)")
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_enclosures_entry ON enclosures(entry_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has the database locked
    #[error("Another feedtide process appears to hold the database lock. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) all surface as
/// one of these messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

// ============================================================================
// Data Structures
// ============================================================================

/// Default polling interval (minutes) for a freshly imported source.
pub const DEFAULT_INTERVAL: i64 = 400;

/// A polled feed and its polling state.
///
/// Timestamps are Unix seconds. `interval` is in minutes and is only
/// meaningful to the fetch state machine's back-off model.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Source {
    pub id: i64,
    pub feed_url: String,

    pub name: Option<String>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
    pub icon_url: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,

    pub last_polled: Option<i64>,
    pub due_poll: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_result: Option<String>,
    pub status_code: i64,
    pub live: bool,
    pub interval: i64,
    pub last_success: Option<i64>,
    pub last_change: Option<i64>,
    /// Target of the temporary redirect seen on the previous cycle
    pub last_302_url: Option<String>,
    /// When that temporary redirect was first observed
    pub last_302_start: Option<i64>,

    pub max_index: i64,
    pub num_subs: i64,
    /// Set once the host answered with an anti-bot challenge
    pub is_blocked: bool,
}

impl Source {
    /// An unsaved source for `feed_url` with import-time defaults.
    pub fn new(feed_url: impl Into<String>) -> Self {
        Self {
            id: 0,
            feed_url: feed_url.into(),
            name: None,
            title: None,
            subtitle: None,
            site_url: None,
            image_url: None,
            icon_url: None,
            author: None,
            description: None,
            last_polled: None,
            due_poll: 0,
            etag: None,
            last_modified: None,
            last_result: None,
            status_code: 0,
            live: true,
            interval: DEFAULT_INTERVAL,
            last_success: None,
            last_change: None,
            last_302_url: None,
            last_302_start: None,
            max_index: 0,
            num_subs: 1,
            is_blocked: false,
        }
    }

    /// The name to show for this source: its name, else its site, else its feed URL.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.site_url.as_deref())
            .unwrap_or(&self.feed_url)
    }
}

/// One stored feed item.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Entry {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub body: String,
    pub link: Option<String>,
    pub created: i64,
    pub guid: String,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub found: i64,
    /// 0 until the reconciler assigns the entry its place in the source's sequence
    #[sqlx(rename = "idx")]
    pub index: i64,
}

/// A file attached to an entry.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Enclosure {
    pub id: i64,
    pub entry_id: i64,
    pub href: String,
    pub mime_type: String,
    pub length: i64,
    pub medium: Option<String>,
    pub description: Option<String>,
}

/// A stored candidate proxy. `address` is `host:port`, or [`ProxyAddress::SENTINEL`].
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ProxyAddress {
    pub id: i64,
    pub address: String,
}

impl ProxyAddress {
    /// Placeholder stored after a failed scrape; means "connect directly".
    pub const SENTINEL: &'static str = "X";

    pub fn is_sentinel(&self) -> bool {
        self.address == Self::SENTINEL
    }
}

/// Field values the reconciler writes onto an entry on every pass.
#[derive(Debug, Clone)]
pub struct EntryRecord<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub link: Option<&'a str>,
    pub created: Option<i64>,
    pub author: Option<&'a str>,
    pub image_url: Option<&'a str>,
}

/// An enclosure about to be (re)created for an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEnclosure {
    pub href: String,
    pub mime_type: String,
    pub length: i64,
    pub medium: Option<String>,
    pub description: Option<String>,
}

//! Configuration file parser for ~/.config/feedtide/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Poller configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file. `None` means `~/.config/feedtide/feeds.db`.
    pub database_path: Option<PathBuf>,

    /// Operator identification, the first part of the User-Agent header.
    pub user_agent: String,

    /// Operator URL, quoted in the User-Agent header.
    pub server_url: String,

    /// Relay that fetches anti-bot protected feeds on our behalf.
    /// When set, blocked sources go through `{relay_url}/read/?target={feed_url}`
    /// instead of the proxy pool.
    pub relay_url: Option<String>,

    /// Plain-text list of `host:port` proxies, one per line.
    pub proxy_list_url: String,

    /// Timeout for feed, redirect and pagination fetches.
    pub request_timeout_secs: u64,

    /// Timeout for fetching the proxy list.
    pub proxy_scrape_timeout_secs: u64,

    /// How many due sources one batch polls.
    pub max_feeds_per_batch: u32,

    /// How many sources of a batch are polled at once.
    pub concurrency: usize,

    /// Presentational attributes stripped from entry HTML.
    pub denied_attributes: Vec<String>,

    /// Overwrite source metadata from the feed on every successful parse,
    /// rather than only filling in empty fields.
    pub force_update_source_fields: bool,

    /// Placeholders stored when the proxy list cannot be scraped.
    pub sentinel_proxy_count: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            user_agent: format!("feedtide/{}", env!("CARGO_PKG_VERSION")),
            server_url: "https://github.com/feedtide/feedtide".to_string(),
            relay_url: None,
            proxy_list_url:
                "https://raw.githubusercontent.com/clarketm/proxy-list/master/proxy-list.txt"
                    .to_string(),
            request_timeout_secs: 20,
            proxy_scrape_timeout_secs: 30,
            max_feeds_per_batch: 10,
            concurrency: 4,
            denied_attributes: ["align", "hspace", "vspace", "border", "width", "height"]
                .into_iter()
                .map(String::from)
                .collect(),
            force_update_source_fields: true,
            sentinel_proxy_count: 20,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 12] = [
        "database_path",
        "user_agent",
        "server_url",
        "relay_url",
        "proxy_list_url",
        "request_timeout_secs",
        "proxy_scrape_timeout_secs",
        "max_feeds_per_batch",
        "concurrency",
        "denied_attributes",
        "force_update_source_fields",
        "sentinel_proxy_count",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text. Blank text yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let mut config: Config = toml::from_str(content)?;
        if config.concurrency == 0 {
            tracing::warn!("concurrency = 0 in config file, using 1");
            config.concurrency = 1;
        }
        tracing::info!(
            concurrency = config.concurrency,
            batch = config.max_feeds_per_batch,
            relay = config.relay_url.is_some(),
            "Loaded configuration"
        );
        Ok(config)
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Small helpers shared by the poller.
//!
//! - **Text**: character-safe truncation and control-character stripping for
//!   values stored in `last_result`
//! - **URLs**: feed URL validation at import and `host:port` checks for proxies

mod feed_url;
mod text;

pub use feed_url::{is_host_port, validate_feed_url, FeedUrlError};
pub use text::{collapse_whitespace, strip_control_chars, truncate_chars};

/// Longest `last_result` stored on a source.
pub const MAX_RESULT_LENGTH: usize = 255;

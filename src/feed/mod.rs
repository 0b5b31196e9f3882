//! Fetching and reading feeds.
//!
//! - [`client`] - conditional HTTP GET with per-source agent and proxy choice
//! - [`proxy`] - the rotating proxy pool for anti-bot blocked sources
//! - [`outcome`] - the decision table that turns a response into source state
//! - [`parser`] - RSS/Atom (via `feed-rs`) and JSON Feed into one document model
//! - [`sanitize`] - HTML cleaning for entry bodies

mod agent;
mod client;
pub mod outcome;
mod parser;
mod proxy;
mod sanitize;

pub use agent::{operator_agent, AgentSource, FixedAgent, RandomBrowserAgents};
pub use client::{relay_target, FetchClient, FetchError, Fetched, FetchedResponse};
pub use outcome::{Disposition, Next, ParseOutcome, Verdict};
pub use parser::{
    detect_format, parse, FeedDocument, FeedFormat, FeedMeta, ParseError, ParsedEntry,
    DEFAULT_ENCLOSURE_TYPE,
};
pub use proxy::{parse_proxy_list, ProxyPool};
pub use sanitize::{site_origin, Sanitizer};

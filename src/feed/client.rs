use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::{
    HeaderMap, CACHE_CONTROL, IF_MODIFIED_SINCE, IF_NONE_MATCH, PRAGMA, USER_AGENT,
};
use reqwest::redirect::Policy;
use thiserror::Error;

use super::agent::{operator_agent, AgentSource};
use super::proxy::ProxyPool;
use crate::config::Config;
use crate::storage::{ProxyAddress, Source};

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Transport-level failures. No HTTP status was obtained.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, reset)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// No response within the configured timeout
    #[error("Request timed out")]
    Timeout,
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// A proxied client could not be built for this address
    #[error("Invalid proxy {address}: {reason}")]
    InvalidProxy { address: String, reason: String },
}

/// Everything the fetch state machine needs from one response.
#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Final URL, after any redirects the client followed itself
    pub url: String,
}

impl FetchedResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The result of the first request of a cycle.
#[derive(Debug)]
pub struct Fetched {
    /// Proxy the request went through; a sentinel here means "tried, but
    /// there was no real proxy to use"
    pub proxy: Option<ProxyAddress>,
    /// User-Agent sent, reused for redirect and pagination requests
    pub agent: String,
    pub outcome: Result<FetchedResponse, FetchError>,
}

/// Conditional HTTP GET for feeds.
///
/// The primary request never follows redirects, because the state machine
/// decides what each 3xx means. Redirect targets and pagination links go
/// through a second client that does follow them.
pub struct FetchClient {
    direct: reqwest::Client,
    following: reqwest::Client,
    proxies: Arc<ProxyPool>,
    agents: Arc<dyn AgentSource>,
    user_agent: String,
    server_url: String,
    relay_url: Option<String>,
    timeout: Duration,
}

impl FetchClient {
    pub fn new(
        config: &Config,
        proxies: Arc<ProxyPool>,
        agents: Arc<dyn AgentSource>,
    ) -> Result<Self, FetchError> {
        let direct = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()?;
        let following = reqwest::Client::builder().build()?;

        Ok(Self {
            direct,
            following,
            proxies,
            agents,
            user_agent: config.user_agent.clone(),
            server_url: config.server_url.clone(),
            relay_url: config
                .relay_url
                .as_ref()
                .map(|r| r.trim_end_matches('/').to_string()),
            timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// Fetch a source's feed once.
    ///
    /// Sends the stored cache validators unless `no_cache` is set, in which
    /// case it asks intermediaries for a fresh copy instead. Blocked sources
    /// get a browser User-Agent and go through the relay when one is
    /// configured, else through a pooled proxy.
    pub async fn fetch(&self, source: &Source, no_cache: bool) -> Fetched {
        let agent = if source.is_blocked {
            self.agents.browser_agent()
        } else {
            operator_agent(&self.user_agent, &self.server_url, source.num_subs)
        };

        let mut target = source.feed_url.clone();
        let mut proxy = None;
        if source.is_blocked {
            if let Some(relay) = &self.relay_url {
                target = relay_target(relay, &source.feed_url);
            } else {
                match self.proxies.acquire().await {
                    Ok(p) => proxy = Some(p),
                    Err(e) => {
                        tracing::warn!(source_id = source.id, error = %e, "Could not acquire a proxy, connecting directly");
                    }
                }
            }
        }

        let outcome = self
            .send(source, &target, &agent, proxy.as_ref(), no_cache)
            .await;
        Fetched {
            proxy,
            agent,
            outcome,
        }
    }

    async fn send(
        &self,
        source: &Source,
        target: &str,
        agent: &str,
        proxy: Option<&ProxyAddress>,
        no_cache: bool,
    ) -> Result<FetchedResponse, FetchError> {
        let proxied_client;
        let client = match proxy {
            Some(p) if !p.is_sentinel() => {
                proxied_client = proxied(&p.address)?;
                &proxied_client
            }
            _ => &self.direct,
        };

        let mut request = client.get(target).header(USER_AGENT, agent);
        if no_cache {
            request = request
                .header(CACHE_CONTROL, "no-cache,max-age=0")
                .header(PRAGMA, "no-cache");
        } else {
            if let Some(etag) = &source.etag {
                request = request.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = &source.last_modified {
                request = request.header(IF_MODIFIED_SINCE, modified.as_str());
            }
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)??;
        read_response(response, self.timeout).await
    }

    /// GET a redirect target or pagination link, following further redirects.
    pub async fn get_following(
        &self,
        url: &str,
        agent: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let request = self.following.get(url).header(USER_AGENT, agent);
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout)??;
        read_response(response, self.timeout).await
    }
}

/// Rewrite a feed URL to go through the bypass relay.
pub fn relay_target(relay: &str, feed_url: &str) -> String {
    format!("{relay}/read/?target={feed_url}")
}

fn proxied(address: &str) -> Result<reqwest::Client, FetchError> {
    let invalid = |e: reqwest::Error| FetchError::InvalidProxy {
        address: address.to_string(),
        reason: e.to_string(),
    };
    let proxy = reqwest::Proxy::all(format!("http://{address}")).map_err(invalid)?;
    reqwest::Client::builder()
        .proxy(proxy)
        .redirect(Policy::none())
        .build()
        .map_err(invalid)
}

async fn read_response(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<FetchedResponse, FetchError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let url = response.url().to_string();
    let body = tokio::time::timeout(timeout, read_limited_bytes(response, MAX_FEED_SIZE))
        .await
        .map_err(|_| FetchError::Timeout)??;

    Ok(FetchedResponse {
        status,
        headers,
        body,
        url,
    })
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}

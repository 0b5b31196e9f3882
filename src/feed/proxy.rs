use std::time::Duration;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::storage::{Database, DatabaseError, ProxyAddress};
use crate::util::is_host_port;

/// Rotating set of outbound proxies for anti-bot blocked sources.
///
/// `acquire` and `burn` run under one lock, so a proxy that has been burned is
/// never handed out again and an empty pool is only replenished once.
pub struct ProxyPool {
    db: Database,
    client: reqwest::Client,
    list_url: String,
    scrape_timeout: Duration,
    sentinel_count: usize,
    lock: Mutex<()>,
}

impl ProxyPool {
    pub fn new(db: Database, client: reqwest::Client, config: &Config) -> Self {
        Self {
            db,
            client,
            list_url: config.proxy_list_url.clone(),
            scrape_timeout: Duration::from_secs(config.proxy_scrape_timeout_secs),
            sentinel_count: config.sentinel_proxy_count.max(1) as usize,
            lock: Mutex::new(()),
        }
    }

    /// The proxy to use next.
    ///
    /// Never comes back empty: when the store is empty it scrapes the public
    /// list, and when that yields nothing it stores sentinels. A sentinel means
    /// "connect directly".
    pub async fn acquire(&self) -> Result<ProxyAddress, DatabaseError> {
        let _guard = self.lock.lock().await;

        if let Some(proxy) = self.db.first_proxy().await? {
            return Ok(proxy);
        }

        let scraped = self.scrape().await;
        if scraped.is_empty() {
            let sentinels = vec![ProxyAddress::SENTINEL.to_string(); self.sentinel_count];
            self.db.insert_proxies(&sentinels).await?;
            tracing::info!(count = self.sentinel_count, "No proxies found, storing placeholders");
        } else {
            let stored = self.db.insert_proxies(&scraped).await?;
            tracing::info!(count = stored, "Stored scraped proxies");
        }

        Ok(self.db.first_proxy().await?.unwrap_or(ProxyAddress {
            id: 0,
            address: ProxyAddress::SENTINEL.to_string(),
        }))
    }

    /// Drop a proxy that failed or got blocked.
    pub async fn burn(&self, proxy: &ProxyAddress) -> Result<(), DatabaseError> {
        let _guard = self.lock.lock().await;
        self.db.delete_proxy(proxy.id).await?;
        tracing::info!(proxy = %proxy.address, "Burned proxy");
        Ok(())
    }

    /// Delete sentinels so the next batch tries the scrape again.
    pub async fn purge_sentinels(&self) -> Result<u64, DatabaseError> {
        let _guard = self.lock.lock().await;
        let removed = self.db.delete_sentinel_proxies().await?;
        if removed > 0 {
            tracing::debug!(removed = removed, "Removed placeholder proxies");
        }
        Ok(removed)
    }

    /// Fetch the public list. Any failure yields an empty list.
    async fn scrape(&self) -> Vec<String> {
        tracing::info!(url = %self.list_url, "Looking for proxies");

        let response =
            match tokio::time::timeout(self.scrape_timeout, self.client.get(&self.list_url).send())
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "Proxy scrape error");
                    return Vec::new();
                }
                Err(_) => {
                    tracing::warn!("Proxy scrape timed out");
                    return Vec::new();
                }
            };

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Proxy list unavailable");
            return Vec::new();
        }

        match tokio::time::timeout(self.scrape_timeout, response.text()).await {
            Ok(Ok(text)) => parse_proxy_list(&text),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Proxy scrape error");
                Vec::new()
            }
            Err(_) => {
                tracing::warn!("Proxy scrape timed out");
                Vec::new()
            }
        }
    }
}

/// Pull `host:port` addresses out of a proxy list.
///
/// Each line contributes its first whitespace-separated token if that token is
/// a well-formed `host:port`; header and annotation lines fall out naturally.
pub fn parse_proxy_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|token| is_host_port(token))
        .map(String::from)
        .collect()
}

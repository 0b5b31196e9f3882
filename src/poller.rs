use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use url::Url;

use crate::config::Config;
use crate::feed::outcome::{
    capture_cache_headers, clamp_interval, classify_response, classify_transport,
    record_parse, record_redirect_follow, set_result,
};
use crate::feed::{
    parse, AgentSource, Disposition, FeedDocument, FetchClient, FetchError, Fetched,
    FetchedResponse, Next, ParseError, ParseOutcome, ProxyPool, RandomBrowserAgents, Sanitizer,
};
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::schedule::{penalty_due, predict_due, HISTORY_SIZE};
use crate::storage::{Database, DatabaseError, Source};

/// Most pagination links followed on a source's first successful parse.
const MAX_PAGES: usize = 100;

#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("Could not build HTTP client: {0}")]
    Client(#[from] FetchError),
    #[error("No source with id {0}")]
    SourceNotFound(i64),
    #[error("Source {0} is already being polled")]
    AlreadyPolling(i64),
}

/// What one poll cycle left behind on the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub source_id: i64,
    pub status_code: i64,
    pub last_result: Option<String>,
    pub live: bool,
    pub new_entries: usize,
    pub changed: bool,
    pub due_poll: i64,
}

/// Runs poll cycles: one source at a time, or due batches with bounded
/// parallelism. At most one cycle per source is in flight.
pub struct Poller {
    db: Database,
    client: FetchClient,
    proxies: Arc<ProxyPool>,
    sanitizer: Sanitizer,
    reconciler: Reconciler,
    concurrency: usize,
    batch_size: i64,
    in_flight: Mutex<HashSet<i64>>,
}

/// Releases a source's in-flight claim when the cycle ends, however it ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    source_id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.source_id);
    }
}

impl Poller {
    pub fn new(db: Database, config: &Config) -> Result<Self, PollError> {
        Self::with_agents(db, config, Arc::new(RandomBrowserAgents))
    }

    pub fn with_agents(
        db: Database,
        config: &Config,
        agents: Arc<dyn AgentSource>,
    ) -> Result<Self, PollError> {
        let scrape_client = reqwest::Client::builder()
            .build()
            .map_err(FetchError::from)?;
        let proxies = Arc::new(ProxyPool::new(db.clone(), scrape_client, config));
        let client = FetchClient::new(config, Arc::clone(&proxies), agents)?;

        Ok(Self {
            db,
            client,
            proxies,
            sanitizer: Sanitizer::new(&config.denied_attributes),
            reconciler: Reconciler::new(config.force_update_source_fields),
            concurrency: config.concurrency.max(1),
            batch_size: i64::from(config.max_feeds_per_batch),
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    /// Poll the due batch (ascending `due_poll`), then drop placeholder
    /// proxies so the next batch tries a fresh scrape.
    pub async fn poll_due(&self, no_cache: bool) -> Result<Vec<PollReport>, PollError> {
        let due = self
            .db
            .due_sources(Utc::now().timestamp(), self.batch_size)
            .await?;
        tracing::info!(count = due.len(), "Polling due sources");

        let reports = self.poll_batch(due, no_cache).await;
        self.proxies.purge_sentinels().await?;
        Ok(reports)
    }

    /// Poll every live source regardless of schedule.
    pub async fn poll_all(&self, no_cache: bool) -> Result<Vec<PollReport>, PollError> {
        let sources = self.db.live_sources().await?;
        tracing::info!(count = sources.len(), "Polling all live sources");

        let reports = self.poll_batch(sources, no_cache).await;
        self.proxies.purge_sentinels().await?;
        Ok(reports)
    }

    async fn poll_batch(&self, sources: Vec<Source>, no_cache: bool) -> Vec<PollReport> {
        stream::iter(sources)
            .map(|source| async move {
                let source_id = source.id;
                (source_id, self.poll_source(source_id, no_cache).await)
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|(source_id, result)| async move {
                match result {
                    Ok(report) => Some(report),
                    Err(e) => {
                        tracing::warn!(source_id = source_id, error = %e, "Poll failed");
                        None
                    }
                }
            })
            .collect()
            .await
    }

    /// Run one full cycle for a source: fetch, classify, follow, parse,
    /// reconcile, schedule, persist.
    ///
    /// HTTP and parse failures are recorded on the source and still return a
    /// report. Only database failures and a concurrent cycle on the same
    /// source are errors.
    pub async fn poll_source(&self, source_id: i64, no_cache: bool) -> Result<PollReport, PollError> {
        let _claim = self.claim(source_id)?;
        let mut source = self
            .db
            .get_source(source_id)
            .await?
            .ok_or(PollError::SourceNotFound(source_id))?;

        self.run_cycle(&mut source, no_cache).await
    }

    fn claim(&self, source_id: i64) -> Result<InFlight<'_>, PollError> {
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(source_id) {
            return Err(PollError::AlreadyPolling(source_id));
        }
        Ok(InFlight {
            set: &self.in_flight,
            source_id,
        })
    }

    async fn run_cycle(&self, source: &mut Source, no_cache: bool) -> Result<PollReport, PollError> {
        let now = Utc::now();
        let interval_before = source.interval;
        let had_entries = self.db.count_entries(source.id).await? > 0;
        source.last_polled = Some(now.timestamp());

        tracing::info!(source_id = source.id, url = %source.feed_url, blocked = source.is_blocked, "Polling source");

        let Fetched {
            proxy,
            agent,
            outcome,
        } = self.client.fetch(source, no_cache).await;
        let proxied = proxy.as_ref().is_some_and(|p| !p.is_sentinel());
        let original_url = source.feed_url.clone();

        let verdict = match &outcome {
            Err(e) => classify_transport(source, e, proxied),
            Ok(response) => classify_response(source, response, proxied, now),
        };
        tracing::debug!(source_id = source.id, disposition = ?verdict.disposition, "Classified response");

        if verdict.burn_proxy {
            if let Some(proxy) = &proxy {
                if let Err(e) = self.proxies.burn(proxy).await {
                    tracing::warn!(proxy = %proxy.address, error = %e, "Failed to burn proxy");
                }
            }
        }

        let mut to_parse: Option<(FetchedResponse, bool)> = None;
        match verdict.next {
            Next::Finish => {
                if let Disposition::Moved(target) = &verdict.disposition {
                    self.persist_move(source, &original_url, target).await;
                }
            }
            Next::Follow(target) => match self.client.get_following(&target, &agent).await {
                Ok(response) => {
                    if record_redirect_follow(source, &target, Ok(response.status), now) {
                        self.persist_move(source, &original_url, &target).await;
                    }
                    if response.is_success() {
                        to_parse = Some((response, true));
                    }
                }
                Err(e) => {
                    record_redirect_follow(source, &target, Err(e.to_string()), now);
                }
            },
            Next::Parse => to_parse = outcome.ok().map(|response| (response, false)),
        }

        let mut summary = ReconcileSummary::default();
        let mut parse_outcome = None;
        if let Some((response, via_temporary_redirect)) = to_parse {
            capture_cache_headers(source, &response.headers, via_temporary_redirect);
            let (outcome, reconciled) = self
                .parse_and_reconcile(source, &response, &agent, had_entries, now)
                .await;
            record_parse(source, &outcome, now);
            summary = reconciled;
            parse_outcome = Some(outcome);
        }

        clamp_interval(source);

        let reached_server = verdict.disposition == Disposition::NotModified
            || matches!(
                parse_outcome,
                Some(ParseOutcome::Updated | ParseOutcome::Unchanged)
            );
        source.due_poll = if reached_server {
            let history = self.db.recent_entry_times(source.id, HISTORY_SIZE).await?;
            predict_due(&history, now)
        } else {
            penalty_due(now, source.interval)
        };

        self.db.save_poll_state(source).await?;

        tracing::info!(
            source_id = source.id,
            status = source.status_code,
            result = source.last_result.as_deref().unwrap_or_default(),
            new_entries = summary.new_entries,
            interval_before = interval_before,
            interval = source.interval,
            due_poll = source.due_poll,
            "Poll finished"
        );

        Ok(PollReport {
            source_id: source.id,
            status_code: source.status_code,
            last_result: source.last_result.clone(),
            live: source.live,
            new_entries: summary.new_entries,
            changed: summary.changed,
            due_poll: source.due_poll,
        })
    }

    /// Write a permanent move right away. Another source may already own the
    /// target URL, in which case the move is abandoned.
    async fn persist_move(&self, source: &mut Source, original_url: &str, target: &str) {
        let result = source.last_result.clone().unwrap_or_default();
        if let Err(e) = self.db.update_feed_url(source.id, target, &result).await {
            tracing::warn!(source_id = source.id, target = %target, error = %e, "Could not record moved feed");
            source.feed_url = original_url.to_string();
            set_result(source, &format!("Error redirecting feed to {target}"));
            return;
        }
        tracing::info!(source_id = source.id, from = %original_url, to = %target, "Feed moved");
        source.last_302_url = None;
        source.last_302_start = None;
    }

    async fn parse_and_reconcile(
        &self,
        source: &mut Source,
        response: &FetchedResponse,
        agent: &str,
        had_entries: bool,
        now: DateTime<Utc>,
    ) -> (ParseOutcome, ReconcileSummary) {
        let content_type = response.header("content-type").unwrap_or_default();
        let first = match parse(&response.body, content_type, &self.sanitizer, &source.feed_url) {
            Ok(document) => document,
            Err(ParseError::Empty) => return (ParseOutcome::Empty, ReconcileSummary::default()),
            Err(e) => {
                tracing::warn!(source_id = source.id, error = %e, "Feed did not parse");
                return (ParseOutcome::Failed(e.to_string()), ReconcileSummary::default());
            }
        };
        if first.expired {
            return (ParseOutcome::Expired, ReconcileSummary::default());
        }

        let mut pages = vec![first];
        if !had_entries {
            self.follow_pages(&mut pages, &source.feed_url, agent).await;
        }

        match self.reconciler.reconcile(&self.db, source, &pages, now).await {
            Ok(summary) if summary.changed => (ParseOutcome::Updated, summary),
            Ok(summary) => (ParseOutcome::Unchanged, summary),
            Err(e) => {
                tracing::warn!(source_id = source.id, error = %e, "Reconcile failed");
                (
                    ParseOutcome::Failed(format!("Reconcile error: {e}")),
                    ReconcileSummary::default(),
                )
            }
        }
    }

    /// Follow `rel=next` links from the last page, appending each page parsed.
    async fn follow_pages(&self, pages: &mut Vec<FeedDocument>, feed_url: &str, agent: &str) {
        let mut current = Url::parse(feed_url).map_or_else(|_| feed_url.to_string(), String::from);
        let mut visited = HashSet::from([current.clone()]);

        for _ in 0..MAX_PAGES {
            let Some(href) = pages.last().and_then(|p| p.next_page.clone()) else {
                break;
            };
            // Relative hrefs resolve against the page that linked them
            let next = match Url::parse(&current).and_then(|base| base.join(&href)) {
                Ok(url) => url.to_string(),
                Err(e) => {
                    tracing::debug!(url = %href, error = %e, "Unusable next page link");
                    break;
                }
            };
            if !visited.insert(next.clone()) {
                break;
            }
            current = next.clone();

            let response = match self.client.get_following(&next, agent).await {
                Ok(response) if response.is_success() => response,
                Ok(response) => {
                    tracing::debug!(url = %next, status = response.status, "Stopped paging");
                    break;
                }
                Err(e) => {
                    tracing::debug!(url = %next, error = %e, "Stopped paging");
                    break;
                }
            };

            let content_type = response.header("content-type").unwrap_or_default();
            match parse(&response.body, content_type, &self.sanitizer, &next) {
                Ok(page) if !page.expired => pages.push(page),
                Ok(_) => break,
                Err(e) => {
                    tracing::debug!(url = %next, error = %e, "Stopped paging");
                    break;
                }
            }
        }

        if pages.len() > 1 {
            tracing::info!(pages = pages.len(), "Followed feed pagination");
        }
    }
}

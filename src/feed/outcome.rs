//! Fetch outcome state machine.
//!
//! Pure functions that turn one fetch (and, for temporary redirects, the
//! follow-up request) into changes on a [`Source`]: status code, diagnostic,
//! back-off interval, liveness and the anti-bot flag. Nothing here touches the
//! network or the database; the poller applies the side effects a
//! [`Verdict`] asks for.

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, ETAG, LAST_MODIFIED, LOCATION, SERVER};
use url::Url;

use super::client::{FetchError, FetchedResponse};
use crate::storage::Source;
use crate::util::{strip_control_chars, truncate_chars, MAX_RESULT_LENGTH};

/// Shortest back-off interval, in minutes.
pub const MIN_INTERVAL: i64 = 60;
/// Longest back-off interval, in minutes.
pub const MAX_INTERVAL: i64 = 24 * 60;

/// `status_code` recorded when no HTTP response was obtained.
pub const STATUS_TRANSPORT_FAILED: i64 = 0;
/// `status_code` recorded when a request through a proxy failed.
pub const STATUS_PROXY_FAILED: i64 = 1;

const PENALTY: i64 = 120;
const NOT_MODIFIED_STEP: i64 = 10;
const UNCHANGED_STEP: i64 = 20;
const FAILED_REDIRECT_STEP: i64 = 60;

/// A 304 streak longer than this clears the cache validators.
const STALE_VALIDATORS_SECS: i64 = 7 * 24 * 60 * 60;
/// A temporary redirect observed for this long becomes permanent.
const REDIRECT_PROMOTION_SECS: i64 = 60 * 24 * 60 * 60;

/// What happened to the first request of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    ProxyFailed,
    TransportFailed,
    ServerError(u16),
    NotFound,
    Gone,
    /// Blocked again while already going through a proxy
    StillBlocked,
    Blocked,
    Forbidden,
    BadRequest(u16),
    NotModified,
    Moved(String),
    MovedWithoutLocation,
    /// Location could not be resolved against the feed URL
    BadRedirect(String),
    TemporaryRedirect(String),
    Fetched,
    Unhandled(u16),
}

/// What the poller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    Finish,
    /// GET this URL (following redirects) and record the result
    Follow(String),
    /// Parse the response body
    Parse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub disposition: Disposition,
    /// The proxy used for this request should never be handed out again
    pub burn_proxy: bool,
    pub next: Next,
}

impl Verdict {
    fn finish(disposition: Disposition) -> Self {
        Self {
            disposition,
            burn_proxy: false,
            next: Next::Finish,
        }
    }

    fn burn(disposition: Disposition) -> Self {
        Self {
            disposition,
            burn_proxy: true,
            next: Next::Finish,
        }
    }
}

/// Result of parsing and reconciling a 2xx body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Updated,
    Unchanged,
    Expired,
    Empty,
    Failed(String),
}

/// Store a diagnostic, cleaned and cut to the column size.
pub fn set_result(source: &mut Source, message: &str) {
    let clean = strip_control_chars(message);
    source.last_result = Some(truncate_chars(clean.trim(), MAX_RESULT_LENGTH).into_owned());
}

/// A request produced no HTTP response at all.
///
/// Through a real proxy the proxy is blamed: it gets burned and the source is
/// retried sooner. Otherwise the source is penalised.
pub fn classify_transport(source: &mut Source, error: &FetchError, proxied: bool) -> Verdict {
    if proxied {
        source.status_code = STATUS_PROXY_FAILED;
        source.interval /= 2;
        set_result(source, "Proxy failed. Next retry will use new proxy");
        Verdict::burn(Disposition::ProxyFailed)
    } else {
        source.status_code = STATUS_TRANSPORT_FAILED;
        source.interval += PENALTY;
        set_result(source, &format!("Fetch error: {error}"));
        Verdict::finish(Disposition::TransportFailed)
    }
}

/// Apply the decision table to the first (unfollowed) response of a cycle.
pub fn classify_response(
    source: &mut Source,
    response: &FetchedResponse,
    proxied: bool,
    now: DateTime<Utc>,
) -> Verdict {
    let status = response.status;
    source.status_code = i64::from(status);
    set_result(source, "Unhandled Case");

    match status {
        s if !(200..500).contains(&s) => {
            source.interval += PENALTY;
            set_result(source, &format!("Server error fetching feed ({s})"));
            Verdict::finish(Disposition::ServerError(s))
        }
        404 => {
            source.interval += PENALTY;
            set_result(source, "The feed could not be found");
            Verdict::finish(Disposition::NotFound)
        }
        410 => {
            source.live = false;
            set_result(source, "Feed has gone away and says it isn't coming back.");
            Verdict::finish(Disposition::Gone)
        }
        403 if is_anti_bot(response) => {
            if source.is_blocked && proxied {
                source.interval /= 2;
                set_result(source, "Proxy kind of worked but still got cloudflared.");
                Verdict::burn(Disposition::StillBlocked)
            } else {
                source.is_blocked = true;
                set_result(source, "Blocked by Cloudflare (grr)");
                Verdict::finish(Disposition::Blocked)
            }
        }
        403 => {
            source.live = false;
            set_result(source, "Feed is no longer accessible.");
            Verdict::finish(Disposition::Forbidden)
        }
        400..=499 => {
            source.live = false;
            set_result(source, &format!("Bad request ({status})"));
            Verdict::finish(Disposition::BadRequest(status))
        }
        304 => {
            source.interval += NOT_MODIFIED_STEP;
            set_result(source, "Not modified");
            let stale = source
                .last_success
                .is_some_and(|t| now.timestamp() - t > STALE_VALIDATORS_SECS);
            if stale {
                source.etag = None;
                source.last_modified = None;
                set_result(source, "Clearing etag/last modified due to lack of changes");
            }
            Verdict::finish(Disposition::NotModified)
        }
        301 | 308 => match response.header(LOCATION.as_str()) {
            None => {
                set_result(source, "Feed has moved but no location provided");
                Verdict::finish(Disposition::MovedWithoutLocation)
            }
            Some(location) => match resolve_location(&source.feed_url, location) {
                Some(target) => {
                    source.feed_url = target.clone();
                    set_result(source, "Moved");
                    Verdict::finish(Disposition::Moved(target))
                }
                None => {
                    set_result(source, &format!("Error redirecting feed to {location}"));
                    Verdict::finish(Disposition::BadRedirect(location.to_string()))
                }
            },
        },
        302 | 303 | 307 => {
            let location = response.header(LOCATION.as_str()).unwrap_or_default();
            match resolve_location(&source.feed_url, location) {
                Some(target) if !location.is_empty() => Verdict {
                    disposition: Disposition::TemporaryRedirect(target.clone()),
                    burn_proxy: false,
                    next: Next::Follow(target),
                },
                _ => {
                    source.interval += FAILED_REDIRECT_STEP;
                    if location.is_empty() {
                        set_result(source, "Failed Redirection: no location provided");
                    } else {
                        set_result(source, &format!("Failed Redirection to {location}"));
                    }
                    Verdict::finish(Disposition::BadRedirect(location.to_string()))
                }
            }
        }
        200..=299 => Verdict {
            disposition: Disposition::Fetched,
            burn_proxy: false,
            next: Next::Parse,
        },
        other => Verdict::finish(Disposition::Unhandled(other)),
    }
}

/// Record the follow-up request of a temporary redirect.
///
/// `result` is the followed status, or an error description when the request
/// failed. Returns true when a redirect seen for long enough was promoted to
/// the source's permanent URL.
pub fn record_redirect_follow(
    source: &mut Source,
    target: &str,
    result: Result<u16, String>,
    now: DateTime<Utc>,
) -> bool {
    let status = match result {
        Ok(status) => status,
        Err(error) => {
            source.interval += FAILED_REDIRECT_STEP;
            set_result(source, &format!("Failed Redirection to {target} {error}"));
            return false;
        }
    };
    source.status_code = i64::from(status);

    let same_target = source.last_302_url.as_deref() == Some(target);
    match source.last_302_start {
        Some(start) if same_target => {
            if now.timestamp() - start >= REDIRECT_PROMOTION_SECS {
                source.feed_url = target.to_string();
                source.last_302_url = None;
                source.last_302_start = None;
                set_result(source, &format!("Permanent Redirect to {target}"));
                return true;
            }
            set_result(source, &redirect_since(target, start));
        }
        _ => {
            source.last_302_url = Some(target.to_string());
            source.last_302_start = Some(now.timestamp());
            set_result(source, &redirect_since(target, now.timestamp()));
        }
    }
    false
}

fn redirect_since(target: &str, start: i64) -> String {
    match DateTime::<Utc>::from_timestamp(start, 0) {
        Some(start) => format!("Temporary Redirect to {target} since {}", start.format("%d %B")),
        None => format!("Temporary Redirect to {target}"),
    }
}

/// Keep the validators of a 2xx response for the next conditional request.
///
/// Validators that came from a temporary redirect target belong to that
/// target, so they are dropped instead.
pub fn capture_cache_headers(source: &mut Source, headers: &HeaderMap, via_temporary_redirect: bool) {
    if via_temporary_redirect {
        source.etag = None;
        source.last_modified = None;
        return;
    }
    let value = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    source.etag = value(ETAG);
    source.last_modified = value(LAST_MODIFIED);
}

/// Apply the result of parsing a 2xx body.
pub fn record_parse(source: &mut Source, outcome: &ParseOutcome, now: DateTime<Utc>) {
    match outcome {
        ParseOutcome::Updated => {
            source.interval /= 2;
            source.last_change = Some(now.timestamp());
            source.last_success = Some(now.timestamp());
            set_result(source, "OK (updated)");
        }
        ParseOutcome::Unchanged => {
            source.interval += UNCHANGED_STEP;
            source.last_success = Some(now.timestamp());
            set_result(source, "OK");
        }
        ParseOutcome::Expired => {
            source.interval = MAX_INTERVAL;
            source.last_success = Some(now.timestamp());
            set_result(source, "This feed has expired");
        }
        ParseOutcome::Empty => {
            source.interval += PENALTY;
            set_result(source, "Feed is empty");
        }
        ParseOutcome::Failed(message) => {
            source.interval += PENALTY;
            set_result(source, message);
        }
    }
}

pub fn clamp_interval(source: &mut Source) {
    source.interval = source.interval.clamp(MIN_INTERVAL, MAX_INTERVAL);
}

/// Markers of an anti-bot interstitial on a 403.
fn is_anti_bot(response: &FetchedResponse) -> bool {
    let in_body = String::from_utf8_lossy(&response.body).contains("Cloudflare");
    let in_server = response
        .header(SERVER.as_str())
        .is_some_and(|s| s.to_ascii_lowercase().contains("cloudflare"));
    in_body || in_server
}

/// Resolve a `Location` header against the feed URL.
fn resolve_location(feed_url: &str, location: &str) -> Option<String> {
    let location = location.trim();
    if location.is_empty() {
        return None;
    }
    match Url::parse(feed_url) {
        Ok(base) => base.join(location).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(location).ok().map(|u| u.to_string()),
    }
}

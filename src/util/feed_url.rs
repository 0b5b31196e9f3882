use thiserror::Error;
use url::Url;

/// Why a string was refused as a feed URL.
#[derive(Error, Debug)]
pub enum FeedUrlError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    #[error("URL has no host")]
    MissingHost,
}

/// Check that `url_str` is an absolute http(s) URL with a host.
///
/// No normalization happens here: the caller stores exactly what it gave.
pub fn validate_feed_url(url_str: &str) -> Result<Url, FeedUrlError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(FeedUrlError::UnsupportedScheme(scheme.to_owned())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(FeedUrlError::MissingHost);
    }
    Ok(url)
}

/// Whether `candidate` is `host:port` with a non-empty host and a valid port.
pub fn is_host_port(candidate: &str) -> bool {
    let Some((host, port)) = candidate.rsplit_once(':') else {
        return false;
    };
    !host.is_empty()
        && !host.contains(['/', '@', ' '])
        && port.parse::<u16>().is_ok_and(|p| p > 0)
}

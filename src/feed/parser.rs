use chrono::DateTime;
use feed_rs::model;
use feed_rs::parser;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use super::sanitize::{site_origin, Sanitizer};
use crate::storage::NewEnclosure;
use crate::util::{collapse_whitespace, strip_control_chars, truncate_chars};

/// MIME type assumed for enclosures that do not declare one.
pub const DEFAULT_ENCLOSURE_TYPE: &str = "audio/mpeg";

/// Longest enclosure description kept.
pub const MAX_ENCLOSURE_DESCRIPTION: usize = 512;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unknown Feed Type: {0}")]
    UnknownType(String),
    #[error("Feed Parse Error: {0}")]
    Xml(String),
    #[error("Feed Parse Error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Feed is empty")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Xml,
    Json,
}

/// Feed-level fields copied onto the source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub site_url: Option<String>,
    pub image_url: Option<String>,
    pub icon_url: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

/// One item, normalized across RSS, Atom and JSON Feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEntry {
    /// Identifier declared by the feed, if any
    pub id: Option<String>,
    pub title: String,
    /// Sanitized HTML
    pub body: String,
    pub link: Option<String>,
    pub created: Option<i64>,
    pub author: Option<String>,
    pub image_url: Option<String>,
    /// Enclosures the item declares outright
    pub enclosures: Vec<NewEnclosure>,
    /// Media items (Media RSS and friends), which may repeat `enclosures`
    pub media: Vec<NewEnclosure>,
}

/// A parsed feed page. Entries are oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedDocument {
    pub meta: FeedMeta,
    pub entries: Vec<ParsedEntry>,
    /// `rel="next"` link (or JSON Feed `next_url`)
    pub next_page: Option<String>,
    /// JSON Feed `expired: true`
    pub expired: bool,
}

/// Decide how to read a response body.
///
/// The declared content type wins; otherwise the first significant byte
/// decides (`<` for XML, `{` for JSON).
pub fn detect_format(bytes: &[u8], content_type: &str) -> Option<FeedFormat> {
    let content_type = content_type.to_ascii_lowercase();
    let first = bytes
        .strip_prefix(b"\xEF\xBB\xBF")
        .unwrap_or(bytes)
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .copied();

    if content_type.contains("xml") || first == Some(b'<') {
        Some(FeedFormat::Xml)
    } else if content_type.contains("json") || first == Some(b'{') {
        Some(FeedFormat::Json)
    } else {
        None
    }
}

/// Parse a feed body into a [`FeedDocument`].
///
/// `fallback_base` (usually the feed URL) supplies the origin for relative
/// links when the feed does not name its own site.
pub fn parse(
    bytes: &[u8],
    content_type: &str,
    sanitizer: &Sanitizer,
    fallback_base: &str,
) -> Result<FeedDocument, ParseError> {
    match detect_format(bytes, content_type) {
        Some(FeedFormat::Xml) => parse_xml(bytes, sanitizer, fallback_base),
        Some(FeedFormat::Json) => parse_json(bytes, sanitizer, fallback_base),
        None => Err(ParseError::UnknownType(if content_type.is_empty() {
            "Not Set".to_string()
        } else {
            content_type.to_string()
        })),
    }
}

// ============================================================================
// Field fallbacks
// ============================================================================

/// One way of reading a field. Each field has an ordered list of these; the
/// first that yields a non-blank value wins.
type Pick<T> = fn(&T) -> Option<String>;

fn first_present<T>(item: &T, picks: &[Pick<T>]) -> Option<String> {
    picks
        .iter()
        .find_map(|pick| pick(item).filter(|v| !v.trim().is_empty()))
}

fn text(value: &Option<model::Text>) -> Option<String> {
    value.as_ref().map(|t| t.content.clone())
}

fn alternate_link(links: &[model::Link]) -> Option<String> {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
        .map(|l| l.href.clone())
}

fn link_with_rel(links: &[model::Link], rel: &str) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() == Some(rel))
        .map(|l| l.href.clone())
}

const FEED_TITLE: &[Pick<model::Feed>] = &[|f| text(&f.title)];
const FEED_SUBTITLE: &[Pick<model::Feed>] = &[|f| text(&f.description)];
const FEED_SITE_URL: &[Pick<model::Feed>] = &[
    |f| alternate_link(&f.links),
    |f| {
        f.links
            .iter()
            .find(|l| !matches!(l.rel.as_deref(), Some("self" | "next" | "hub")))
            .map(|l| l.href.clone())
    },
];
const FEED_IMAGE_URL: &[Pick<model::Feed>] = &[
    |f| f.logo.as_ref().map(|i| i.uri.clone()),
    |f| f.icon.as_ref().map(|i| i.uri.clone()),
];
const FEED_ICON_URL: &[Pick<model::Feed>] = &[
    |f| f.icon.as_ref().map(|i| i.uri.clone()),
    |f| f.logo.as_ref().map(|i| i.uri.clone()),
];
const FEED_AUTHOR: &[Pick<model::Feed>] = &[
    |f| f.authors.first().map(|p| p.name.clone()),
    |f| f.contributors.first().map(|p| p.name.clone()),
];
const FEED_DESCRIPTION: &[Pick<model::Feed>] = &[|f| text(&f.description)];

const ENTRY_TITLE: &[Pick<model::Entry>] = &[
    |e| text(&e.title),
    |e| e.media.iter().find_map(|m| text(&m.title)),
];
const ENTRY_LINK: &[Pick<model::Entry>] = &[
    |e| alternate_link(&e.links),
    |e| {
        e.links
            .iter()
            .find(|l| l.rel.as_deref() != Some("enclosure"))
            .map(|l| l.href.clone())
    },
];
const ENTRY_AUTHOR: &[Pick<model::Entry>] = &[
    |e| e.authors.first().map(|p| p.name.clone()),
    |e| e.contributors.first().map(|p| p.name.clone()),
];
const ENTRY_IMAGE_URL: &[Pick<model::Entry>] = &[
    |e| {
        e.media
            .iter()
            .find_map(|m| m.thumbnails.first().map(|t| t.image.uri.clone()))
    },
    |e| {
        e.media.iter().flat_map(|m| &m.content).find_map(|c| {
            let is_image = c
                .content_type
                .as_ref()
                .is_some_and(|t| t.to_string().starts_with("image/"));
            is_image
                .then(|| c.url.as_ref().map(|u| u.to_string()))
                .flatten()
        })
    },
];
/// Competing body representations; the longest wins.
const ENTRY_BODIES: &[Pick<model::Entry>] = &[
    |e| e.content.as_ref().and_then(|c| c.body.clone()),
    |e| text(&e.summary),
    |e| e.media.iter().find_map(|m| text(&m.description)),
];

/// JSON Feed paths. Segments are object keys or list indices.
const JSON_FEED_TITLE: &[&str] = &["title"];
const JSON_FEED_SUBTITLE: &[&str] = &["description"];
const JSON_FEED_SITE_URL: &[&str] = &["home_page_url"];
const JSON_FEED_IMAGE_URL: &[&str] = &["icon", "favicon"];
const JSON_FEED_ICON_URL: &[&str] = &["favicon", "icon"];
const JSON_FEED_AUTHOR: &[&str] = &["authors.0.name", "author.name", "author"];
const JSON_FEED_DESCRIPTION: &[&str] = &["description"];
const JSON_FEED_NEXT: &[&str] = &["next_url"];

const JSON_ENTRY_ID: &[&str] = &["id"];
const JSON_ENTRY_TITLE: &[&str] = &["title"];
const JSON_ENTRY_BODY: &[&str] = &["content_html", "content_text", "summary"];
const JSON_ENTRY_LINK: &[&str] = &["url", "external_url"];
const JSON_ENTRY_CREATED: &[&str] = &["date_published", "date_modified"];
const JSON_ENTRY_AUTHOR: &[&str] = &["authors.0.name", "author.name", "author"];
const JSON_ENTRY_IMAGE_URL: &[&str] = &["image", "banner_image"];

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        Value::Object(map) => map.get(key),
        _ => None,
    })
}

fn json_string(value: &Value, paths: &[&str]) -> Option<String> {
    paths.iter().find_map(|path| match lookup(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

// ============================================================================
// XML (RSS / Atom)
// ============================================================================

fn parse_xml(
    bytes: &[u8],
    sanitizer: &Sanitizer,
    fallback_base: &str,
) -> Result<FeedDocument, ParseError> {
    // Entries without a guid keep an empty id so identity falls back to the
    // link or the body digest.
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)
        .map_err(|e| ParseError::Xml(e.to_string()))?;
    if feed.entries.is_empty() {
        return Err(ParseError::Empty);
    }

    let site_url = first_present(&feed, FEED_SITE_URL);
    let base = base_for(site_url.as_deref(), fallback_base);

    let meta = FeedMeta {
        title: first_present(&feed, FEED_TITLE).map(|t| plain_text(&t)),
        subtitle: first_present(&feed, FEED_SUBTITLE).map(|t| plain_text(&t)),
        site_url,
        image_url: first_present(&feed, FEED_IMAGE_URL),
        icon_url: first_present(&feed, FEED_ICON_URL),
        author: first_present(&feed, FEED_AUTHOR).map(|a| plain_text(&a)),
        description: first_present(&feed, FEED_DESCRIPTION)
            .map(|d| sanitizer.clean(&d, base.as_ref())),
    };

    let mut entries: Vec<ParsedEntry> = feed
        .entries
        .iter()
        .map(|entry| xml_entry(entry, sanitizer, base.as_ref()))
        .collect();
    // Feeds list newest first
    entries.reverse();

    Ok(FeedDocument {
        meta,
        entries,
        next_page: link_with_rel(&feed.links, "next"),
        expired: false,
    })
}

fn xml_entry(entry: &model::Entry, sanitizer: &Sanitizer, base: Option<&Url>) -> ParsedEntry {
    let body = ENTRY_BODIES
        .iter()
        .filter_map(|pick| pick(entry))
        .max_by_key(|b| b.chars().count())
        .unwrap_or_default();

    let enclosures: Vec<NewEnclosure> = entry
        .links
        .iter()
        .filter(|l| l.rel.as_deref() == Some("enclosure"))
        .map(|l| {
            enclosure(
                l.href.clone(),
                l.media_type.clone(),
                l.length,
                None,
                l.title.as_deref(),
            )
        })
        .collect();

    let media: Vec<NewEnclosure> = entry
        .media
        .iter()
        .flat_map(|m| {
            let description = text(&m.description);
            m.content.iter().filter_map(move |c| {
                let href = c.url.as_ref()?.to_string();
                Some(enclosure(
                    href,
                    c.content_type.as_ref().map(|t| t.to_string()),
                    c.size,
                    None,
                    description.as_deref(),
                ))
            })
        })
        .collect();

    ParsedEntry {
        id: Some(entry.id.trim().to_string()).filter(|id| !id.is_empty()),
        title: first_present(entry, ENTRY_TITLE)
            .map(|t| plain_text(&t))
            .unwrap_or_default(),
        body: sanitizer.clean(&body, base),
        link: first_present(entry, ENTRY_LINK),
        created: entry.published.or(entry.updated).map(|d| d.timestamp()),
        author: first_present(entry, ENTRY_AUTHOR).map(|a| plain_text(&a)),
        image_url: first_present(entry, ENTRY_IMAGE_URL),
        enclosures,
        media,
    }
}

// ============================================================================
// JSON Feed
// ============================================================================

fn parse_json(
    bytes: &[u8],
    sanitizer: &Sanitizer,
    fallback_base: &str,
) -> Result<FeedDocument, ParseError> {
    let root: Value = serde_json::from_slice(bytes)?;

    let site_url = json_string(&root, JSON_FEED_SITE_URL);
    let base = base_for(site_url.as_deref(), fallback_base);
    let meta = FeedMeta {
        title: json_string(&root, JSON_FEED_TITLE).map(|t| plain_text(&t)),
        subtitle: json_string(&root, JSON_FEED_SUBTITLE).map(|t| plain_text(&t)),
        site_url,
        image_url: json_string(&root, JSON_FEED_IMAGE_URL),
        icon_url: json_string(&root, JSON_FEED_ICON_URL),
        author: json_string(&root, JSON_FEED_AUTHOR).map(|a| plain_text(&a)),
        description: json_string(&root, JSON_FEED_DESCRIPTION)
            .map(|d| sanitizer.clean(&d, base.as_ref())),
    };

    if lookup(&root, "expired").and_then(Value::as_bool) == Some(true) {
        return Ok(FeedDocument {
            meta,
            entries: Vec::new(),
            next_page: None,
            expired: true,
        });
    }

    let items = lookup(&root, "items")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    if items.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut entries: Vec<ParsedEntry> = items
        .iter()
        .map(|item| json_entry(item, sanitizer, base.as_ref()))
        .collect();
    entries.reverse();

    Ok(FeedDocument {
        meta,
        entries,
        next_page: json_string(&root, JSON_FEED_NEXT),
        expired: false,
    })
}

fn json_entry(item: &Value, sanitizer: &Sanitizer, base: Option<&Url>) -> ParsedEntry {
    let body = json_string(item, JSON_ENTRY_BODY).unwrap_or_default();
    let created = JSON_ENTRY_CREATED.iter().find_map(|path| {
        let raw = lookup(item, path)?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|d| d.timestamp())
    });

    let enclosures: Vec<NewEnclosure> = lookup(item, "attachments")
        .and_then(Value::as_array)
        .map(|attachments| {
            attachments
                .iter()
                .filter_map(|a| {
                    let href = json_string(a, &["url"])?;
                    Some(enclosure(
                        href,
                        json_string(a, &["mime_type"]),
                        lookup(a, "size_in_bytes").and_then(Value::as_u64),
                        None,
                        json_string(a, &["title"]).as_deref(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default();

    ParsedEntry {
        id: json_string(item, JSON_ENTRY_ID),
        title: json_string(item, JSON_ENTRY_TITLE)
            .map(|t| plain_text(&t))
            .unwrap_or_default(),
        body: sanitizer.clean(&body, base),
        link: json_string(item, JSON_ENTRY_LINK),
        created,
        author: json_string(item, JSON_ENTRY_AUTHOR).map(|a| plain_text(&a)),
        image_url: json_string(item, JSON_ENTRY_IMAGE_URL),
        enclosures,
        media: Vec::new(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn base_for(site_url: Option<&str>, fallback: &str) -> Option<Url> {
    site_url.and_then(site_origin).or_else(|| site_origin(fallback))
}

/// Titles and names are stored as plain text.
fn plain_text(s: &str) -> String {
    collapse_whitespace(&strip_control_chars(s))
}

/// Medium from the MIME top-level type: `audio/mpeg` → `audio`.
pub fn medium_for(mime_type: &str) -> Option<String> {
    let top = mime_type.split('/').next()?.trim().to_ascii_lowercase();
    match top.as_str() {
        "audio" | "video" | "image" | "text" => Some(top),
        "application" => Some("document".to_string()),
        _ => None,
    }
}

fn enclosure(
    href: String,
    mime_type: Option<String>,
    length: Option<u64>,
    medium: Option<String>,
    description: Option<&str>,
) -> NewEnclosure {
    let mime_type = mime_type
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_ENCLOSURE_TYPE.to_string());
    NewEnclosure {
        href: href.trim().to_string(),
        medium: medium.or_else(|| medium_for(&mime_type)),
        mime_type,
        length: length.and_then(|l| i64::try_from(l).ok()).unwrap_or(0),
        description: description
            .filter(|d| !d.trim().is_empty())
            .map(|d| truncate_chars(d, MAX_ENCLOSURE_DESCRIPTION).into_owned()),
    }
}

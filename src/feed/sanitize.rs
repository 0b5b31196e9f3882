use ammonia::{Builder, UrlRelative};
use url::Url;

/// Tags whose default allowed attributes include presentational ones.
const PRESENTATIONAL_TAGS: &[&str] = &[
    "img", "table", "thead", "tbody", "tfoot", "tr", "td", "th", "col", "colgroup", "hr",
];

/// HTML cleaner for entry bodies and feed descriptions.
///
/// Everything from feeds is untrusted: scripts, event handlers and unknown
/// tags are removed, and so are the configured presentational attributes.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    denied_attributes: Vec<String>,
}

impl Sanitizer {
    pub fn new(denied_attributes: &[String]) -> Self {
        Self {
            denied_attributes: denied_attributes
                .iter()
                .map(|a| a.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Clean `html`. When `base` is given, relative links and image sources
    /// (`/path`, `//host/path`) are made absolute against it.
    pub fn clean(&self, html: &str, base: Option<&Url>) -> String {
        let denied: Vec<&str> = self.denied_attributes.iter().map(String::as_str).collect();

        let mut builder = Builder::default();
        builder.rm_generic_attributes(&denied[..]);
        for &tag in PRESENTATIONAL_TAGS {
            builder.rm_tag_attributes(tag, &denied[..]);
        }
        if let Some(base) = base {
            builder.url_relative(UrlRelative::RewriteWithBase(base.clone()));
        }
        builder.clean(html).to_string()
    }
}

/// Scheme, host and port of `url` as a base for relative links.
pub fn site_origin(url: &str) -> Option<Url> {
    let parsed = Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    parsed.join("/").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(&crate::config::Config::default().denied_attributes)
    }

    #[test]
    fn test_scripts_removed() {
        let clean = sanitizer().clean(
            "<p>Hello<script>alert('x')</script></p><a href=\"https://a.example\" onclick=\"steal()\">link</a>",
            None,
        );
        assert!(!clean.contains("script"));
        assert!(!clean.contains("onclick"));
        assert!(clean.contains("<p>Hello</p>"));
        assert!(clean.contains("https://a.example"));
    }

    #[test]
    fn test_presentational_attributes_removed() {
        let clean = sanitizer().clean(
            "<img src=\"https://a.example/x.png\" width=\"10\" height=\"20\" align=\"left\" alt=\"x\">",
            None,
        );
        assert!(clean.contains("src=\"https://a.example/x.png\""));
        assert!(clean.contains("alt=\"x\""));
        assert!(!clean.contains("width"));
        assert!(!clean.contains("height"));
        assert!(!clean.contains("align"));
    }

    #[test]
    fn test_custom_denylist_keeps_other_attributes() {
        let clean = Sanitizer::new(&["alt".to_string()])
            .clean("<img src=\"https://a.example/x.png\" width=\"10\" alt=\"x\">", None);
        assert!(clean.contains("width=\"10\""));
        assert!(!clean.contains("alt"));
    }

    #[test]
    fn test_relative_urls_made_absolute() {
        let base = site_origin("https://blog.example/posts/feed.xml").unwrap();
        let clean = sanitizer().clean(
            "<a href=\"/about\">a</a><img src=\"//cdn.example/i.png\">",
            Some(&base),
        );
        assert!(clean.contains("href=\"https://blog.example/about\""));
        assert!(clean.contains("src=\"https://cdn.example/i.png\""));
    }

    #[test]
    fn test_site_origin() {
        assert_eq!(
            site_origin("https://blog.example:8443/a/b?c=d").map(|u| u.to_string()),
            Some("https://blog.example:8443/".to_string())
        );
        assert!(site_origin("not a url").is_none());
        assert!(site_origin("mailto:someone@example.org").is_none());
    }
}

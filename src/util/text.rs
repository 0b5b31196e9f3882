use std::borrow::Cow;

/// Cut `s` to at most `max_chars` characters (not bytes).
///
/// Returns `Cow::Borrowed` when nothing is cut.
///
/// # Examples
///
/// ```
/// use feedtide::util::truncate_chars;
///
/// assert_eq!(truncate_chars("Not modified", 255), "Not modified");
/// assert_eq!(truncate_chars("héllo", 2), "hé");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_end, _)) => Cow::Owned(s[..byte_end].to_string()),
        None => Cow::Borrowed(s),
    }
}

/// Strip ASCII control characters other than tab, newline and carriage return.
///
/// Diagnostics copied from transport errors and feed bodies end up in
/// `last_result`, which operators read in a terminal.
///
/// Returns `Cow::Borrowed` when the input is already clean (the common case).
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let is_control = |c: char| {
        (c.is_ascii_control() && c != '\t' && c != '\n' && c != '\r') || c == '\u{7f}'
    };

    if !s.chars().any(is_control) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(s.chars().filter(|&c| !is_control(c)).collect())
}

/// Collapse every run of whitespace (including newlines) into one space.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

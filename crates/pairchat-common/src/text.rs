//! Length limiting and markup escaping for relayed chat text.

/// Returns the longest prefix of `text` holding at most `max_chars` characters.
///
/// Cuts on character boundaries, never inside a multi-byte sequence.
///
/// # Examples
///
/// ```
/// use pairchat_common::text::truncate_chars;
/// assert_eq!(truncate_chars("héllo", 2), "hé");
/// assert_eq!(truncate_chars("hi", 10), "hi");
/// ```
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Escapes text so a browser renders it literally instead of as markup.
///
/// # Examples
///
/// ```
/// use pairchat_common::text::escape_markup;
/// assert_eq!(
///     escape_markup("<script>x</script>"),
///     "&lt;script&gt;x&lt;/script&gt;"
/// );
/// ```
#[must_use]
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

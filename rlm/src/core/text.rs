//! Byte-budget helpers for UTF-8 text.

use std::sync::LazyLock;

use regex::Regex;

/// Longest prefix of `value` that fits in `max_bytes` without splitting a character.
pub fn truncate_utf8_to_bytes(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(value: &str) -> String {
    static WHITESPACE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex should be valid"));
    WHITESPACE_RE.replace_all(value, " ").trim().to_string()
}

/// Decode bytes read at arbitrary offsets; split characters become U+FFFD.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

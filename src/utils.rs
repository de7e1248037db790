// src/utils.rs
// Small shared helpers

use std::path::Path;

/// Current wall-clock time as millisecond epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert a path to a String, lossily on non-UTF-8 platforms.
pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Collapse runs of whitespace (including newlines) into single spaces and
/// trim the ends. Used for starred-message previews.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Take the first `max_chars` characters of a string on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Rough token estimate: ~4 chars per token, minimum 1 for non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() / 4).max(1)
}

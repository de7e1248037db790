// src/ids.rs
// Stable identifiers and content hashing

use sha2::{Digest, Sha256};

/// Generate a fresh 32-hex-character id (UUID v4 without hyphens).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// MD5 content hash as 32 lowercase hex chars.
///
/// Used for message bodies and document content where we only need change
/// detection, not collision resistance.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

/// Content-addressed resource id: first 8 hex chars of SHA-256 over the
/// source string. Identical sources always map to the same id.
pub fn resource_id(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    let hex = format!("{:x}", digest);
    hex[..8].to_string()
}

/// Sanitize a title for use in a file name: keep alphanumerics, dashes and
/// spaces (spaces collapsed to single dashes), cap at 60 chars.
pub fn file_safe_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = false;
    for ch in title.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if (ch == ' ' || ch == '-' || ch == '_') && !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out.chars().take(60).collect()
}

/// Build the canonical `<title>-<timestamp>-<id>` file stem for a
/// conversation or project.
pub fn file_stamp(title: &str, created_at_ms: i64, id: &str) -> String {
    format!("{}-{}-{}", file_safe_title(title), created_at_ms, id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_32_hex() {
        let id = new_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(new_id(), new_id());
    }

    #[test]
    fn test_content_hash_stable() {
        assert_eq!(content_hash("hello"), content_hash("hello"));
        assert_ne!(content_hash("hello"), content_hash("hello!"));
        assert_eq!(content_hash("").len(), 32);
    }

    #[test]
    fn test_resource_id_deterministic() {
        let a = resource_id("notes/design.md");
        let b = resource_id("notes/design.md");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(resource_id("notes/design.md"), resource_id("notes/other.md"));
    }

    #[test]
    fn test_file_safe_title() {
        assert_eq!(file_safe_title("Hello World"), "Hello-World");
        assert_eq!(file_safe_title("a/b: c?"), "ab-c");
        assert_eq!(file_safe_title("   "), "untitled");
        assert_eq!(file_safe_title("--weird--"), "weird");
    }

    #[test]
    fn test_file_stamp() {
        let stamp = file_stamp("My Chat", 1700000000000, "abc123");
        assert_eq!(stamp, "My-Chat-1700000000000-abc123");
    }
}

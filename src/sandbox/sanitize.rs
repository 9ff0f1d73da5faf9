use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

static PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/[\w/]+/").expect("static regex"));

static USER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"home/[^/\s]+/").expect("static regex"));

static TEMP_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"tmp\w+")
        .case_insensitive(true)
        .build()
        .expect("static regex")
});

/// Scrub host details out of diagnostic text.
///
/// Only meant for stderr and messages derived from it; program stdout is
/// returned untouched.
pub fn sanitize(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    // Usernames first; the path pattern would otherwise swallow them.
    let text = USER_PATTERN.replace_all(text, "home/[USER]/");
    let text = PATH_PATTERN.replace_all(&text, "[PATH]/");
    TEMP_PATTERN.replace_all(&text, "[TEMP]").into_owned()
}

/// Truncate to at most `max_bytes`, backing off to a char boundary.
pub fn truncate_utf8(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_absolute_paths() {
        let raw = "error: could not open /var/sandboxes/ab12cd34/main.rs";
        let clean = sanitize(raw);
        assert!(!clean.contains("/var/sandboxes"));
        assert!(clean.contains("[PATH]/main.rs"));
    }

    #[test]
    fn test_strips_usernames() {
        let clean = sanitize("--> home/alice/main.rs:1:1");
        assert_eq!(clean, "--> home/[USER]/main.rs:1:1");

        let clean = sanitize("thread panicked at /home/bob/.cargo/x.rs");
        assert!(!clean.contains("bob"));
    }

    #[test]
    fn test_strips_usernames_with_punctuation() {
        let clean = sanitize("panicked at /home/jane-doe/main.rs:1:1");
        assert!(!clean.contains("jane-doe"), "{clean}");

        let clean = sanitize("--> home/john.smith/src/main.rs");
        assert_eq!(clean, "--> home/[USER]/src/main.rs");
    }

    #[test]
    fn test_collapses_temp_names() {
        let clean = sanitize("note: in tmpa8F3kq the build failed");
        assert_eq!(clean, "note: in [TEMP] the build failed");
        assert!(!sanitize("TMPxyz").contains("xyz"));
    }

    #[test]
    fn test_plain_text_untouched() {
        let raw = "error[E0425]: cannot find value `x` in this scope";
        assert_eq!(sanitize(raw), raw);
        assert_eq!(sanitize(""), "");
    }

    #[test]
    fn test_truncate_utf8() {
        let mut s = "abcdef".to_string();
        truncate_utf8(&mut s, 4);
        assert_eq!(s, "abcd");

        let mut s = "aé".to_string();
        truncate_utf8(&mut s, 2);
        assert_eq!(s, "a");

        let mut s = "short".to_string();
        truncate_utf8(&mut s, 64);
        assert_eq!(s, "short");
    }
}

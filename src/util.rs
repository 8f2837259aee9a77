//! Shared string helpers.

/// Truncate a string to at most `max_len` characters, ending in `...` when cut.
pub fn truncate_str(s: &str, max_len: usize) -> String {
    let char_count = s.chars().count();
    if char_count <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

/// Keep the first `max_chars` characters of `s`, cutting on a char boundary.
pub fn cap_chars(mut s: String, max_chars: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max_chars) {
        s.truncate(idx);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_short_string_returned_unchanged() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn truncate_str_exactly_max_len_not_truncated() {
        assert_eq!(truncate_str("hello", 5), "hello");
    }

    #[test]
    fn truncate_str_over_limit_appends_ellipsis() {
        assert_eq!(truncate_str("hello world", 8), "hello...");
    }

    #[test]
    fn truncate_str_unicode_does_not_panic() {
        let s = "héllo wörld ünïcödé";
        let out = truncate_str(s, 6);
        assert_eq!(out.chars().count(), 6);
    }

    #[test]
    fn cap_chars_cuts_on_char_boundary() {
        assert_eq!(cap_chars("ééééé".to_string(), 3), "ééé");
        assert_eq!(cap_chars("abc".to_string(), 10), "abc");
        assert_eq!(cap_chars(String::new(), 0), "");
    }
}

//! Text helpers for message content and previews

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// True when the text has at least one non-whitespace character
    pub fn has_content(text: &str) -> bool {
        !text.trim().is_empty()
    }

    /// Collapse runs of whitespace (including newlines) to single spaces
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        if trimmed.len() == text.len() && !trimmed.contains(|c: char| c.is_whitespace() && c != ' ')
            && !trimmed.contains("  ")
        {
            Cow::Borrowed(text)
        } else {
            Cow::Owned(WHITESPACE_REGEX.replace_all(trimmed, " ").into_owned())
        }
    }

    /// Truncate to at most `max_chars` characters, ending in an ellipsis when
    /// shortened. Counts chars, never splits a code point.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            return Cow::Borrowed(text);
        }
        if max_chars == 0 {
            return Cow::Borrowed("");
        }

        let keep = max_chars - 1;
        let mut truncated: String = text.chars().take(keep).collect();
        truncated.truncate(truncated.trim_end().len());
        truncated.push('…');
        Cow::Owned(truncated)
    }

    /// Single-line preview of a message for conversation lists
    pub fn preview(text: &str, max_chars: usize) -> String {
        let normalized = Self::normalize_whitespace(text);
        Self::truncate_with_ellipsis(&normalized, max_chars).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_content() {
        assert!(TextUtils::has_content(" hi "));
        assert!(!TextUtils::has_content(""));
        assert!(!TextUtils::has_content(" \n\t "));
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(TextUtils::normalize_whitespace("hello world"), "hello world");
        assert!(matches!(
            TextUtils::normalize_whitespace("hello world"),
            Cow::Borrowed(_)
        ));
        assert_eq!(
            TextUtils::normalize_whitespace("  first line\n\nsecond\tline "),
            "first line second line"
        );
        assert_eq!(TextUtils::normalize_whitespace("a  b"), "a b");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(TextUtils::truncate_with_ellipsis("short", 10), "short");
        assert_eq!(TextUtils::truncate_with_ellipsis("hello world", 6), "hello…");
        assert_eq!(TextUtils::truncate_with_ellipsis("abc", 0), "");
    }

    #[test]
    fn test_truncate_counts_chars_not_bytes() {
        let text = "héllo wörld";
        assert_eq!(TextUtils::truncate_with_ellipsis(text, 11), text);
        assert_eq!(TextUtils::truncate_with_ellipsis(text, 3), "hé…");
    }

    #[test]
    fn test_preview() {
        assert_eq!(TextUtils::preview("Dear diary,\n\ntoday was long", 14), "Dear diary, t…");
    }
}

//! Log-safe string handling
//!
//! Truncation helpers respect UTF-8 boundaries so provider bodies can be
//! logged without panicking on multi-byte characters.

/// Safely truncate a string at a UTF-8 character boundary.
///
/// Returns a slice of at most `max_bytes` bytes, ensuring the result
/// is valid UTF-8 by finding the last valid character boundary.
///
/// # Example
/// ```
/// use anthropic_oauth_session::utils::safe_truncate;
///
/// // Emoji is 4 bytes - truncating at byte 10 would cut it in half
/// let text = "Status: 🔍 Active";
/// let result = safe_truncate(text, 10);
/// assert_eq!(result, "Status: "); // Stops before the emoji
/// ```
#[inline]
#[must_use]
pub fn safe_truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }

    let mut boundary = max_bytes;
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }

    &s[..boundary]
}

/// Truncate a string for logging with ellipsis.
///
/// Returns a new String that is at most `max_bytes` long (before the
/// ellipsis), with "..." appended if truncation occurred.
///
/// # Example
/// ```
/// use anthropic_oauth_session::utils::truncate_for_display;
///
/// let text = "This is a long message";
/// let result = truncate_for_display(text, 10);
/// assert_eq!(result, "This is a ...");
/// ```
#[must_use]
pub fn truncate_for_display(s: &str, max_bytes: usize) -> String {
    let truncated = safe_truncate(s, max_bytes);
    if truncated.len() < s.len() {
        format!("{truncated}...")
    } else {
        truncated.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_truncate_multibyte() {
        let text = "Café";
        assert_eq!(safe_truncate(text, 4), "Caf");
        assert_eq!(safe_truncate(text, 5), "Café");
        assert_eq!(safe_truncate(text, 0), "");
    }

    #[test]
    fn test_truncate_for_display() {
        let text = "This is a long message";
        assert_eq!(truncate_for_display(text, 100), text);
        assert_eq!(truncate_for_display(text, 10), "This is a ...");
    }
}

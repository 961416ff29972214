//! Token estimation for agent-facing text.
//!
//! The heuristic is four characters per token, rounded up. It only needs to
//! be consistent between the summary renderers and the context loader's
//! budget accounting.

/// Marker appended to text cut down by [`truncate_to_tokens`]
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Estimate the token count of a string
pub fn estimate(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Truncate `text` so that its estimate fits within `max_tokens`, appending
/// the truncation marker. Returns the text unchanged when it already fits.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if estimate(text) <= max_tokens {
        return text.to_string();
    }
    let budget_bytes = max_tokens.saturating_mul(4);
    let keep = budget_bytes.saturating_sub(TRUNCATION_MARKER.len());
    let mut cut = keep.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], TRUNCATION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate(""), 0);
        assert_eq!(estimate("a"), 1);
        assert_eq!(estimate("abcd"), 1);
        assert_eq!(estimate("abcde"), 2);
    }

    #[test]
    fn test_truncate_noop_when_within_budget() {
        assert_eq!(truncate_to_tokens("short", 10), "short");
    }

    #[test]
    fn test_truncate_appends_marker() {
        let text = "x".repeat(400);
        let out = truncate_to_tokens(&text, 25);
        assert!(out.ends_with(TRUNCATION_MARKER));
        assert!(estimate(&out) <= 25);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(200);
        let out = truncate_to_tokens(&text, 20);
        assert!(out.ends_with(TRUNCATION_MARKER));
    }
}

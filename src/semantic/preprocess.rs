//! Text preparation for embedding input.

/// Default cap on characters sent to the embedding service per input.
pub const DEFAULT_MAX_INPUT_CHARS: usize = 8000;

/// Trim and cut text to at most `max_chars` characters.
///
/// Cuts on character boundaries so multi-byte text stays valid.
pub fn prepare_text(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_only_trimmed() {
        assert_eq!(prepare_text("  serum sodium  ", 100), "serum sodium");
    }

    #[test]
    fn test_long_text_cut_at_limit() {
        let text = "a".repeat(DEFAULT_MAX_INPUT_CHARS + 50);
        assert_eq!(prepare_text(&text, DEFAULT_MAX_INPUT_CHARS).len(), DEFAULT_MAX_INPUT_CHARS);
    }

    #[test]
    fn test_multibyte_boundaries() {
        let text = "ñ".repeat(10);
        let cut = prepare_text(&text, 4);
        assert_eq!(cut.chars().count(), 4);
        assert_eq!(cut, "ññññ");
    }

    #[test]
    fn test_exact_length_unchanged() {
        assert_eq!(prepare_text("abcd", 4), "abcd");
    }
}

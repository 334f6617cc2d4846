/// Format one exchange as the canonical Q/A text used for embedding,
/// keyword indexing and distillation prompts.
pub fn build_qa_pair(question: &str, answer: &str) -> String {
    format!("Question: {question}\nAnswer: {answer}\n\n")
}

/// Truncate a string to `max` characters, appending "…" if truncated.
/// Handles multi-byte (CJK) correctly via char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{truncated}…")
    }
}

/// Estimate token count for text content.
/// Approximation: bytes / 4, rounded up.
pub fn estimate_text_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

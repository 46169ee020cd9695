/// Character-count token approximation: about 4 ASCII chars or 1.5 non-ASCII chars per token.
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0usize;
        let mut non_ascii_chars = 0usize;
        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }
        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// Rough inverse: how many ASCII chars fit in `tokens`.
    pub fn chars_for(tokens: usize) -> usize {
        tokens.saturating_mul(4)
    }
}

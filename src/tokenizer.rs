//! Token counting.
//!
//! Adapters with a real tokenizer (the OpenAI-compatible adapter, through
//! `tiktoken-rs`) count exactly. Everything else falls back to a
//! deterministic estimate of one token per four characters.

use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::error::{LlmError, Result};

/// Characters per token for the approximate estimate.
pub const CHARS_PER_TOKEN: usize = 4;

/// Approximate token count: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Split text into 4-character pieces; the piece count equals [`estimate_tokens`].
pub fn approximate_tokenize(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(CHARS_PER_TOKEN)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// BPE tokenizer for OpenAI models.
pub struct Tokenizer {
    encoder: CoreBPE,
    model: String,
}

impl Tokenizer {
    /// Create a tokenizer for a specific model.
    ///
    /// gpt-4o and the o-series use o200k; everything else uses cl100k.
    pub fn for_model(model: &str) -> Result<Self> {
        let encoder = if model.contains("gpt-4o") || model.starts_with("o1") || model.starts_with("o3") {
            o200k_base()
        } else {
            cl100k_base()
        }
        .map_err(|e| LlmError::ConfigError(format!("failed to load tokenizer: {}", e)))?;

        Ok(Self {
            encoder,
            model: model.to_string(),
        })
    }

    /// Count the number of tokens in the text.
    pub fn count_tokens(&self, text: &str) -> usize {
        self.encoder.encode_with_special_tokens(text).len()
    }

    /// Split text into token strings.
    pub fn tokenize(&self, text: &str) -> Result<Vec<String>> {
        self.encoder
            .split_by_token(text, true)
            .map_err(|e| LlmError::ApiError(format!("tokenization failed: {}", e)))
    }

    /// Get the model this tokenizer is configured for.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_estimate_counts_chars_not_bytes() {
        assert_eq!(estimate_tokens("héllo"), 2);
    }

    #[test]
    fn test_approximate_tokenize_matches_estimate() {
        let text = "The quick brown fox";
        let pieces = approximate_tokenize(text);
        assert_eq!(pieces.len(), estimate_tokens(text));
        assert_eq!(pieces.concat(), text);
    }

    #[test]
    fn test_token_counting() {
        let tokenizer = Tokenizer::for_model("gpt-4").unwrap();
        let text = "Hello, world!";
        let count = tokenizer.count_tokens(text);
        assert!(count > 0);
        assert!(count < text.len());
    }

    #[test]
    fn test_tokenize_reassembles() {
        let tokenizer = Tokenizer::for_model("gpt-4o-mini").unwrap();
        let pieces = tokenizer.tokenize("This is a test sentence.").unwrap();
        assert_eq!(pieces.concat(), "This is a test sentence.");
        assert_eq!(pieces.len(), tokenizer.count_tokens("This is a test sentence."));
    }

    #[test]
    fn test_model_accessor() {
        let tokenizer = Tokenizer::for_model("gpt-3.5-turbo").unwrap();
        assert_eq!(tokenizer.model(), "gpt-3.5-turbo");
    }
}

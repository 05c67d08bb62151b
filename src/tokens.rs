
use tiktoken_rs::{tokenizer, CoreBPE};

/// Token count of `text` under the encoding that serves `model`.
/// Unknown models fall back to `cl100k_base`.
pub fn count_tokens(model: &str, text: &str) -> usize {
    bpe_for_model(model).encode_with_special_tokens(text).len()
}

fn bpe_for_model(model: &str) -> &'static CoreBPE {
    let tokenizer = tokenizer::get_tokenizer(model).unwrap_or(tokenizer::Tokenizer::Cl100kBase);
    match tokenizer {
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase => tiktoken_rs::r50k_base_singleton(),
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
        tokenizer::Tokenizer::Gpt2 => tiktoken_rs::r50k_base_singleton(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_stable_per_model() {
        let a = count_tokens("gpt-4", "hello world");
        let b = count_tokens("gpt-4", "hello world");
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn unknown_model_falls_back() {
        // Must not panic; falls back to cl100k_base.
        assert!(count_tokens("not-a-real-model", "hi") > 0);
    }

    #[test]
    fn empty_text_counts_zero() {
        assert_eq!(count_tokens("gpt-4", ""), 0);
    }
}

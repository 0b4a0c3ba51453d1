use std::path::Path;

use serde_json::json;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Token strings recognised as the end-of-segment marker, in priority order.
const EOS_CANDIDATES: &[&str] = &["<|endoftext|>", "</s>", "<eos>"];

/// Thin wrapper around the Hugging Face `tokenizers` crate.
///
/// Problem, reasoning trace and answer share one flat token sequence; the
/// end-of-segment id returned by [`Tokenizer::eos_token_id`] is the only
/// delimiter between them.
#[derive(Debug)]
pub struct Tokenizer {
    inner: HfTokenizer,
    eos_token_id: u32,
}

impl Tokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path)
            .map_err(|e| CoreError::Tokenizer(format!("{}: {e}", path.display())))?;
        Self::wrap(inner)
    }

    /// Build a whitespace-split word-level tokenizer over a fixed vocabulary.
    ///
    /// Ids are assigned in order. `<unk>` and `<|endoftext|>` are appended
    /// when missing; the latter is registered as a special token so
    /// `decode(.., true)` drops it. Suited to synthetic arithmetic corpora
    /// where every number and operator is a single word.
    pub fn from_word_vocab(words: &[&str]) -> CoreResult<Self> {
        let mut vocab = serde_json::Map::new();
        for word in words.iter().chain(["<unk>", EOS_CANDIDATES[0]].iter()) {
            if !vocab.contains_key(*word) {
                let id = vocab.len() as u64;
                vocab.insert((*word).to_string(), json!(id));
            }
        }
        let eos_id = vocab[EOS_CANDIDATES[0]].clone();

        let spec = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [{
                "id": eos_id,
                "content": EOS_CANDIDATES[0],
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            }],
            "normalizer": null,
            "pre_tokenizer": { "type": "WhitespaceSplit" },
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": vocab,
                "unk_token": "<unk>"
            }
        });

        let bytes = serde_json::to_vec(&spec)?;
        let inner = HfTokenizer::from_bytes(bytes)
            .map_err(|e| CoreError::Tokenizer(format!("word-level build error: {e}")))?;
        Self::wrap(inner)
    }

    fn wrap(inner: HfTokenizer) -> CoreResult<Self> {
        let vocab = inner.get_vocab(true);
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|c| vocab.get(*c).copied())
            .ok_or_else(|| CoreError::Tokenizer(format!(
                "no end-of-segment token found (tried {})",
                EOS_CANDIDATES.join(", ")
            )))?;

        debug!(
            eos_token_id,
            vocab_size = inner.get_vocab_size(true),
            "Tokenizer loaded"
        );

        Ok(Self { inner, eos_token_id })
    }

    /// Encode a text string to a sequence of token ids.
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> CoreResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode a sequence of token ids back to a string.
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> CoreResult<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| CoreError::Tokenizer(e.to_string()))
    }

    /// The end-of-segment token id separating problem, trace and answer.
    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    /// The size of the model vocabulary.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Look up the token id for an exact token string.
    pub fn token_id(&self, text: &str) -> Option<u32> {
        self.inner.token_to_id(text)
    }
}

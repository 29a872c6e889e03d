//! Token counting for usage estimation and context-window checks.
//!
//! Providers that report usage are trusted as-is. When a transport returns no
//! usage the adapter estimates it here with tiktoken:
//!
//! | Model family | Encoding |
//! |--------------|----------|
//! | `gpt-4o*`, `o1*`, `o3*`, `o4*` | `o200k_base` |
//! | everything else | `cl100k_base` |
//!
//! Encoders are loaded once per process. If loading fails, counts fall back to
//! a `chars / 4` approximation instead of failing the request.

use std::sync::{Arc, OnceLock};
use tiktoken_rs::{cl100k_base, o200k_base, CoreBPE};

use crate::error::{LlmError, Result};
use crate::traits::TokenUsage;

static CL100K: OnceLock<Option<Arc<CoreBPE>>> = OnceLock::new();
static O200K: OnceLock<Option<Arc<CoreBPE>>> = OnceLock::new();

/// Tiktoken encoding family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// GPT-4 / GPT-3.5 and unknown models.
    Cl100kBase,
    /// GPT-4o and the o-series.
    O200kBase,
}

impl Encoding {
    /// Pick the encoding for a model id.
    pub fn for_model(model: &str) -> Self {
        let m = model.to_ascii_lowercase();
        if m.contains("gpt-4o") || ["o1", "o3", "o4"].iter().any(|p| m.starts_with(p)) {
            Encoding::O200kBase
        } else {
            Encoding::Cl100kBase
        }
    }

    fn load(self) -> Result<Arc<CoreBPE>> {
        let cell = match self {
            Encoding::Cl100kBase => &CL100K,
            Encoding::O200kBase => &O200K,
        };
        cell.get_or_init(|| {
            let loaded = match self {
                Encoding::Cl100kBase => cl100k_base(),
                Encoding::O200kBase => o200k_base(),
            };
            match loaded {
                Ok(bpe) => Some(Arc::new(bpe)),
                Err(e) => {
                    tracing::warn!(encoding = ?self, error = %e, "Failed to load tokenizer");
                    None
                }
            }
        })
        .clone()
        .ok_or_else(|| LlmError::Configuration(format!("tokenizer {:?} unavailable", self)))
    }
}

/// Tokenizer for counting tokens in text.
#[derive(Clone)]
pub struct Tokenizer {
    encoder: Option<Arc<CoreBPE>>,
    model: String,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("model", &self.model)
            .field("exact", &self.encoder.is_some())
            .finish()
    }
}

impl Tokenizer {
    /// Create a tokenizer for a specific model.
    ///
    /// Fails only if the tiktoken encoding cannot be loaded.
    pub fn for_model(model: &str) -> Result<Self> {
        Ok(Self {
            encoder: Some(Encoding::for_model(model).load()?),
            model: model.to_string(),
        })
    }

    /// Like [`Tokenizer::for_model`], degrading to the approximation on failure.
    pub fn for_model_or_approx(model: &str) -> Self {
        Self {
            encoder: Encoding::for_model(model).load().ok(),
            model: model.to_string(),
        }
    }

    /// Count the number of tokens in the text.
    pub fn count_tokens(&self, text: &str) -> u64 {
        match &self.encoder {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => approximate_tokens(text),
        }
    }

    /// Usage for a prompt/completion pair.
    pub fn estimate_usage(&self, prompt: &str, completion: &str) -> TokenUsage {
        TokenUsage::new(self.count_tokens(prompt), self.count_tokens(completion))
    }

    /// Whether counts come from a real encoder.
    pub fn is_exact(&self) -> bool {
        self.encoder.is_some()
    }

    /// Get the model this tokenizer is configured for.
    pub fn model(&self) -> &str {
        &self.model
    }
}

fn approximate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

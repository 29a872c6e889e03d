//! Request/response types and the provider transport trait.
//!
//! # Key Types
//!
//! - [`GenerationRequest`]: normalized, immutable request submitted by callers
//! - [`GenerationResult`]: the single terminal value every request settles into
//! - [`StreamChunk`]: incremental text delivered to a streaming subscriber
//! - [`LLMProvider`]: one vendor transport, one attempt per call, no retry
//!
//! # WHY: Transport vs. Adapter
//!
//! An [`LLMProvider`] only knows how to talk to one vendor API once. Retry,
//! timeouts, credential pre-flight and chunk ordering live in
//! [`ProviderAdapter`](crate::adapter::ProviderAdapter), so every vendor gets
//! identical resilience and tests can swap in the
//! [`MockProvider`](crate::providers::MockProvider).

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::error::{GenerationError, LlmError, Result};

// ============================================================================
// Generation Request
// ============================================================================

/// Model id that asks the orchestrator to pick a model by policy.
pub const AUTO_MODEL: &str = "auto";

/// A normalized generation request.
///
/// Prompt text is already rendered; template substitution happens upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Logical model identifier (or [`AUTO_MODEL`]).
    pub model_id: String,

    /// Fully rendered prompt text.
    pub prompt_text: String,

    /// Sampling temperature in `[0, 1]`.
    pub temperature: f32,

    /// Maximum number of tokens to generate.
    pub max_output_tokens: u32,

    /// Nucleus sampling in `[0, 1]`.
    pub top_p: f32,

    /// Sequences that stop generation.
    pub stop_sequences: Vec<String>,

    /// Whether the caller wants incremental chunks.
    pub streaming: bool,
}

impl GenerationRequest {
    /// Create a request with default sampling parameters.
    pub fn new(model_id: impl Into<String>, prompt_text: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt_text: prompt_text.into(),
            temperature: 0.7,
            max_output_tokens: 1024,
            top_p: 1.0,
            stop_sequences: Vec::new(),
            streaming: false,
        }
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the output token limit.
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Set nucleus sampling.
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set stop sequences.
    pub fn with_stop_sequences<I, S>(mut self, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_sequences = stops.into_iter().map(Into::into).collect();
        self
    }

    /// Request incremental delivery.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Whether the orchestrator should choose the model.
    pub fn is_auto(&self) -> bool {
        self.model_id == AUTO_MODEL
    }

    /// Check field ranges. Performed before any network call.
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() {
            return Err(LlmError::Validation("model_id is empty".to_string()));
        }
        if self.prompt_text.is_empty() {
            return Err(LlmError::Validation("prompt_text is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.temperature) {
            return Err(LlmError::Validation(format!(
                "temperature {} outside [0, 1]",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(LlmError::Validation(format!(
                "top_p {} outside [0, 1]",
                self.top_p
            )));
        }
        if self.max_output_tokens == 0 {
            return Err(LlmError::Validation(
                "max_output_tokens must be positive".to_string(),
            ));
        }
        if self.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(LlmError::Validation(
                "stop sequences must not be empty strings".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Token Usage
// ============================================================================

/// Token accounting for one generation.
///
/// `total_tokens` is always `prompt_tokens + completion_tokens`; construct
/// through [`TokenUsage::new`] to keep that true.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens consumed by the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Sum of the two.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Create usage; the total is derived.
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

// ============================================================================
// Generation Result
// ============================================================================

/// Terminal value of every orchestrated request, success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Process-unique id of this result.
    pub request_id: Uuid,

    /// Assembled, post-processed text. Empty on failure.
    pub text: String,

    /// Model that served (or was meant to serve) the request.
    pub model_id: String,

    /// Provider behind the model. Empty if resolution failed.
    pub provider_id: String,

    /// Wall-clock start of the request.
    pub started_at: SystemTime,

    /// Elapsed time until settlement.
    pub duration_ms: u64,

    /// Token accounting.
    pub token_usage: TokenUsage,

    /// Cost derived from usage and the model's per-1k prices.
    pub estimated_cost_usd: f64,

    /// Populated when the request failed.
    pub error: Option<GenerationError>,

    /// Whether the result was served from the response cache.
    pub from_cache: bool,
}

impl GenerationResult {
    /// A failed result with empty text.
    pub fn failed(
        request_id: Uuid,
        model_id: impl Into<String>,
        provider_id: impl Into<String>,
        started_at: SystemTime,
        error: GenerationError,
    ) -> Self {
        Self {
            request_id,
            text: String::new(),
            model_id: model_id.into(),
            provider_id: provider_id.into(),
            started_at,
            duration_ms: elapsed_ms(started_at),
            token_usage: TokenUsage::default(),
            estimated_cost_usd: 0.0,
            error: Some(error),
            from_cache: false,
        }
    }

    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Milliseconds elapsed since `started_at`, zero if the clock went backwards.
pub(crate) fn elapsed_ms(started_at: SystemTime) -> u64 {
    started_at
        .elapsed()
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Streaming Types
// ============================================================================

/// Incremental piece of a streamed generation, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Request this chunk belongs to.
    pub request_id: Uuid,
    /// Strictly increasing per request, starting at 0.
    pub sequence: u64,
    /// Text fragment; empty on the final chunk.
    pub text: String,
    /// Set on the last chunk only.
    pub is_final: bool,
}

/// Subscriber invoked for each [`StreamChunk`].
pub type ChunkCallback<'a> = &'a (dyn Fn(StreamChunk) + Send + Sync);

/// Fragment produced by a transport.
///
/// `index` is the transport's own position marker. Transports that may
/// deliver out of order (multiplexed connections, parallel decoders) set it
/// so the adapter can reorder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDelta {
    /// Transport-assigned position, starting at 0.
    pub index: u64,
    /// Text fragment.
    pub text: String,
    /// Usage, typically only on the last delta.
    pub usage: Option<TokenUsage>,
}

impl ProviderDelta {
    /// Create a text delta.
    pub fn new(index: u64, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            usage: None,
        }
    }

    /// Attach usage.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Complete response from a single transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResponse {
    /// Generated text.
    pub text: String,
    /// Usage as reported by the vendor, if any.
    pub usage: Option<TokenUsage>,
    /// Finish reason (e.g. "stop", "length").
    pub finish_reason: Option<String>,
}

impl ProviderResponse {
    /// Create a response without usage.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: None,
            finish_reason: None,
        }
    }

    /// Set token usage.
    pub fn with_usage(mut self, prompt: u64, completion: u64) -> Self {
        self.usage = Some(TokenUsage::new(prompt, completion));
        self
    }

    /// Set finish reason.
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }
}

// ============================================================================
// Provider Transport Trait
// ============================================================================

/// A vendor transport. Each call is exactly one attempt.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Provider identifier, matching `ModelDescriptor::provider_id`.
    fn name(&self) -> &str;

    /// Whether a key/token is configured. Checked before every attempt.
    fn has_credential(&self) -> bool;

    /// Environment variable the credential is read from, for error messages.
    fn credential_env(&self) -> Option<&str> {
        None
    }

    /// Whether [`LLMProvider::stream`] is natively incremental.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Generate a full completion.
    async fn complete(&self, request: &GenerationRequest) -> Result<ProviderResponse>;

    /// Generate incrementally.
    ///
    /// The default runs [`LLMProvider::complete`] and yields one delta.
    async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<ProviderDelta>>> {
        use futures::StreamExt;
        let response = self.complete(request).await?;
        let mut delta = ProviderDelta::new(0, response.text);
        delta.usage = response.usage;
        Ok(futures::stream::iter(vec![Ok(delta)]).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new("model-a", "Hello")
            .with_temperature(0.5)
            .with_max_output_tokens(50)
            .with_top_p(0.9)
            .with_stop_sequences(["\n\n"])
            .with_streaming(true);

        assert_eq!(request.model_id, "model-a");
        assert_eq!(request.temperature, 0.5);
        assert_eq!(request.max_output_tokens, 50);
        assert_eq!(request.stop_sequences, vec!["\n\n".to_string()]);
        assert!(request.streaming);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let r = GenerationRequest::new("m", "p").with_temperature(1.5);
        assert!(matches!(r.validate(), Err(LlmError::Validation(_))));

        let r = GenerationRequest::new("m", "p").with_temperature(f32::NAN);
        assert!(r.validate().is_err());

        let r = GenerationRequest::new("m", "p").with_top_p(-0.1);
        assert!(r.validate().is_err());

        let r = GenerationRequest::new("m", "p").with_max_output_tokens(0);
        assert!(r.validate().is_err());

        let r = GenerationRequest::new("m", "");
        assert!(r.validate().is_err());

        let r = GenerationRequest::new(" ", "p");
        assert!(r.validate().is_err());

        let r = GenerationRequest::new("m", "p").with_stop_sequences([""]);
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_bounds() {
        let r = GenerationRequest::new("m", "p")
            .with_temperature(0.0)
            .with_top_p(1.0);
        assert!(r.validate().is_ok());
        let r = GenerationRequest::new("m", "p").with_temperature(1.0);
        assert!(r.validate().is_ok());
    }

    #[test]
    fn test_auto_model() {
        assert!(GenerationRequest::new(AUTO_MODEL, "p").is_auto());
        assert!(!GenerationRequest::new("gpt-4o", "p").is_auto());
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
        assert_eq!(TokenUsage::default().total_tokens, 0);
    }

    #[test]
    fn test_failed_result() {
        let err = GenerationError::cancelled();
        let result = GenerationResult::failed(
            Uuid::new_v4(),
            "model-a",
            "mock",
            SystemTime::now(),
            err.clone(),
        );
        assert!(!result.is_success());
        assert!(result.text.is_empty());
        assert_eq!(result.error, Some(err));
        assert_eq!(result.token_usage.total_tokens, 0);
        assert!(!result.from_cache);
    }

    #[test]
    fn test_result_serialization() {
        let result = GenerationResult {
            request_id: Uuid::new_v4(),
            text: "hi".into(),
            model_id: "model-a".into(),
            provider_id: "mock".into(),
            started_at: SystemTime::now(),
            duration_ms: 3,
            token_usage: TokenUsage::new(1, 1),
            estimated_cost_usd: 0.25,
            error: None,
            from_cache: false,
        };
        let json = serde_json::to_string(&result).unwrap();
        let back: GenerationResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_provider_response_builder() {
        let r = ProviderResponse::new("text")
            .with_usage(3, 4)
            .with_finish_reason("stop");
        assert_eq!(r.usage, Some(TokenUsage::new(3, 4)));
        assert_eq!(r.finish_reason.as_deref(), Some("stop"));
    }
}

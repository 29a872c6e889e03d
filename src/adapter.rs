//! Provider adapter: one resilient front per transport.
//!
//! # Architecture
//!
//! ```text
//! generate / generate_stream
//!        │
//!        ▼
//! ┌──────────────────────┐   Validation / MissingCredential
//! │ pre-flight           │──────────────────────────────────▶ failed result
//! │  request.validate()  │   (no network call, never retried)
//! │  context window      │
//! │  has_credential()    │
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │ RetryExecutor        │  timeout per attempt, jittered backoff,
//! │  └─ LLMProvider call │  cancellation raced at every await
//! └──────────┬───────────┘
//!            ▼ (streaming)
//! ┌──────────────────────┐
//! │ ChunkSequencer       │  reorder → on_chunk(seq 0, 1, 2, ..., final)
//! └──────────┬───────────┘
//!            ▼
//!    GenerationResult (usage estimated if the vendor sent none)
//! ```
//!
//! A streaming attempt that fails after a chunk has reached the caller is not
//! retried: replaying it would duplicate text the subscriber already rendered.

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GenerationError, LlmError, Result};
use crate::model_config::{ModelDescriptor, ProviderConfig};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::stream::ChunkSequencer;
use crate::tokenizer::Tokenizer;
use crate::traits::{
    elapsed_ms, ChunkCallback, GenerationRequest, GenerationResult, LLMProvider, TokenUsage,
};

// ============================================================================
// Configuration
// ============================================================================

/// Adapter behaviour for one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    /// Attempts, backoff and per-attempt timeout.
    pub retry: RetryPolicy,
    /// Estimate usage with a tokenizer when the transport reports none.
    pub estimate_missing_usage: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            estimate_missing_usage: true,
        }
    }
}

impl AdapterConfig {
    /// Derive from a provider's TOML section.
    pub fn from_provider_config(config: &ProviderConfig) -> Self {
        Self {
            retry: RetryPolicy::default()
                .with_max_retries(config.max_retries)
                .with_base_delay(config.retry_base_delay())
                .with_timeout(config.timeout()),
            ..Default::default()
        }
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ============================================================================
// Per-request context
// ============================================================================

/// Identity, deadline and model metadata for one request.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    /// Id stamped on the result and every chunk.
    pub request_id: Uuid,
    /// When the request entered the system.
    pub started_at: SystemTime,
    /// Cancels the request when triggered.
    pub cancel: CancellationToken,
    /// Descriptor used for context-window checks and cost.
    pub model: Option<ModelDescriptor>,
}

impl Default for GenerationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationContext {
    /// Fresh context with a new request id.
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started_at: SystemTime::now(),
            cancel: CancellationToken::new(),
            model: None,
        }
    }

    /// Use a caller-supplied cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach the resolved model.
    pub fn with_model(mut self, model: ModelDescriptor) -> Self {
        self.model = Some(model);
        self
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Wraps one [`LLMProvider`] with validation, retry, reordering and cancellation.
#[derive(Clone)]
pub struct ProviderAdapter {
    provider: Arc<dyn LLMProvider>,
    config: AdapterConfig,
    executor: RetryExecutor,
}

impl std::fmt::Debug for ProviderAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAdapter")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish()
    }
}

impl ProviderAdapter {
    /// Create an adapter.
    pub fn new(provider: Arc<dyn LLMProvider>, config: AdapterConfig) -> Self {
        let executor = RetryExecutor::new(config.retry);
        Self {
            provider,
            config,
            executor,
        }
    }

    /// Create an adapter with default retry settings.
    pub fn with_defaults(provider: Arc<dyn LLMProvider>) -> Self {
        Self::new(provider, AdapterConfig::default())
    }

    /// Provider id served by this adapter.
    pub fn provider_id(&self) -> &str {
        self.provider.name()
    }

    /// The wrapped transport.
    pub fn provider(&self) -> &Arc<dyn LLMProvider> {
        &self.provider
    }

    /// Adapter configuration.
    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Checks performed before any network call.
    pub fn preflight(&self, request: &GenerationRequest, model: Option<&ModelDescriptor>) -> Result<()> {
        request.validate()?;

        if let Some(model) = model {
            let prompt_tokens = Tokenizer::for_model_or_approx(&model.id)
                .count_tokens(&request.prompt_text);
            let needed = prompt_tokens + request.max_output_tokens as u64;
            if needed > model.max_context_tokens {
                return Err(LlmError::Validation(format!(
                    "request needs ~{} tokens but '{}' has a {}-token context window",
                    needed, model.id, model.max_context_tokens
                )));
            }
        }

        if !self.provider.has_credential() {
            return Err(LlmError::MissingCredential {
                provider: self.provider_id().to_string(),
                env_var: self
                    .provider
                    .credential_env()
                    .unwrap_or("<unset>")
                    .to_string(),
            });
        }

        Ok(())
    }

    /// Generate a complete response. Never fails; errors land in the result.
    pub async fn generate(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
    ) -> GenerationResult {
        match self.try_generate(ctx, request).await {
            Ok((text, usage)) => self.settle(ctx, request, text, usage),
            Err(e) => self.fail(ctx, request, e),
        }
    }

    /// Generate incrementally, relaying ordered chunks to `on_chunk`.
    ///
    /// The aggregated result is still returned once the stream completes.
    pub async fn generate_stream(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> GenerationResult {
        match self.try_generate_stream(ctx, request, on_chunk).await {
            Ok((text, usage)) => self.settle(ctx, request, text, usage),
            Err(e) => self.fail(ctx, request, e),
        }
    }

    async fn try_generate(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
    ) -> Result<(String, TokenUsage)> {
        self.preflight(request, ctx.model.as_ref())?;

        let response = self
            .executor
            .execute(&ctx.cancel, move |attempt| {
                debug!(
                    request_id = %ctx.request_id,
                    provider = %self.provider_id(),
                    attempt,
                    "Dispatching completion"
                );
                self.provider.complete(request)
            })
            .await?;

        let usage = self.resolve_usage(request, &response.text, response.usage);
        Ok((response.text, usage))
    }

    async fn try_generate_stream(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<(String, TokenUsage)> {
        self.preflight(request, ctx.model.as_ref())?;

        let request_id = ctx.request_id;
        let delivered = AtomicBool::new(false);
        let delivered = &delivered;

        let mut sequencer = self
            .executor
            .execute_if(
                &ctx.cancel,
                move |e| e.is_transient() && !delivered.load(Ordering::SeqCst),
                move |attempt| async move {
                    debug!(
                        request_id = %request_id,
                        provider = %self.provider_id(),
                        attempt,
                        "Opening stream"
                    );
                    let mut deltas = self.provider.stream(request).await?;
                    let mut sequencer = ChunkSequencer::new(request_id);

                    while let Some(delta) = deltas.next().await {
                        for chunk in sequencer.push(delta?) {
                            delivered.store(true, Ordering::SeqCst);
                            on_chunk(chunk);
                        }
                    }
                    for chunk in sequencer.finish() {
                        delivered.store(true, Ordering::SeqCst);
                        on_chunk(chunk);
                    }
                    Ok(sequencer)
                },
            )
            .await?;

        on_chunk(sequencer.final_chunk());
        let (text, usage) = sequencer.into_parts();
        let usage = self.resolve_usage(request, &text, usage);
        Ok((text, usage))
    }

    fn resolve_usage(
        &self,
        request: &GenerationRequest,
        text: &str,
        reported: Option<TokenUsage>,
    ) -> TokenUsage {
        match reported {
            // Rebuild so the total is always the sum.
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None if self.config.estimate_missing_usage => {
                Tokenizer::for_model_or_approx(&request.model_id)
                    .estimate_usage(&request.prompt_text, text)
            }
            None => TokenUsage::default(),
        }
    }

    fn settle(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
        text: String,
        usage: TokenUsage,
    ) -> GenerationResult {
        let estimated_cost_usd = ctx
            .model
            .as_ref()
            .map(|m| m.estimate_cost(&usage))
            .unwrap_or(0.0);
        let duration_ms = elapsed_ms(ctx.started_at);

        info!(
            request_id = %ctx.request_id,
            provider = %self.provider_id(),
            model = %request.model_id,
            duration_ms,
            total_tokens = usage.total_tokens,
            "Generation completed"
        );

        GenerationResult {
            request_id: ctx.request_id,
            text,
            model_id: request.model_id.clone(),
            provider_id: self.provider_id().to_string(),
            started_at: ctx.started_at,
            duration_ms,
            token_usage: usage,
            estimated_cost_usd,
            error: None,
            from_cache: false,
        }
    }

    fn fail(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
        error: LlmError,
    ) -> GenerationResult {
        warn!(
            request_id = %ctx.request_id,
            provider = %self.provider_id(),
            model = %request.model_id,
            kind = %error.kind(),
            error = %error,
            "Generation failed"
        );
        GenerationResult::failed(
            ctx.request_id,
            request.model_id.clone(),
            self.provider_id(),
            ctx.started_at,
            GenerationError::from(&error),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::providers::{MockOutcome, MockProvider};
    use crate::traits::StreamChunk;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    fn fast_config(max_retries: u32) -> AdapterConfig {
        AdapterConfig::default().with_retry(
            RetryPolicy::default()
                .with_max_retries(max_retries)
                .with_base_delay(Duration::from_millis(1))
                .with_timeout(Duration::from_secs(5)),
        )
    }

    fn adapter(mock: &MockProvider, max_retries: u32) -> ProviderAdapter {
        ProviderAdapter::new(Arc::new(mock.clone()), fast_config(max_retries))
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("model-a", "Hello")
            .with_temperature(0.5)
            .with_max_output_tokens(50)
    }

    #[test]
    fn test_config_from_provider_config() {
        let mut provider = ProviderConfig::openai_compatible("p", "http://x", "K");
        provider.max_retries = 5;
        provider.timeout_seconds = 10;
        provider.retry_base_delay_ms = 250;
        let config = AdapterConfig::from_provider_config(&provider);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.timeout, Duration::from_secs(10));
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_generate_success() {
        let mock = MockProvider::new();
        mock.add_response("Hi there").await;
        let ctx = GenerationContext::new();

        let result = adapter(&mock, 3).generate(&ctx, &request()).await;
        assert!(result.is_success());
        assert_eq!(result.text, "Hi there");
        assert_eq!(result.request_id, ctx.request_id);
        assert_eq!(result.provider_id, "mock");
        assert_eq!(result.token_usage, TokenUsage::new(1, 2));
        assert!(!result.from_cache);
    }

    #[tokio::test]
    async fn test_missing_credential_fails_before_call() {
        let mock = MockProvider::new().without_credential();
        let result = adapter(&mock, 3)
            .generate(&GenerationContext::new(), &request())
            .await;

        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::MissingCredential);
        assert!(error.message.contains("MOCK_API_KEY"));
        assert!(result.text.is_empty());
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_validation_fails_before_call() {
        let mock = MockProvider::new();
        let bad = request().with_temperature(2.0);
        let result = adapter(&mock, 3)
            .generate(&GenerationContext::new(), &bad)
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_context_window_exceeded() {
        let mock = MockProvider::new();
        let tiny = ModelDescriptor::new("model-a", "mock", 0.0, 0.0, 10);
        let ctx = GenerationContext::new().with_model(tiny);
        let result = adapter(&mock, 3).generate(&ctx, &request()).await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.contains("context window"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::Transient("503".into())).await;
        mock.add_outcome(MockOutcome::Transient("503".into())).await;
        mock.add_response("finally").await;

        let result = adapter(&mock, 3)
            .generate(&GenerationContext::new(), &request())
            .await;
        assert!(result.is_success());
        assert_eq!(result.text, "finally");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_preserves_error() {
        let mock = MockProvider::new();
        for i in 0..3 {
            mock.add_outcome(MockOutcome::Transient(format!("upstream {}", i)))
                .await;
        }

        let result = adapter(&mock, 3)
            .generate(&GenerationContext::new(), &request())
            .await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, ErrorKind::TransientProvider);
        assert!(error.message.contains("upstream 2"));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::Rejected("bad prompt".into()))
            .await;
        let result = adapter(&mock, 3)
            .generate(&GenerationContext::new(), &request())
            .await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Validation);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_usage_estimated_when_missing() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::TextWithoutUsage("Some generated text".into()))
            .await;
        let result = adapter(&mock, 1)
            .generate(&GenerationContext::new(), &request())
            .await;
        let usage = result.token_usage;
        assert!(usage.prompt_tokens > 0);
        assert!(usage.completion_tokens > 0);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[tokio::test]
    async fn test_cost_from_model() {
        let mock = MockProvider::new();
        mock.add_response("a b c d").await;
        let model = ModelDescriptor::new("model-a", "mock", 1.0, 2.0, 4096);
        let ctx = GenerationContext::new().with_model(model);
        let result = adapter(&mock, 1).generate(&ctx, &request()).await;
        // 1 prompt word, 4 completion words
        let expected = (1.0 / 1000.0) * 1.0 + (4.0 / 1000.0) * 2.0;
        assert!((result.estimated_cost_usd - expected).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_stream_reorders_and_finishes() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::Deltas(vec![
            (2, "c".into()),
            (0, "a".into()),
            (1, "b".into()),
            (3, "d".into()),
        ]))
        .await;

        let chunks = Mutex::new(Vec::<StreamChunk>::new());
        let on_chunk = |c: StreamChunk| chunks.lock().unwrap().push(c);
        let ctx = GenerationContext::new();

        let result = adapter(&mock, 1)
            .generate_stream(&ctx, &request().with_streaming(true), &on_chunk)
            .await;

        assert!(result.is_success());
        assert_eq!(result.text, "abcd");

        let chunks = chunks.into_inner().unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c", "d", ""]);
        for pair in chunks.windows(2) {
            assert!(pair[0].sequence < pair[1].sequence);
        }
        let last = chunks.last().unwrap();
        assert!(last.is_final);
        assert!(chunks[..chunks.len() - 1].iter().all(|c| !c.is_final));
        assert!(chunks.iter().all(|c| c.request_id == ctx.request_id));
    }

    #[tokio::test]
    async fn test_stream_retries_before_first_chunk() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::Transient("reset".into())).await;
        mock.add_response("ok now").await;

        let count = Mutex::new(0usize);
        let on_chunk = |_c: StreamChunk| *count.lock().unwrap() += 1;
        let result = adapter(&mock, 3)
            .generate_stream(&GenerationContext::new(), &request(), &on_chunk)
            .await;

        assert!(result.is_success());
        assert_eq!(result.text, "ok now");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(*count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stream_failure_after_delivery_not_retried() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::DeltasThenFail(
            vec![(0, "partial".into())],
            "connection reset".into(),
        ))
        .await;
        mock.add_response("should not be used").await;

        let chunks = Mutex::new(Vec::<StreamChunk>::new());
        let on_chunk = |c: StreamChunk| chunks.lock().unwrap().push(c);
        let result = adapter(&mock, 3)
            .generate_stream(&GenerationContext::new(), &request(), &on_chunk)
            .await;

        assert_eq!(result.error.unwrap().kind, ErrorKind::TransientProvider);
        assert!(result.text.is_empty());
        assert_eq!(mock.call_count(), 1);
        let chunks = chunks.into_inner().unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(!chunks[0].is_final);
    }

    #[tokio::test]
    async fn test_cancel_in_flight() {
        let mock = MockProvider::new();
        mock.add_outcome(MockOutcome::delayed(
            Duration::from_secs(10),
            MockOutcome::Text("too late".into()),
        ))
        .await;

        let ctx = GenerationContext::new();
        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = adapter(&mock, 3).generate(&ctx, &request()).await;
        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_stops_chunks() {
        let mock = MockProvider::new().with_chunk_delay(Duration::from_millis(30));
        mock.add_outcome(MockOutcome::Deltas(
            (0..50).map(|i| (i, format!("w{} ", i))).collect(),
        ))
        .await;

        let ctx = GenerationContext::new();
        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let chunks = Mutex::new(Vec::<StreamChunk>::new());
        let on_chunk = |c: StreamChunk| chunks.lock().unwrap().push(c);
        let result = adapter(&mock, 1)
            .generate_stream(&ctx, &request(), &on_chunk)
            .await;

        assert_eq!(result.error.unwrap().kind, ErrorKind::Cancelled);
        let delivered = chunks.lock().unwrap().len();
        assert!(delivered < 50);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(chunks.lock().unwrap().len(), delivered);
        assert!(chunks.lock().unwrap().iter().all(|c| !c.is_final));
    }
}

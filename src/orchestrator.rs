//! Request orchestration.
//!
//! # State Machine
//!
//! ```text
//! Created ─▶ CacheCheck ─┬─▶ CacheHit ──────────────────────────────▶ Completed
//!                        │
//!                        └─▶ CacheMiss ─▶ Dispatching ─┬─▶ Streaming ─┐
//!                                              │       └──────────────┤
//!                                              │                      ▼
//!                                              │               PostProcessing ─▶ Completed
//!                                              └──────────────────────┴───────▶ Failed
//! ```
//!
//! Every request settles into exactly one terminal state and always yields a
//! [`GenerationResult`]: failures carry `error` and empty `text` instead of
//! surfacing as `Err`.
//!
//! # Responsibilities
//!
//! | Step | Component |
//! |------|-----------|
//! | Cache key | [`RequestFingerprinter`] |
//! | Cache lookup/store | [`ResponseCache`] |
//! | Model resolution, `"auto"` selection | [`ModelRegistry`] + [`SelectionPolicy`] |
//! | Guards, post-processing | [`MiddlewareStack`] |
//! | In-flight bound | `tokio::sync::Semaphore` |
//! | Provider call, retry, reordering | [`ProviderAdapter`](crate::adapter::ProviderAdapter) |
//! | Accounting | [`UsageTracker`] |
//!
//! The orchestrator never retries across providers; retry belongs to the
//! adapter of the single provider serving the model.
//!
//! # Example
//!
//! ```rust,ignore
//! use edgequake_orchestrator::{GenerationRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::load()?;
//! let request = GenerationRequest::new("gpt-4o-mini", "Hello").with_streaming(true);
//! let result = orchestrator
//!     .submit(&request, Some(&|chunk| print!("{}", chunk.text)))
//!     .await;
//! ```

use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::GenerationContext;
use crate::cache::{CacheConfig, ResponseCache};
use crate::error::{GenerationError, LlmError, Result};
use crate::factory::ProviderFactory;
use crate::fingerprint::RequestFingerprinter;
use crate::middleware::{GenerationMiddleware, MiddlewareStack};
use crate::model_config::{DefaultsConfig, ModelDescriptor, ModelsConfig, SelectionPolicyKind};
use crate::registry::{ModelRegistry, ProviderRegistry};
use crate::tokenizer::Tokenizer;
use crate::traits::{elapsed_ms, ChunkCallback, GenerationRequest, GenerationResult, StreamChunk};
use crate::usage::UsageTracker;

// ============================================================================
// Request State
// ============================================================================

/// Lifecycle state of one orchestrated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Accepted, nothing done yet.
    Created,
    /// Fingerprinting and cache lookup.
    CacheCheck,
    /// Served from the cache.
    CacheHit,
    /// Not cached; will dispatch.
    CacheMiss,
    /// Resolving the model and calling the adapter.
    Dispatching,
    /// Relaying chunks to the subscriber.
    Streaming,
    /// Running post-processing hooks and pricing.
    PostProcessing,
    /// Succeeded.
    Completed,
    /// Settled with an error.
    Failed,
}

impl RequestState {
    /// `Completed` and `Failed` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        match (self, next) {
            (Created, CacheCheck) => true,
            (CacheCheck, CacheHit | CacheMiss | Failed) => true,
            (CacheHit, Completed) => true,
            (CacheMiss, Dispatching) => true,
            (Dispatching, Streaming | PostProcessing | Failed) => true,
            (Streaming, PostProcessing | Failed) => true,
            (PostProcessing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Created => "created",
            RequestState::CacheCheck => "cache_check",
            RequestState::CacheHit => "cache_hit",
            RequestState::CacheMiss => "cache_miss",
            RequestState::Dispatching => "dispatching",
            RequestState::Streaming => "streaming",
            RequestState::PostProcessing => "post_processing",
            RequestState::Completed => "completed",
            RequestState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks and logs one request's transitions.
struct Lifecycle {
    request_id: Uuid,
    state: RequestState,
}

impl Lifecycle {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            state: RequestState::Created,
        }
    }

    fn advance(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        debug!(
            request_id = %self.request_id,
            from = %self.state,
            state = %next,
            "Request state transition"
        );
        self.state = next;
    }
}

// ============================================================================
// Selection Policy
// ============================================================================

/// How a model is chosen when the request asks for [`AUTO_MODEL`](crate::traits::AUTO_MODEL).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Cheapest combined per-1k price.
    #[default]
    LowestCost,
    /// Largest context window.
    LargestContext,
    /// Always the named model.
    Fixed(String),
}

impl From<SelectionPolicyKind> for SelectionPolicy {
    fn from(kind: SelectionPolicyKind) -> Self {
        match kind {
            SelectionPolicyKind::LowestCost => SelectionPolicy::LowestCost,
            SelectionPolicyKind::LargestContext => SelectionPolicy::LargestContext,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// TTL for results written to the cache.
    pub cache_ttl: Duration,
    /// Bound on simultaneous provider calls.
    pub max_concurrent_requests: usize,
    /// Policy for `"auto"` requests.
    pub selection_policy: SelectionPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_defaults(&DefaultsConfig::default())
    }
}

impl OrchestratorConfig {
    /// Build from the `[defaults]` section.
    pub fn from_defaults(defaults: &DefaultsConfig) -> Self {
        Self {
            cache_ttl: Duration::from_secs(defaults.cache_ttl_seconds),
            max_concurrent_requests: defaults.max_concurrent_requests,
            selection_policy: defaults.selection_policy.into(),
        }
    }

    /// Set the cache TTL.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set the in-flight bound.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Set the auto-selection policy.
    pub fn with_selection_policy(mut self, policy: SelectionPolicy) -> Self {
        self.selection_policy = policy;
        self
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Entry point for generation requests.
pub struct Orchestrator {
    models: Arc<ModelRegistry>,
    providers: Arc<ProviderRegistry>,
    cache: Arc<ResponseCache>,
    usage: Arc<UsageTracker>,
    middleware: MiddlewareStack,
    fingerprinter: RequestFingerprinter,
    gate: Semaphore,
    config: OrchestratorConfig,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("models", &self.models.len())
            .field("providers", &self.providers.list())
            .field("middleware", &self.middleware)
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    /// Start building an orchestrator from explicit parts.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Build the full object graph from a loaded configuration.
    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        let models = ModelRegistry::from_config(config)?;
        let providers = ProviderFactory::from_config(config)?;
        let cache = ResponseCache::new(
            CacheConfig::new(config.defaults.cache_max_entries)
                .with_ttl(Duration::from_secs(config.defaults.cache_ttl_seconds)),
        );

        Ok(Self::builder()
            .models(models)
            .providers(providers)
            .cache(Arc::new(cache))
            .config(OrchestratorConfig::from_defaults(&config.defaults))
            .build())
    }

    /// Load `models.toml` from the standard locations and build.
    pub fn load() -> Result<Self> {
        Self::from_config(&ModelsConfig::load()?)
    }

    /// Model registry in use.
    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Provider adapters in use.
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Shared response cache.
    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Shared usage tracker.
    pub fn usage(&self) -> &Arc<UsageTracker> {
        &self.usage
    }

    /// Active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Provider-call permits currently free.
    pub fn available_permits(&self) -> usize {
        self.gate.available_permits()
    }

    /// Process one request.
    ///
    /// When `request.streaming` is set, ordered chunks are relayed to
    /// `on_chunk` as they arrive. The aggregated result is returned either way.
    pub async fn submit(
        &self,
        request: &GenerationRequest,
        on_chunk: Option<ChunkCallback<'_>>,
    ) -> GenerationResult {
        self.submit_with_cancel(request, on_chunk, CancellationToken::new())
            .await
    }

    /// Like [`Orchestrator::submit`], aborting when `cancel` fires.
    pub async fn submit_with_cancel(
        &self,
        request: &GenerationRequest,
        on_chunk: Option<ChunkCallback<'_>>,
        cancel: CancellationToken,
    ) -> GenerationResult {
        let ctx = GenerationContext::new().with_cancel(cancel);
        let mut lifecycle = Lifecycle::new(ctx.request_id);

        let result = self.run(ctx, request, on_chunk, &mut lifecycle).await;

        self.usage.record(&result);
        self.middleware.after(request, &result).await;

        info!(
            request_id = %result.request_id,
            model = %result.model_id,
            provider = %result.provider_id,
            state = %lifecycle.state,
            from_cache = result.from_cache,
            duration_ms = result.duration_ms,
            "Request settled"
        );
        result
    }

    /// Process several requests concurrently, results in input order.
    pub async fn submit_all(&self, requests: &[GenerationRequest]) -> Vec<GenerationResult> {
        futures::future::join_all(requests.iter().map(|r| self.submit(r, None))).await
    }

    async fn run(
        &self,
        mut ctx: GenerationContext,
        request: &GenerationRequest,
        on_chunk: Option<ChunkCallback<'_>>,
        lifecycle: &mut Lifecycle,
    ) -> GenerationResult {
        lifecycle.advance(RequestState::CacheCheck);

        if ctx.cancel.is_cancelled() {
            return self.fail(&ctx, request, "", LlmError::Cancelled, lifecycle);
        }

        let request = match self.resolve_auto(request) {
            Ok(request) => request,
            Err(e) => return self.fail(&ctx, request, "", e, lifecycle),
        };

        let fingerprint = self.fingerprinter.fingerprint(&request);
        if let Some(cached) = self.cache.get(&fingerprint) {
            lifecycle.advance(RequestState::CacheHit);
            info!(
                request_id = %ctx.request_id,
                model = %request.model_id,
                "Cache hit"
            );
            if request.streaming {
                if let Some(on_chunk) = on_chunk {
                    replay_cached(ctx.request_id, &cached.text, on_chunk);
                }
            }
            lifecycle.advance(RequestState::Completed);
            return GenerationResult {
                request_id: ctx.request_id,
                started_at: ctx.started_at,
                duration_ms: elapsed_ms(ctx.started_at),
                from_cache: true,
                ..cached
            };
        }
        lifecycle.advance(RequestState::CacheMiss);
        lifecycle.advance(RequestState::Dispatching);

        let model = match self.models.resolve(&request.model_id) {
            Ok(model) => model.clone(),
            Err(e) => return self.fail(&ctx, &request, "", e, lifecycle),
        };
        let Some(adapter) = self.providers.get(&model.provider_id) else {
            let e = LlmError::Configuration(format!(
                "no adapter registered for provider '{}'",
                model.provider_id
            ));
            return self.fail(&ctx, &request, &model.provider_id, e, lifecycle);
        };

        if let Err(e) = self.middleware.before(&request).await {
            return self.fail(&ctx, &request, &model.provider_id, e, lifecycle);
        }

        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            permit = self.gate.acquire() => permit.ok(),
        };
        let Some(guard) = permit else {
            let e = if ctx.cancel.is_cancelled() {
                LlmError::Cancelled
            } else {
                LlmError::Configuration("request gate closed".to_string())
            };
            return self.fail(&ctx, &request, &model.provider_id, e, lifecycle);
        };

        ctx = ctx.with_model(model.clone());
        let mut result = if request.streaming {
            lifecycle.advance(RequestState::Streaming);
            let noop = |_: StreamChunk| {};
            let relay = on_chunk.unwrap_or(&noop);
            adapter.generate_stream(&ctx, &request, relay).await
        } else {
            adapter.generate(&ctx, &request).await
        };
        drop(guard);

        if !result.is_success() {
            lifecycle.advance(RequestState::Failed);
            return result;
        }

        lifecycle.advance(RequestState::PostProcessing);
        result.text = self.middleware.post_process(std::mem::take(&mut result.text));
        result.estimated_cost_usd = model.estimate_cost(&result.token_usage);
        result.duration_ms = elapsed_ms(ctx.started_at);

        if ctx.cancel.is_cancelled() {
            debug!(request_id = %ctx.request_id, "Cancelled after completion, not caching");
        } else {
            self.cache
                .put(&fingerprint, result.clone(), self.config.cache_ttl);
        }

        lifecycle.advance(RequestState::Completed);
        result
    }

    /// Substitute the policy's choice for `"auto"` requests.
    fn resolve_auto<'r>(&self, request: &'r GenerationRequest) -> Result<Cow<'r, GenerationRequest>> {
        if !request.is_auto() {
            return Ok(Cow::Borrowed(request));
        }
        let model = self.select_model(request)?;
        debug!(model = %model.id, policy = ?self.config.selection_policy, "Auto-selected model");
        let mut resolved = request.clone();
        resolved.model_id = model.id.clone();
        Ok(Cow::Owned(resolved))
    }

    /// Pick a model for an `"auto"` request under the configured policy.
    pub fn select_model(&self, request: &GenerationRequest) -> Result<&ModelDescriptor> {
        let policy = &self.config.selection_policy;
        if let SelectionPolicy::Fixed(id) = policy {
            return self.models.resolve(id);
        }

        let candidates = self.models.all().iter().filter(|m| {
            if !self.providers.has(&m.provider_id) {
                return false;
            }
            let prompt = Tokenizer::for_model_or_approx(&m.id).count_tokens(&request.prompt_text);
            prompt + request.max_output_tokens as u64 <= m.max_context_tokens
        });

        let chosen = match policy {
            SelectionPolicy::LargestContext => candidates.reduce(|best, m| {
                if m.max_context_tokens > best.max_context_tokens {
                    m
                } else {
                    best
                }
            }),
            _ => candidates.reduce(|best, m| if m.unit_cost() < best.unit_cost() { m } else { best }),
        };

        chosen.ok_or_else(|| {
            LlmError::UnknownModel(format!(
                "{}: no registered model fits the request",
                request.model_id
            ))
        })
    }

    fn fail(
        &self,
        ctx: &GenerationContext,
        request: &GenerationRequest,
        provider_id: &str,
        error: LlmError,
        lifecycle: &mut Lifecycle,
    ) -> GenerationResult {
        warn!(
            request_id = %ctx.request_id,
            model = %request.model_id,
            kind = %error.kind(),
            error = %error,
            "Request failed before dispatch"
        );
        lifecycle.advance(RequestState::Failed);
        GenerationResult::failed(
            ctx.request_id,
            request.model_id.clone(),
            provider_id,
            ctx.started_at,
            GenerationError::from(&error),
        )
    }
}

/// Deliver a cached answer to a streaming subscriber: the whole text as one
/// chunk, then the empty final chunk.
fn replay_cached(request_id: Uuid, text: &str, on_chunk: ChunkCallback<'_>) {
    let mut sequence = 0;
    if !text.is_empty() {
        on_chunk(StreamChunk {
            request_id,
            sequence,
            text: text.to_string(),
            is_final: false,
        });
        sequence += 1;
    }
    on_chunk(StreamChunk {
        request_id,
        sequence,
        text: String::new(),
        is_final: true,
    });
}

// ============================================================================
// Builder
// ============================================================================

/// Explicit wiring for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    models: ModelRegistry,
    providers: ProviderRegistry,
    cache: Option<Arc<ResponseCache>>,
    usage: Option<Arc<UsageTracker>>,
    middleware: MiddlewareStack,
    config: OrchestratorConfig,
}

impl OrchestratorBuilder {
    /// Set the model registry.
    pub fn models(mut self, models: ModelRegistry) -> Self {
        self.models = models;
        self
    }

    /// Set the provider adapters.
    pub fn providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Share a cache, possibly with other orchestrators.
    pub fn cache(mut self, cache: Arc<ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share a usage tracker, possibly with other orchestrators.
    pub fn usage(mut self, usage: Arc<UsageTracker>) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Append a middleware.
    pub fn middleware(mut self, middleware: Arc<dyn GenerationMiddleware>) -> Self {
        self.middleware.add(middleware);
        self
    }

    /// Set the orchestrator config.
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish wiring.
    pub fn build(self) -> Orchestrator {
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(ResponseCache::new(
                CacheConfig::default().with_ttl(self.config.cache_ttl),
            ))
        });
        Orchestrator {
            models: Arc::new(self.models),
            providers: Arc::new(self.providers),
            cache,
            usage: self.usage.unwrap_or_default(),
            middleware: self.middleware,
            fingerprinter: RequestFingerprinter::new(),
            gate: Semaphore::new(self.config.max_concurrent_requests.max(1)),
            config: self.config,
        }
    }
}

//! EdgeQuake Orchestrator - Multi-Provider Generation Bridge
//!
//! Accepts generation requests from UI callers, routes them to the provider
//! serving the requested model, and returns a uniform result whether the
//! answer came from the network, from the cache, or not at all.
//!
//! # Architecture
//!
//! ```text
//!  submit(request, on_chunk?)
//!          │
//!          ▼
//! ┌─────────────────┐  fingerprint  ┌─────────────────┐
//! │  Orchestrator   │──────────────▶│  ResponseCache  │ LRU + TTL (+ KeyValueStore)
//! │  state machine  │◀──────────────│                 │
//! └───────┬─────────┘    hit/miss   └─────────────────┘
//!         │ resolve
//!         ▼
//! ┌─────────────────┐               ┌─────────────────┐
//! │  ModelRegistry  │               │  UsageTracker   │◀── every settled result
//! └───────┬─────────┘               └─────────────────┘
//!         │ provider_id
//!         ▼
//! ┌─────────────────┐   retry, timeout, reorder, cancel
//! │ ProviderAdapter │──────────────────────────────────▶ LLMProvider (HTTP / mock)
//! └─────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`traits`] | Request/result types and the [`LLMProvider`] transport trait |
//! | [`model_config`] | `models.toml` schema and loading |
//! | [`registry`] | [`ModelRegistry`] and [`ProviderRegistry`] |
//! | [`fingerprint`] | Deterministic cache keys |
//! | [`cache`], [`storage`] | Response cache and its optional backing store |
//! | [`adapter`], [`retry`], [`stream`] | Resilient provider calls |
//! | [`orchestrator`], [`middleware`] | Request lifecycle and hooks |
//! | [`usage`] | Token and cost accounting |
//! | [`factory`] | Wiring from configuration |
//!
//! # Example
//!
//! ```ignore
//! use edgequake_orchestrator::{GenerationRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::load()?;
//! let result = orchestrator
//!     .submit(&GenerationRequest::new("gpt-4o-mini", "Hello"), None)
//!     .await;
//! match &result.error {
//!     None => println!("{}", result.text),
//!     Some(e) => eprintln!("{}", e),
//! }
//! ```

pub mod adapter;
pub mod cache;
pub mod error;
pub mod factory;
pub mod fingerprint;
pub mod middleware;
pub mod model_config;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod stream;
pub mod tokenizer;
pub mod traits;
pub mod usage;

pub use adapter::{AdapterConfig, GenerationContext, ProviderAdapter};
pub use cache::{CacheConfig, CacheEntry, CacheStats, ResponseCache};
pub use error::{ErrorKind, GenerationError, LlmError, Result};
pub use factory::ProviderFactory;
pub use fingerprint::RequestFingerprinter;
pub use middleware::{
    GenerationMiddleware, LogLevel, LoggingMiddleware, MiddlewareStack, PromptLimitMiddleware,
    SanitizeMiddleware,
};
pub use model_config::{
    DefaultsConfig, ModelConfigError, ModelDescriptor, ModelsConfig, ProviderConfig, ProviderType,
    SelectionPolicyKind,
};
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, OrchestratorConfig, RequestState, SelectionPolicy,
};
pub use providers::{MockOutcome, MockProvider, OpenAICompatibleProvider};
pub use registry::{ModelRegistry, ProviderRegistry};
pub use retry::{RetryExecutor, RetryPolicy};
pub use storage::{InMemoryStore, KeyValueStore};
pub use stream::ChunkSequencer;
pub use tokenizer::Tokenizer;
pub use traits::{
    ChunkCallback, GenerationRequest, GenerationResult, LLMProvider, ProviderDelta,
    ProviderResponse, StreamChunk, TokenUsage, AUTO_MODEL,
};
pub use usage::{format_cost, format_tokens, ModelUsage, UsageReport, UsageTracker};

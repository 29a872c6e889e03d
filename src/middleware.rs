//! Generation middleware: request guards and post-processing hooks.
//!
//! # Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Orchestrator request pipeline                  │
//! │                                                                 │
//! │  Request ──►  [Middleware 1]  ──►  [Middleware 2]  ──►  ...     │
//! │                    │                    │                       │
//! │                 before()             before()     (may reject)  │
//! │                    └────────┬───────────┘                       │
//! │                             ▼                                   │
//! │                ┌────────────────────────┐                       │
//! │                │ ProviderAdapter        │                       │
//! │                └────────────────────────┘                       │
//! │                             │                                   │
//! │                 post_process(text), registration order          │
//! │                             │                                   │
//! │  Result  ◄──  [Middleware 1]  ◄──  [Middleware 2]  ◄──  after() │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `post_process` runs only on successful provider output, never on cache
//! hits: cached text has already been processed once.
//!
//! # Example
//! ```ignore
//! use edgequake_orchestrator::middleware::{LoggingMiddleware, MiddlewareStack, SanitizeMiddleware};
//!
//! let mut stack = MiddlewareStack::new();
//! stack.add(Arc::new(LoggingMiddleware::new()));
//! stack.add(Arc::new(SanitizeMiddleware::new()));
//! ```

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::error::{LlmError, Result};
use crate::traits::{GenerationRequest, GenerationResult};

// ============================================================================
// Middleware Trait
// ============================================================================

/// Hook into every orchestrated request.
///
/// `before` runs in registration order, `after` in reverse order.
#[async_trait]
pub trait GenerationMiddleware: Send + Sync {
    /// Middleware name for debugging and logging.
    fn name(&self) -> &str;

    /// Called before dispatch. Return `Err` to reject the request.
    async fn before(&self, request: &GenerationRequest) -> Result<()> {
        let _ = request;
        Ok(())
    }

    /// Transform the assembled text of a successful generation.
    fn post_process(&self, text: String) -> String {
        text
    }

    /// Called once the result has settled, success or failure.
    async fn after(&self, request: &GenerationRequest, result: &GenerationResult) {
        let _ = (request, result);
    }
}

// ============================================================================
// Middleware Stack
// ============================================================================

/// Ordered collection of middlewares.
#[derive(Default, Clone)]
pub struct MiddlewareStack {
    middlewares: Vec<Arc<dyn GenerationMiddleware>>,
}

impl std::fmt::Debug for MiddlewareStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.middlewares.iter().map(|m| m.name()))
            .finish()
    }
}

impl MiddlewareStack {
    /// Create a new empty middleware stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a middleware to the stack.
    pub fn add(&mut self, middleware: Arc<dyn GenerationMiddleware>) {
        self.middlewares.push(middleware);
    }

    /// Get the number of middlewares.
    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    /// Check if the stack is empty.
    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Run every `before` hook, stopping at the first rejection.
    pub async fn before(&self, request: &GenerationRequest) -> Result<()> {
        for middleware in &self.middlewares {
            middleware.before(request).await?;
        }
        Ok(())
    }

    /// Thread the text through every `post_process` hook.
    pub fn post_process(&self, text: String) -> String {
        self.middlewares.iter().fold(text, |text, middleware| {
            let processed = middleware.post_process(text);
            debug!(middleware = middleware.name(), "Post-processing applied");
            processed
        })
    }

    /// Run every `after` hook in reverse order.
    pub async fn after(&self, request: &GenerationRequest, result: &GenerationResult) {
        for middleware in self.middlewares.iter().rev() {
            middleware.after(request, result).await;
        }
    }
}

// ============================================================================
// Built-in Middleware Implementations
// ============================================================================

/// Logging middleware that logs requests and results.
///
/// Prompt text is never logged above `Trace`; only its length.
pub struct LoggingMiddleware {
    log_level: LogLevel,
}

/// Log level for logging middleware.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogLevel {
    /// Request/result summary.
    #[default]
    Info,
    /// Adds sampling parameters and a result preview.
    Debug,
    /// Full request and result.
    Trace,
}

impl LoggingMiddleware {
    /// Create a new logging middleware with default settings.
    pub fn new() -> Self {
        Self {
            log_level: LogLevel::Info,
        }
    }

    /// Create a logging middleware with specified log level.
    pub fn with_level(level: LogLevel) -> Self {
        Self { log_level: level }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

fn preview(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let truncated: String = text.chars().take(max - 3).collect();
        format!("{}...", truncated)
    } else {
        text.to_string()
    }
}

#[async_trait]
impl GenerationMiddleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(&self, request: &GenerationRequest) -> Result<()> {
        match self.log_level {
            LogLevel::Info => {
                info!(
                    model = %request.model_id,
                    prompt_chars = request.prompt_text.chars().count(),
                    streaming = request.streaming,
                    "[GEN] Request"
                );
            }
            LogLevel::Debug => {
                debug!(
                    model = %request.model_id,
                    prompt_chars = request.prompt_text.chars().count(),
                    temperature = request.temperature,
                    max_output_tokens = request.max_output_tokens,
                    top_p = request.top_p,
                    stops = request.stop_sequences.len(),
                    streaming = request.streaming,
                    "[GEN] Request"
                );
            }
            LogLevel::Trace => {
                trace!(request = ?request, "[GEN] Full request");
            }
        }
        Ok(())
    }

    async fn after(&self, request: &GenerationRequest, result: &GenerationResult) {
        match self.log_level {
            LogLevel::Info => {
                info!(
                    request_id = %result.request_id,
                    model = %result.model_id,
                    provider = %result.provider_id,
                    tokens = result.token_usage.total_tokens,
                    duration_ms = result.duration_ms,
                    from_cache = result.from_cache,
                    success = result.is_success(),
                    "[GEN] Result"
                );
            }
            LogLevel::Debug => {
                debug!(
                    request_id = %result.request_id,
                    model = %request.model_id,
                    tokens = result.token_usage.total_tokens,
                    cost_usd = result.estimated_cost_usd,
                    error = ?result.error,
                    text_preview = %preview(&result.text, 200),
                    "[GEN] Result"
                );
            }
            LogLevel::Trace => {
                trace!(result = ?result, "[GEN] Full result");
            }
        }
    }
}

/// Strips control characters (except `\n` and `\t`) and trailing whitespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct SanitizeMiddleware;

impl SanitizeMiddleware {
    /// Create a sanitizer.
    pub fn new() -> Self {
        Self
    }

    /// Apply the sanitization rules to `text`.
    pub fn sanitize(text: &str) -> String {
        let cleaned: String = text
            .chars()
            .filter(|&c| !c.is_control() || c == '\n' || c == '\t')
            .collect();
        cleaned.trim_end().to_string()
    }
}

#[async_trait]
impl GenerationMiddleware for SanitizeMiddleware {
    fn name(&self) -> &str {
        "sanitize"
    }

    fn post_process(&self, text: String) -> String {
        Self::sanitize(&text)
    }
}

/// Rejects prompts longer than a character limit before any provider call.
#[derive(Debug, Clone, Copy)]
pub struct PromptLimitMiddleware {
    max_chars: usize,
}

impl PromptLimitMiddleware {
    /// Limit prompts to `max_chars` characters.
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl GenerationMiddleware for PromptLimitMiddleware {
    fn name(&self) -> &str {
        "prompt_limit"
    }

    async fn before(&self, request: &GenerationRequest) -> Result<()> {
        let chars = request.prompt_text.chars().count();
        if chars > self.max_chars {
            return Err(LlmError::Validation(format!(
                "prompt has {} characters, limit is {}",
                chars, self.max_chars
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

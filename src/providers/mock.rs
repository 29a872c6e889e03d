//! Scripted mock transport for testing.
//!
//! `MockProvider` replays a queue of [`MockOutcome`]s, one per call, so
//! retry, streaming and cancellation behaviour can be exercised without a
//! network:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ queue: [Transient("503"), Transient("503"), Text("Hi")]      │
//! │                                                              │
//! │ call 1 ──▶ Err(TransientProvider)                            │
//! │ call 2 ──▶ Err(TransientProvider)                            │
//! │ call 3 ──▶ Ok("Hi")                                          │
//! │ call 4 ──▶ Ok("Mock response")   (queue empty: default)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The default answer is for tests only. A mock declared in `models.toml`
//! (`type = "mock"`) is built with [`MockProvider::without_default_response`]
//! and fails with a configuration error once its queue is empty.
//!
//! Usage is reported as whitespace word counts so tests can predict costs.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{LlmError, Result};
use crate::traits::{GenerationRequest, LLMProvider, ProviderDelta, ProviderResponse, TokenUsage};

/// Text returned when the queue is empty.
pub const DEFAULT_MOCK_RESPONSE: &str = "Mock response";

/// One scripted provider reaction.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Succeed with this text and report word-count usage.
    Text(String),
    /// Succeed with this text but report no usage.
    TextWithoutUsage(String),
    /// Stream these `(index, text)` deltas in the given order.
    Deltas(Vec<(u64, String)>),
    /// Stream these deltas, then fail with a transient error.
    DeltasThenFail(Vec<(u64, String)>, String),
    /// Fail with a retryable error.
    Transient(String),
    /// Fail with a permanent validation error.
    Rejected(String),
    /// Sleep, then behave like the inner outcome.
    Delayed(Duration, Box<MockOutcome>),
}

impl MockOutcome {
    /// Convenience constructor for [`MockOutcome::Delayed`].
    pub fn delayed(delay: Duration, then: MockOutcome) -> Self {
        MockOutcome::Delayed(delay, Box::new(then))
    }
}

/// Mock LLM provider for testing.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    responses: Arc<Mutex<VecDeque<MockOutcome>>>,
    call_count: Arc<AtomicUsize>,
    has_credential: Arc<AtomicBool>,
    chunk_delay: Duration,
    default_response: bool,
    last_request: Arc<Mutex<Option<GenerationRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider named "mock" with a credential.
    pub fn new() -> Self {
        Self::with_name("mock")
    }

    /// Create a mock provider under a custom provider id.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            responses: Arc::new(Mutex::new(VecDeque::new())),
            call_count: Arc::new(AtomicUsize::new(0)),
            has_credential: Arc::new(AtomicBool::new(true)),
            chunk_delay: Duration::ZERO,
            default_response: true,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Simulate a provider with no API key configured.
    pub fn without_credential(self) -> Self {
        self.has_credential.store(false, Ordering::SeqCst);
        self
    }

    /// Pause between streamed deltas.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Fail instead of answering [`DEFAULT_MOCK_RESPONSE`] when the queue is
    /// empty.
    pub fn without_default_response(mut self) -> Self {
        self.default_response = false;
        self
    }

    /// Toggle the credential at runtime.
    pub fn set_credential(&self, present: bool) {
        self.has_credential.store(present, Ordering::SeqCst);
    }

    /// Add a successful text response to the queue.
    pub async fn add_response(&self, response: impl Into<String>) {
        self.add_outcome(MockOutcome::Text(response.into())).await;
    }

    /// Add any scripted outcome to the queue.
    pub async fn add_outcome(&self, outcome: MockOutcome) {
        self.responses.lock().await.push_back(outcome);
    }

    /// Synchronous version of add_response for test setup.
    pub fn add_response_sync(&self, response: impl Into<String>) {
        self.add_outcome_sync(MockOutcome::Text(response.into()));
    }

    /// Synchronous version of add_outcome for test setup.
    ///
    /// # Panics
    ///
    /// Panics if the queue is locked by an in-flight call; use
    /// [`MockProvider::add_outcome`] once the provider is in use.
    pub fn add_outcome_sync(&self, outcome: MockOutcome) {
        match self.responses.try_lock() {
            Ok(mut responses) => responses.push_back(outcome),
            Err(_) => panic!(
                "MockProvider '{}': outcome queue is busy, use add_outcome().await",
                self.name
            ),
        }
    }

    /// Number of transport calls made so far.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Check if all queued outcomes have been consumed.
    pub async fn is_exhausted(&self) -> bool {
        self.responses.lock().await.is_empty()
    }

    /// The most recent request seen by the transport.
    pub async fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().await.clone()
    }

    /// Pop the next outcome, resolving any delay.
    async fn next_outcome(&self, request: &GenerationRequest) -> Result<MockOutcome> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().await = Some(request.clone());

        let queued = self.responses.lock().await.pop_front();
        let mut outcome = match queued {
            Some(outcome) => outcome,
            None if self.default_response => {
                MockOutcome::Text(DEFAULT_MOCK_RESPONSE.to_string())
            }
            None => {
                return Err(LlmError::Configuration(format!(
                    "mock provider '{}' has no scripted outcome",
                    self.name
                )))
            }
        };

        while let MockOutcome::Delayed(delay, inner) = outcome {
            tokio::time::sleep(delay).await;
            outcome = *inner;
        }
        Ok(outcome)
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn word_usage(prompt: &str, completion: &str) -> TokenUsage {
    TokenUsage::new(
        prompt.split_whitespace().count() as u64,
        completion.split_whitespace().count() as u64,
    )
}

fn assemble(deltas: &[(u64, String)]) -> String {
    let mut ordered: Vec<&(u64, String)> = deltas.iter().collect();
    ordered.sort_by_key(|(index, _)| *index);
    ordered.into_iter().map(|(_, text)| text.as_str()).collect()
}

#[async_trait]
impl LLMProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn has_credential(&self) -> bool {
        self.has_credential.load(Ordering::SeqCst)
    }

    fn credential_env(&self) -> Option<&str> {
        Some("MOCK_API_KEY")
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<ProviderResponse> {
        match self.next_outcome(request).await? {
            MockOutcome::Text(text) => {
                let usage = word_usage(&request.prompt_text, &text);
                Ok(ProviderResponse {
                    text,
                    usage: Some(usage),
                    finish_reason: Some("stop".to_string()),
                })
            }
            MockOutcome::TextWithoutUsage(text) => Ok(ProviderResponse::new(text)),
            MockOutcome::Deltas(deltas) => {
                let text = assemble(&deltas);
                let usage = word_usage(&request.prompt_text, &text);
                Ok(ProviderResponse {
                    text,
                    usage: Some(usage),
                    finish_reason: Some("stop".to_string()),
                })
            }
            MockOutcome::DeltasThenFail(_, message) | MockOutcome::Transient(message) => {
                Err(LlmError::TransientProvider(message))
            }
            MockOutcome::Rejected(message) => Err(LlmError::Validation(message)),
            MockOutcome::Delayed(..) => unreachable!("delays are resolved by next_outcome"),
        }
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<ProviderDelta>>> {
        let (deltas, trailing_error, report_usage) = match self.next_outcome(request).await? {
            MockOutcome::Text(text) => (split_words(&text), None, true),
            MockOutcome::TextWithoutUsage(text) => (split_words(&text), None, false),
            MockOutcome::Deltas(deltas) => (deltas, None, true),
            MockOutcome::DeltasThenFail(deltas, message) => (deltas, Some(message), true),
            MockOutcome::Transient(message) => return Err(LlmError::TransientProvider(message)),
            MockOutcome::Rejected(message) => return Err(LlmError::Validation(message)),
            MockOutcome::Delayed(..) => unreachable!("delays are resolved by next_outcome"),
        };

        let mut items: Vec<Result<ProviderDelta>> = deltas
            .iter()
            .map(|(index, text)| Ok(ProviderDelta::new(*index, text.clone())))
            .collect();

        match trailing_error {
            Some(message) => items.push(Err(LlmError::TransientProvider(message))),
            None if report_usage => {
                let next_index = deltas.iter().map(|(i, _)| i + 1).max().unwrap_or(0);
                let usage = word_usage(&request.prompt_text, &assemble(&deltas));
                items.push(Ok(ProviderDelta::new(next_index, "").with_usage(usage)));
            }
            None => {}
        }

        let delay = self.chunk_delay;
        let stream = futures::stream::iter(items).then(move |item| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            item
        });
        Ok(stream.boxed())
    }
}

/// Split text into indexed word-sized deltas, keeping whitespace.
fn split_words(text: &str) -> Vec<(u64, String)> {
    text.split_inclusive(' ')
        .enumerate()
        .map(|(i, piece)| (i as u64, piece.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::new("model-a", "Hello there")
    }

    #[tokio::test]
    async fn test_mock_provider_default_response() {
        let provider = MockProvider::new();
        let response = provider.complete(&request()).await.unwrap();
        assert_eq!(response.text, DEFAULT_MOCK_RESPONSE);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_custom_responses_in_order() {
        let provider = MockProvider::new();
        provider.add_response("first").await;
        provider.add_response_sync("second");

        assert_eq!(provider.complete(&request()).await.unwrap().text, "first");
        assert_eq!(provider.complete(&request()).await.unwrap().text, "second");
        assert!(provider.is_exhausted().await);
    }

    #[tokio::test]
    async fn test_without_default_response_fails_on_empty_queue() {
        let provider = MockProvider::with_name("configured").without_default_response();
        provider.add_response("scripted").await;

        assert_eq!(provider.complete(&request()).await.unwrap().text, "scripted");
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Configuration(ref m) if m.contains("configured")));
        assert!(provider.stream(&request()).await.is_err());
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    #[should_panic(expected = "outcome queue is busy")]
    async fn test_add_outcome_sync_panics_when_queue_locked() {
        let provider = MockProvider::new();
        let _held = provider.responses.lock().await;
        provider.add_response_sync("lost");
    }

    #[tokio::test]
    async fn test_word_count_usage() {
        let provider = MockProvider::new();
        provider.add_response("one two three").await;
        let response = provider.complete(&request()).await.unwrap();
        assert_eq!(response.usage, Some(TokenUsage::new(2, 3)));
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let provider = MockProvider::new();
        provider
            .add_outcome(MockOutcome::Transient("503".into()))
            .await;
        provider
            .add_outcome(MockOutcome::Rejected("bad".into()))
            .await;

        let err = provider.complete(&request()).await.unwrap_err();
        assert!(err.is_transient());
        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, LlmError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delayed_outcome() {
        let provider = MockProvider::new();
        provider
            .add_outcome(MockOutcome::delayed(
                Duration::from_millis(20),
                MockOutcome::Text("late".into()),
            ))
            .await;
        let started = std::time::Instant::now();
        let response = provider.complete(&request()).await.unwrap();
        assert_eq!(response.text, "late");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_stream_out_of_order_deltas() {
        let provider = MockProvider::new();
        provider
            .add_outcome(MockOutcome::Deltas(vec![
                (1, "b".into()),
                (0, "a".into()),
                (2, "c".into()),
            ]))
            .await;

        let deltas: Vec<ProviderDelta> = provider
            .stream(&request())
            .await
            .unwrap()
            .map(|d| d.unwrap())
            .collect()
            .await;

        let indices: Vec<u64> = deltas.iter().map(|d| d.index).collect();
        assert_eq!(indices, vec![1, 0, 2, 3]);
        assert!(deltas[3].usage.is_some());
    }

    #[tokio::test]
    async fn test_stream_text_split() {
        let provider = MockProvider::new();
        provider
            .add_outcome(MockOutcome::TextWithoutUsage("a b c".into()))
            .await;
        let deltas: Vec<Result<ProviderDelta>> =
            provider.stream(&request()).await.unwrap().collect().await;
        let text: String = deltas
            .into_iter()
            .map(|d| d.unwrap().text)
            .collect::<Vec<_>>()
            .concat();
        assert_eq!(text, "a b c");
    }

    #[tokio::test]
    async fn test_stream_then_fail() {
        let provider = MockProvider::new();
        provider
            .add_outcome(MockOutcome::DeltasThenFail(
                vec![(0, "partial".into())],
                "connection reset".into(),
            ))
            .await;
        let items: Vec<Result<ProviderDelta>> =
            provider.stream(&request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].as_ref().unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_credential_flag() {
        let provider = MockProvider::new().without_credential();
        assert!(!provider.has_credential());
        provider.set_credential(true);
        assert!(provider.has_credential());
        assert_eq!(provider.credential_env(), Some("MOCK_API_KEY"));
    }

    #[tokio::test]
    async fn test_last_request_recorded() {
        let provider = MockProvider::with_name("vendor-x");
        assert_eq!(provider.name(), "vendor-x");
        provider.complete(&request()).await.unwrap();
        assert_eq!(provider.last_request().await, Some(request()));
    }
}

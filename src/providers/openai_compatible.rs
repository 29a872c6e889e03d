//! OpenAI-compatible HTTP transport.
//!
//! Works with any API that follows the OpenAI chat completions format:
//! - OpenAI
//! - Mistral
//! - xAI
//! - Groq
//! - Local servers (LM Studio, vLLM, llama.cpp) with no key at all
//!
//! # Configuration Example
//!
//! ```toml
//! [[providers]]
//! name = "groq"
//! type = "openai_compatible"
//! api_key_env = "GROQ_API_KEY"
//! base_url = "https://api.groq.com/openai/v1"
//!
//! [providers.headers]
//! Accept-Language = "en-US,en"
//! ```
//!
//! The key is read from the environment once, at construction. A missing key
//! is not a construction error: [`LLMProvider::has_credential`] reports it and
//! the adapter fails the request with `MissingCredential` before any call.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LlmError, Result};
use crate::model_config::ProviderConfig;
use crate::traits::{GenerationRequest, LLMProvider, ProviderDelta, ProviderResponse, TokenUsage};

// ============================================================================
// Request/Response Types (OpenAI-compatible format)
// ============================================================================

/// Chat request body.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<MessageRequest<'a>>,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl<'a> ChatRequest<'a> {
    fn from_request(request: &'a GenerationRequest, streaming: bool) -> Self {
        Self {
            model: &request.model_id,
            messages: vec![MessageRequest {
                role: "user",
                content: &request.prompt_text,
            }],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            top_p: request.top_p,
            stop: (!request.stop_sequences.is_empty()).then_some(&request.stop_sequences[..]),
            stream: streaming.then_some(true),
            stream_options: streaming.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(usage: Usage) -> Self {
        TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

// ============================================================================
// Provider
// ============================================================================

/// Transport for one OpenAI-compatible vendor.
pub struct OpenAICompatibleProvider {
    /// HTTP client with pre-configured headers
    client: Client,
    /// Provider configuration from TOML
    config: ProviderConfig,
    /// API key resolved from the environment, if any
    api_key: Option<String>,
    /// Base URL for API calls
    base_url: String,
}

impl std::fmt::Debug for OpenAICompatibleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAICompatibleProvider")
            .field("name", &self.config.name)
            .field("base_url", &self.base_url)
            .field("has_credential", &self.api_key.is_some())
            .finish()
    }
}

impl OpenAICompatibleProvider {
    /// Create provider from TOML configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no base URL can be resolved or a
    /// configured header is invalid.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        let api_key = Self::resolve_api_key(&config);
        let base_url = Self::resolve_base_url(&config)?;
        let client = Self::build_client(&config)?;

        debug!(
            provider = %config.name,
            base_url = %base_url,
            has_credential = api_key.is_some(),
            "Created OpenAI-compatible provider"
        );

        Ok(Self {
            client,
            config,
            api_key,
            base_url,
        })
    }

    /// Resolve the API key from the configured environment variable.
    fn resolve_api_key(config: &ProviderConfig) -> Option<String> {
        let env_var = config.api_key_env.as_ref()?;
        match std::env::var(env_var) {
            Ok(key) if !key.trim().is_empty() => Some(key),
            _ => {
                warn!(
                    provider = %config.name,
                    env_var = %env_var,
                    "API key environment variable not set"
                );
                None
            }
        }
    }

    /// Resolve base URL from environment override or config.
    fn resolve_base_url(config: &ProviderConfig) -> Result<String> {
        if let Some(env_var) = &config.base_url_env {
            if let Ok(url) = std::env::var(env_var) {
                return Ok(url);
            }
        }

        config.base_url.clone().ok_or_else(|| {
            LlmError::Configuration(format!(
                "Provider '{}' requires 'base_url' or 'base_url_env' to be set",
                config.name
            ))
        })
    }

    /// Build HTTP client with custom headers.
    fn build_client(config: &ProviderConfig) -> Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        for (key, value) in &config.headers {
            let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
                LlmError::Configuration(format!("Invalid header name '{}': {}", key, e))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                LlmError::Configuration(format!("Invalid header value for '{}': {}", key, e))
            })?;
            headers.insert(header_name, header_value);
        }

        Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to build HTTP client: {}", e)))
    }

    /// Build the chat completions endpoint URL.
    fn chat_completions_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        format!("{}/chat/completions", base)
    }

    fn post(&self, body: &ChatRequest<'_>) -> reqwest::RequestBuilder {
        let builder = self.client.post(self.chat_completions_url());
        let builder = match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        };
        builder.json(body)
    }

    /// Turn an error body into a message, preferring the structured form.
    fn error_message(body: &str) -> String {
        match serde_json::from_str::<ErrorResponse>(body) {
            Ok(parsed) => parsed.error.message,
            Err(_) => body.chars().take(500).collect(),
        }
    }

    fn parse_response(body: &str) -> Result<ProviderResponse> {
        let parsed: ChatResponse = serde_json::from_str(body)?;
        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            LlmError::TransientProvider("response contained no choices".to_string())
        })?;
        Ok(ProviderResponse {
            text: choice.message.content.unwrap_or_default(),
            usage: parsed.usage.map(TokenUsage::from),
            finish_reason: choice.finish_reason,
        })
    }

    /// Parse one SSE data payload into optional text and usage.
    fn parse_stream_event(data: &str) -> Result<(Option<String>, Option<TokenUsage>)> {
        let chunk: ChatStreamChunk = serde_json::from_str(data)?;
        let text = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .filter(|c| !c.is_empty());
        Ok((text, chunk.usage.map(TokenUsage::from)))
    }
}

/// Stream state threaded through `unfold`.
struct SseState {
    source: reqwest_eventsource::EventSource,
    provider: String,
    timeout: Duration,
    next_index: u64,
    done: bool,
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn has_credential(&self) -> bool {
        // Providers without `api_key_env` (local servers) need no key.
        self.config.api_key_env.is_none() || self.api_key.is_some()
    }

    fn credential_env(&self) -> Option<&str> {
        self.config.api_key_env.as_deref()
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn complete(&self, request: &GenerationRequest) -> Result<ProviderResponse> {
        let body = ChatRequest::from_request(request, false);
        debug!(
            provider = %self.config.name,
            model = %request.model_id,
            prompt_len = request.prompt_text.len(),
            "Sending chat completion request"
        );

        let timeout = self.config.timeout();
        let response = self
            .post(&body)
            .send()
            .await
            .map_err(|e| LlmError::from_transport(e, timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::from_transport(e, timeout))?;

        if !status.is_success() {
            warn!(provider = %self.config.name, status = status.as_u16(), "Provider returned error");
            return Err(LlmError::from_status(
                &self.config.name,
                status.as_u16(),
                &Self::error_message(&text),
            ));
        }

        Self::parse_response(&text)
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<ProviderDelta>>> {
        use reqwest_eventsource::{Error as SseError, Event, EventSource};

        let body = ChatRequest::from_request(request, true);
        debug!(
            provider = %self.config.name,
            model = %request.model_id,
            prompt_len = request.prompt_text.len(),
            "Opening chat completion stream"
        );

        let source = EventSource::new(self.post(&body)).map_err(|e| {
            LlmError::Configuration(format!("Failed to create event source: {}", e))
        })?;

        let state = SseState {
            source,
            provider: self.config.name.clone(),
            timeout: self.config.timeout(),
            next_index: 0,
            done: false,
        };

        let stream = stream::unfold(state, |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                match st.source.next().await {
                    Some(Ok(Event::Open)) => continue,
                    Some(Ok(Event::Message(msg))) => {
                        if msg.data == "[DONE]" {
                            st.source.close();
                            return None;
                        }
                        match OpenAICompatibleProvider::parse_stream_event(&msg.data) {
                            Ok((None, None)) => continue,
                            Ok((text, usage)) => {
                                let mut delta =
                                    ProviderDelta::new(st.next_index, text.unwrap_or_default());
                                delta.usage = usage;
                                st.next_index += 1;
                                return Some((Ok(delta), st));
                            }
                            Err(e) => {
                                warn!(provider = %st.provider, error = %e, "Failed to parse stream chunk");
                                st.source.close();
                                st.done = true;
                                return Some((Err(e), st));
                            }
                        }
                    }
                    Some(Err(SseError::StreamEnded)) | None => return None,
                    Some(Err(SseError::InvalidStatusCode(status, response))) => {
                        st.source.close();
                        st.done = true;
                        let body = response.text().await.unwrap_or_default();
                        let err = LlmError::from_status(
                            &st.provider,
                            status.as_u16(),
                            &OpenAICompatibleProvider::error_message(&body),
                        );
                        return Some((Err(err), st));
                    }
                    Some(Err(SseError::Transport(e))) => {
                        st.source.close();
                        st.done = true;
                        let err = LlmError::from_transport(e, st.timeout);
                        return Some((Err(err), st));
                    }
                    Some(Err(e)) => {
                        st.source.close();
                        st.done = true;
                        return Some((
                            Err(LlmError::TransientProvider(format!("Stream error: {}", e))),
                            st,
                        ));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn create_test_config(env_var: &str) -> ProviderConfig {
        ProviderConfig::openai_compatible("test-provider", "https://api.example.com/v1", env_var)
    }

    #[test]
    #[serial]
    fn test_missing_key_is_not_construction_error() {
        std::env::remove_var("EQ_TEST_KEY_MISSING");
        let provider =
            OpenAICompatibleProvider::from_config(create_test_config("EQ_TEST_KEY_MISSING"))
                .unwrap();
        assert!(!provider.has_credential());
        assert_eq!(provider.credential_env(), Some("EQ_TEST_KEY_MISSING"));
    }

    #[test]
    #[serial]
    fn test_provider_creation_with_key() {
        std::env::set_var("EQ_TEST_KEY_PRESENT", "test-key-12345");
        let provider =
            OpenAICompatibleProvider::from_config(create_test_config("EQ_TEST_KEY_PRESENT"))
                .unwrap();
        assert_eq!(provider.name(), "test-provider");
        assert!(provider.has_credential());
        assert!(provider.supports_streaming());
        // Debug output never contains the key.
        assert!(!format!("{:?}", provider).contains("test-key-12345"));
        std::env::remove_var("EQ_TEST_KEY_PRESENT");
    }

    #[test]
    fn test_keyless_local_server() {
        let mut config = create_test_config("UNUSED");
        config.api_key_env = None;
        config.base_url = Some("http://localhost:1234/v1/".to_string());
        let provider = OpenAICompatibleProvider::from_config(config).unwrap();
        assert!(provider.has_credential());
        assert_eq!(
            provider.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    #[serial]
    fn test_base_url_env_override() {
        std::env::set_var("EQ_TEST_BASE_URL", "https://override.example.com/v1");
        let mut config = create_test_config("EQ_TEST_KEY_UNSET");
        config.base_url_env = Some("EQ_TEST_BASE_URL".to_string());

        let provider = OpenAICompatibleProvider::from_config(config).unwrap();
        assert_eq!(provider.base_url, "https://override.example.com/v1");
        std::env::remove_var("EQ_TEST_BASE_URL");
    }

    #[test]
    fn test_missing_base_url() {
        let mut config = create_test_config("X");
        config.base_url = None;
        let err = OpenAICompatibleProvider::from_config(config).unwrap_err();
        assert!(matches!(err, LlmError::Configuration(_)));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut config = create_test_config("X");
        config
            .headers
            .insert("bad header".to_string(), "v".to_string());
        assert!(OpenAICompatibleProvider::from_config(config).is_err());

        let mut config = create_test_config("X");
        config
            .headers
            .insert("X-Custom-Header".to_string(), "custom-value".to_string());
        assert!(OpenAICompatibleProvider::from_config(config).is_ok());
    }

    #[test]
    fn test_request_serialization() {
        let request = GenerationRequest::new("gpt-4o-mini", "Hello")
            .with_temperature(0.5)
            .with_max_output_tokens(50);
        let json = serde_json::to_value(ChatRequest::from_request(&request, false)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["messages"][0]["content"], "Hello");
        assert_eq!(json["max_tokens"], 50);
        assert!(json.get("stop").is_none());
        assert!(json.get("stream").is_none());

        let streaming = request.with_stop_sequences(["END"]);
        let json = serde_json::to_value(ChatRequest::from_request(&streaming, true)).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert_eq!(json["stop"][0], "END");
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Hi!"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}
        }"#;
        let response = OpenAICompatibleProvider::parse_response(body).unwrap();
        assert_eq!(response.text, "Hi!");
        assert_eq!(response.usage, Some(TokenUsage::new(5, 2)));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_response_without_usage_or_choices() {
        let body = r#"{"choices": [{"message": {"content": "x"}}]}"#;
        let response = OpenAICompatibleProvider::parse_response(body).unwrap();
        assert!(response.usage.is_none());

        let err = OpenAICompatibleProvider::parse_response(r#"{"choices": []}"#).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_parse_stream_event() {
        let (text, usage) = OpenAICompatibleProvider::parse_stream_event(
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
        )
        .unwrap();
        assert_eq!(text.as_deref(), Some("Hel"));
        assert!(usage.is_none());

        let (text, usage) = OpenAICompatibleProvider::parse_stream_event(
            r#"{"choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4}}"#,
        )
        .unwrap();
        assert!(text.is_none());
        assert_eq!(usage, Some(TokenUsage::new(3, 4)));

        let (text, _) = OpenAICompatibleProvider::parse_stream_event(
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}]}"#,
        )
        .unwrap();
        assert!(text.is_none());

        assert!(OpenAICompatibleProvider::parse_stream_event("not json").is_err());
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error": {"message": "Rate limit exceeded", "type": "rate_limit"}}"#;
        assert_eq!(
            OpenAICompatibleProvider::error_message(body),
            "Rate limit exceeded"
        );
        assert_eq!(OpenAICompatibleProvider::error_message("oops"), "oops");
    }
}

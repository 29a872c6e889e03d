//! Error taxonomy for the orchestration core.
//!
//! # Error Handling Philosophy
//!
//! Errors fall into two groups:
//! 1. **Pre-flight** errors are detected before any network call and are never
//!    retried (`UnknownModel`, `MissingCredential`, `Validation`, `Configuration`).
//! 2. **Transient** errors come from the provider transport and are retried by
//!    the [`ProviderAdapter`](crate::adapter::ProviderAdapter) with jittered
//!    exponential backoff (`TransientProvider`, `Timeout`).
//!
//! `Cancelled` is terminal and never retried.
//!
//! # Common Errors and Solutions
//!
//! | Error | Cause | Solution |
//! |-------|-------|----------|
//! | `UnknownModel` | Model id not in `models.toml` | Add a `[[models]]` entry |
//! | `MissingCredential` | API key env var unset | Export the variable named by `api_key_env` |
//! | `Validation` | Temperature/top_p out of range, empty prompt | Fix the request |
//! | `TransientProvider` | Network failure, HTTP 429/5xx | Retried automatically |
//! | `Timeout` | Attempt exceeded `timeout_seconds` | Raise the timeout or retry later |
//!
//! The orchestrator never lets an [`LlmError`] cross the library boundary:
//! it is converted into a cloneable [`GenerationError`] stored on the
//! [`GenerationResult`](crate::traits::GenerationResult).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, LlmError>;

// ============================================================================
// Error Kind
// ============================================================================

/// Coarse classification of a failure, stable across the library boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The requested model id is not registered.
    UnknownModel,
    /// The provider has no configured API key or token.
    MissingCredential,
    /// The request is malformed.
    Validation,
    /// The adapter or provider is misconfigured.
    Configuration,
    /// Network or server-side failure that may succeed on retry.
    TransientProvider,
    /// An attempt exceeded its time budget.
    Timeout,
    /// The caller cancelled the request.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::UnknownModel => "unknown_model",
            ErrorKind::MissingCredential => "missing_credential",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::TransientProvider => "transient_provider",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ============================================================================
// LLM Error Types
// ============================================================================

/// Errors that can occur while orchestrating a generation request.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Model id not present in the registry.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// Provider has no credential configured.
    #[error("Missing credential for provider '{provider}' (set {env_var})")]
    MissingCredential { provider: String, env_var: String },

    /// Invalid request parameters.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Adapter or provider configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Retryable provider failure (network, 429, 5xx).
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// An attempt exceeded its timeout.
    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },

    /// The request was cancelled by the caller.
    #[error("Request cancelled")]
    Cancelled,

    /// Capability not offered by this transport.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Malformed provider payload.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LlmError {
    /// Classify a transport failure. `timeout` is the client timeout that
    /// was in force, reported when the request timed out.
    pub fn from_transport(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            LlmError::Timeout { after: timeout }
        } else if err.is_connect() {
            LlmError::TransientProvider(format!("Connection failed: {}", err))
        } else if err.is_builder() {
            LlmError::Configuration(err.to_string())
        } else {
            LlmError::TransientProvider(err.to_string())
        }
    }

    /// Classify an HTTP error status returned by a provider.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let message = format!("{} returned HTTP {}: {}", provider, status, body);
        match status {
            408 | 425 | 429 | 500..=599 => LlmError::TransientProvider(message),
            401 | 403 => LlmError::Configuration(message),
            _ => LlmError::Validation(message),
        }
    }

    /// The stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownModel(_) => ErrorKind::UnknownModel,
            Self::MissingCredential { .. } => ErrorKind::MissingCredential,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Configuration(_) | Self::NotSupported(_) => ErrorKind::Configuration,
            Self::TransientProvider(_) | Self::Serialization(_) => ErrorKind::TransientProvider,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the adapter may retry after this error.
    ///
    /// # Example
    ///
    /// ```
    /// use edgequake_orchestrator::LlmError;
    ///
    /// assert!(LlmError::TransientProvider("502".to_string()).is_transient());
    /// assert!(!LlmError::Validation("bad".to_string()).is_transient());
    /// ```
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TransientProvider | ErrorKind::Timeout
        )
    }

    /// Get a user-friendly description of the error with suggested action.
    pub fn user_description(&self) -> String {
        match self {
            Self::UnknownModel(model) => {
                format!("Model '{}' is not configured. Check models.toml.", model)
            }
            Self::MissingCredential { provider, env_var } => format!(
                "No API key for provider '{}'. Set the {} environment variable.",
                provider, env_var
            ),
            Self::Validation(msg) => format!("Invalid request: {}.", msg),
            Self::Configuration(msg) => format!("Configuration error: {}.", msg),
            Self::TransientProvider(_) | Self::Serialization(_) => {
                "The AI provider is temporarily unavailable. Please try again.".to_string()
            }
            Self::Timeout { .. } => {
                "Request timed out. The provider may be overloaded.".to_string()
            }
            Self::Cancelled => "Request was cancelled.".to_string(),
            Self::NotSupported(feature) => {
                format!("Feature '{}' is not supported by this provider.", feature)
            }
        }
    }
}

// ============================================================================
// Generation Error (boundary form)
// ============================================================================

/// Error attached to a failed [`GenerationResult`](crate::traits::GenerationResult).
///
/// Unlike [`LlmError`] this is `Clone` and serializable so results can be cached,
/// logged and handed to UI code freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationError {
    /// Classification of the failure.
    pub kind: ErrorKind,
    /// Underlying error message.
    pub message: String,
}

impl GenerationError {
    /// Create a new boundary error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The error used for cancelled requests.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, LlmError::Cancelled.to_string())
    }
}

impl From<&LlmError> for GenerationError {
    fn from(err: &LlmError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<LlmError> for GenerationError {
    fn from(err: LlmError) -> Self {
        Self::from(&err)
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

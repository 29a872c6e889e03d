//! Model Configuration Module
//!
//! TOML-based configuration for providers and the static model table the
//! [`ModelRegistry`](crate::registry::ModelRegistry) is built from.
//!
//! # Configuration File Location
//!
//! The config file is loaded from (in order of priority):
//! 1. `EDGEQUAKE_MODELS_CONFIG` environment variable
//! 2. `./models.toml` (current working directory)
//! 3. `~/.edgequake/models.toml` (user config)
//! 4. Built-in default configuration
//!
//! # Example Configuration
//!
//! ```toml
//! [defaults]
//! selection_policy = "lowest_cost"
//! cache_ttl_seconds = 3600
//! cache_max_entries = 1000
//! max_concurrent_requests = 16
//!
//! [[providers]]
//! name = "openai"
//! type = "openai_compatible"
//! api_key_env = "OPENAI_API_KEY"
//! base_url = "https://api.openai.com/v1"
//! timeout_seconds = 60
//! max_retries = 3
//!
//! [[models]]
//! id = "gpt-4o-mini"
//! provider = "openai"
//! input_cost_per_1k = 0.00015
//! output_cost_per_1k = 0.0006
//! max_context_tokens = 128000
//! ```
//!
//! Credentials never appear in the file; only the *name* of the environment
//! variable holding them does.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::traits::TokenUsage;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during model configuration loading.
#[derive(Error, Debug)]
pub enum ModelConfigError {
    /// Failed to read configuration file.
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML configuration.
    #[error("Failed to parse TOML config: {0}")]
    ParseError(String),

    /// Invalid configuration (missing required fields, invalid values).
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Provider not found in configuration.
    #[error("Provider not found: {0}")]
    ProviderNotFound(String),
}

impl From<ModelConfigError> for crate::error::LlmError {
    fn from(e: ModelConfigError) -> Self {
        crate::error::LlmError::Configuration(e.to_string())
    }
}

// ============================================================================
// Model Descriptor
// ============================================================================

/// Static description of one logical model. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Logical model identifier used in requests.
    pub id: String,

    /// Provider serving this model.
    #[serde(rename = "provider")]
    pub provider_id: String,

    /// USD per 1000 prompt tokens.
    #[serde(rename = "input_cost_per_1k", default)]
    pub input_cost_per_k_tokens: f64,

    /// USD per 1000 completion tokens.
    #[serde(rename = "output_cost_per_1k", default)]
    pub output_cost_per_k_tokens: f64,

    /// Context window (prompt + completion).
    pub max_context_tokens: u64,
}

impl ModelDescriptor {
    /// Create a descriptor.
    pub fn new(
        id: impl Into<String>,
        provider_id: impl Into<String>,
        input_cost_per_k_tokens: f64,
        output_cost_per_k_tokens: f64,
        max_context_tokens: u64,
    ) -> Self {
        Self {
            id: id.into(),
            provider_id: provider_id.into(),
            input_cost_per_k_tokens,
            output_cost_per_k_tokens,
            max_context_tokens,
        }
    }

    /// Cost in USD for the given usage.
    pub fn estimate_cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / 1000.0) * self.input_cost_per_k_tokens
            + (usage.completion_tokens as f64 / 1000.0) * self.output_cost_per_k_tokens
    }

    /// Combined per-1k price, used for cost-based selection.
    pub fn unit_cost(&self) -> f64 {
        self.input_cost_per_k_tokens + self.output_cost_per_k_tokens
    }
}

// ============================================================================
// Provider Configuration
// ============================================================================

/// Transport implementation used for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Any API following the OpenAI chat completions format.
    #[default]
    OpenaiCompatible,
    /// Scripted test double.
    Mock,
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderType::OpenaiCompatible => write!(f, "openai_compatible"),
            ProviderType::Mock => write!(f, "mock"),
        }
    }
}

/// Configuration for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider identifier (e.g., "openai", "mistral").
    pub name: String,

    /// Transport type.
    #[serde(rename = "type", default)]
    pub provider_type: ProviderType,

    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Base URL for the provider API.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable overriding `base_url`.
    #[serde(default)]
    pub base_url_env: Option<String>,

    /// Per-attempt timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Total attempts for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Extra HTTP headers sent with every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

impl ProviderConfig {
    /// An OpenAI-compatible provider config with defaults.
    pub fn openai_compatible(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key_env: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            provider_type: ProviderType::OpenaiCompatible,
            api_key_env: Some(api_key_env.into()),
            base_url: Some(base_url.into()),
            base_url_env: None,
            timeout_seconds: default_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            headers: HashMap::new(),
        }
    }

    /// Per-attempt timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Backoff base delay.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

// ============================================================================
// Defaults
// ============================================================================

/// How the orchestrator picks a model for `model_id = "auto"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicyKind {
    /// Cheapest combined per-1k price.
    #[default]
    LowestCost,
    /// Largest context window.
    LargestContext,
}

/// Orchestrator-wide defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Policy for automatic model selection.
    #[serde(default)]
    pub selection_policy: SelectionPolicyKind,

    /// TTL for cached results.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Entry bound of the response cache.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Simultaneous in-flight provider calls.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

fn default_cache_ttl_seconds() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    1000
}

fn default_max_concurrent_requests() -> usize {
    16
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            selection_policy: SelectionPolicyKind::default(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            cache_max_entries: default_cache_max_entries(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure for models.toml.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelsConfig {
    /// Orchestrator defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Configured providers.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Static model table.
    #[serde(default)]
    pub models: Vec<ModelDescriptor>,
}

impl ModelsConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ModelConfigError> {
        if let Ok(path) = std::env::var("EDGEQUAKE_MODELS_CONFIG") {
            if Path::new(&path).exists() {
                return Self::from_file(&path);
            }
            tracing::warn!(path = %path, "EDGEQUAKE_MODELS_CONFIG points to a missing file");
        }

        let local_path = Path::new("models.toml");
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".edgequake").join("models.toml");
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        tracing::debug!("No models.toml found, using built-in defaults");
        Ok(Self::builtin_defaults())
    }

    /// Load and validate configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.as_ref().display(),
            providers = config.providers.len(),
            models = config.models.len(),
            "Loaded model configuration"
        );
        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ModelConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ModelConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ModelConfigError> {
        toml::to_string_pretty(self).map_err(|e| ModelConfigError::ParseError(e.to_string()))
    }

    /// Get a provider by name.
    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Check structural consistency.
    pub fn validate(&self) -> Result<(), ModelConfigError> {
        let mut provider_names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ModelConfigError::ValidationError(
                    "provider name must not be empty".to_string(),
                ));
            }
            if !provider_names.insert(provider.name.as_str()) {
                return Err(ModelConfigError::ValidationError(format!(
                    "duplicate provider '{}'",
                    provider.name
                )));
            }
            if provider.max_retries == 0 {
                return Err(ModelConfigError::ValidationError(format!(
                    "provider '{}': max_retries must be at least 1",
                    provider.name
                )));
            }
            if provider.provider_type == ProviderType::OpenaiCompatible
                && provider.base_url.is_none()
                && provider.base_url_env.is_none()
            {
                return Err(ModelConfigError::ValidationError(format!(
                    "provider '{}' requires 'base_url' or 'base_url_env'",
                    provider.name
                )));
            }
        }

        let mut model_ids = HashSet::new();
        for model in &self.models {
            if !model_ids.insert(model.id.as_str()) {
                return Err(ModelConfigError::ValidationError(format!(
                    "duplicate model '{}'",
                    model.id
                )));
            }
            if !provider_names.contains(model.provider_id.as_str()) {
                return Err(ModelConfigError::ProviderNotFound(format!(
                    "{} (referenced by model '{}')",
                    model.provider_id, model.id
                )));
            }
            if model.input_cost_per_k_tokens < 0.0 || model.output_cost_per_k_tokens < 0.0 {
                return Err(ModelConfigError::ValidationError(format!(
                    "model '{}' has a negative cost",
                    model.id
                )));
            }
            if model.max_context_tokens == 0 {
                return Err(ModelConfigError::ValidationError(format!(
                    "model '{}' has a zero context window",
                    model.id
                )));
            }
        }

        if self.defaults.cache_max_entries == 0 || self.defaults.max_concurrent_requests == 0 {
            return Err(ModelConfigError::ValidationError(
                "cache_max_entries and max_concurrent_requests must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Built-in configuration covering common OpenAI-compatible vendors.
    pub fn builtin_defaults() -> Self {
        Self {
            defaults: DefaultsConfig::default(),
            providers: vec![
                ProviderConfig::openai_compatible(
                    "openai",
                    "https://api.openai.com/v1",
                    "OPENAI_API_KEY",
                ),
                ProviderConfig::openai_compatible(
                    "mistral",
                    "https://api.mistral.ai/v1",
                    "MISTRAL_API_KEY",
                ),
                ProviderConfig::openai_compatible("xai", "https://api.x.ai/v1", "XAI_API_KEY"),
                ProviderConfig::openai_compatible(
                    "groq",
                    "https://api.groq.com/openai/v1",
                    "GROQ_API_KEY",
                ),
            ],
            models: vec![
                ModelDescriptor::new("gpt-4o", "openai", 0.0025, 0.01, 128_000),
                ModelDescriptor::new("gpt-4o-mini", "openai", 0.00015, 0.0006, 128_000),
                ModelDescriptor::new("mistral-large-latest", "mistral", 0.002, 0.006, 131_072),
                ModelDescriptor::new("mistral-small-latest", "mistral", 0.0002, 0.0006, 32_768),
                ModelDescriptor::new("grok-2", "xai", 0.002, 0.01, 131_072),
                ModelDescriptor::new(
                    "llama-3.3-70b-versatile",
                    "groq",
                    0.00059,
                    0.00079,
                    131_072,
                ),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[defaults]
selection_policy = "largest_context"
cache_ttl_seconds = 120

[[providers]]
name = "openai"
type = "openai_compatible"
api_key_env = "OPENAI_API_KEY"
base_url = "https://api.openai.com/v1"
max_retries = 5

[[providers]]
name = "mock"
type = "mock"

[[models]]
id = "model-a"
provider = "mock"
input_cost_per_1k = 0.5
output_cost_per_1k = 1.5
max_context_tokens = 4096

[[models]]
id = "gpt-4o-mini"
provider = "openai"
input_cost_per_1k = 0.00015
output_cost_per_1k = 0.0006
max_context_tokens = 128000
"#;

    #[test]
    fn test_parse_sample() {
        let config = ModelsConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(
            config.defaults.selection_policy,
            SelectionPolicyKind::LargestContext
        );
        assert_eq!(config.defaults.cache_ttl_seconds, 120);
        assert_eq!(config.defaults.cache_max_entries, 1000);
        assert_eq!(config.providers.len(), 2);

        let openai = config.get_provider("openai").unwrap();
        assert_eq!(openai.max_retries, 5);
        assert_eq!(openai.timeout_seconds, 60);
        assert_eq!(openai.retry_base_delay(), Duration::from_millis(500));

        let mock = config.get_provider("mock").unwrap();
        assert_eq!(mock.provider_type, ProviderType::Mock);

        assert_eq!(config.models[0].provider_id, "mock");
        assert_eq!(config.models[0].input_cost_per_k_tokens, 0.5);
    }

    #[test]
    fn test_estimate_cost() {
        let model = ModelDescriptor::new("m", "p", 0.5, 1.5, 4096);
        let cost = model.estimate_cost(&TokenUsage::new(2000, 1000));
        assert!((cost - 2.5).abs() < 1e-9);
        assert!((model.unit_cost() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_rejects_unknown_provider_reference() {
        let toml_str = r#"
[[models]]
id = "orphan"
provider = "nowhere"
max_context_tokens = 10
"#;
        let err = ModelsConfig::from_toml(toml_str).unwrap_err();
        assert!(matches!(err, ModelConfigError::ProviderNotFound(_)));
    }

    #[test]
    fn test_rejects_duplicate_models() {
        let toml_str = r#"
[[providers]]
name = "mock"
type = "mock"

[[models]]
id = "a"
provider = "mock"
max_context_tokens = 10

[[models]]
id = "a"
provider = "mock"
max_context_tokens = 10
"#;
        let err = ModelsConfig::from_toml(toml_str).unwrap_err();
        assert!(err.to_string().contains("duplicate model"));
    }

    #[test]
    fn test_rejects_missing_base_url() {
        let toml_str = r#"
[[providers]]
name = "vendor"
type = "openai_compatible"
"#;
        assert!(ModelsConfig::from_toml(toml_str).is_err());
    }

    #[test]
    fn test_rejects_negative_cost_and_zero_context() {
        let mut config = ModelsConfig::builtin_defaults();
        config.models[0].input_cost_per_k_tokens = -1.0;
        assert!(config.validate().is_err());

        let mut config = ModelsConfig::builtin_defaults();
        config.models[0].max_context_tokens = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_error() {
        let err = ModelsConfig::from_toml("this is = = not toml").unwrap_err();
        assert!(matches!(err, ModelConfigError::ParseError(_)));
    }

    #[test]
    fn test_builtin_defaults_valid() {
        let config = ModelsConfig::builtin_defaults();
        assert!(config.validate().is_ok());
        assert!(config.get_provider("openai").is_some());
        assert!(config.models.iter().any(|m| m.id == "gpt-4o-mini"));
    }

    #[test]
    fn test_toml_roundtrip_keeps_keys() {
        let config = ModelsConfig::from_toml(SAMPLE).unwrap();
        let out = config.to_toml().unwrap();
        assert!(out.contains("input_cost_per_1k"));
        assert!(out.contains("provider = \"mock\""));
        let reparsed = ModelsConfig::from_toml(&out).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!(
            "edgequake-models-{}.toml",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ModelsConfig::from_file(&path).unwrap();
        assert_eq!(config.models.len(), 2);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(
            ModelsConfig::from_file(&path),
            Err(ModelConfigError::IoError(_))
        ));
    }
}

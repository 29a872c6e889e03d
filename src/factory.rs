//! Provider factory: configuration in, adapters out.
//!
//! # Configuration Sources
//!
//! [`ProviderFactory::load`] resolves `models.toml` in this order:
//!
//! 1. `EDGEQUAKE_MODELS_CONFIG` environment variable
//! 2. `./models.toml`
//! 3. `~/.edgequake/models.toml`
//! 4. Built-in defaults (OpenAI, Mistral, xAI, Groq)
//!
//! Each `[[providers]]` entry becomes one transport wrapped in a
//! [`ProviderAdapter`] carrying that provider's retry/timeout settings:
//!
//! | `type`              | Transport                    |
//! |---------------------|------------------------------|
//! | `openai_compatible` | [`OpenAICompatibleProvider`] |
//! | `mock`              | [`MockProvider`] (tests only)|
//!
//! A configured `mock` provider has an empty queue and no default answer:
//! every request routed to it fails with a `Configuration` error. It exists
//! so test suites can exercise configuration loading end to end.
//!
//! A provider whose API key variable is unset is still registered; requests
//! routed to it fail with `MissingCredential` at pre-flight.
//!
//! # Example
//!
//! ```rust,ignore
//! use edgequake_orchestrator::ProviderFactory;
//!
//! let (config, providers) = ProviderFactory::load()?;
//! println!("providers: {:?}", providers.list());
//! ```

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterConfig, ProviderAdapter};
use crate::error::Result;
use crate::model_config::{ModelsConfig, ProviderConfig, ProviderType};
use crate::providers::{MockProvider, OpenAICompatibleProvider};
use crate::registry::ProviderRegistry;
use crate::traits::LLMProvider;

/// Builds transports and adapters from configuration.
pub struct ProviderFactory;

impl ProviderFactory {
    /// Load configuration and build every declared provider.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the config file is unreadable or
    /// invalid, or if a provider cannot be constructed.
    pub fn load() -> Result<(ModelsConfig, ProviderRegistry)> {
        let config = ModelsConfig::load()?;
        let registry = Self::from_config(&config)?;
        Ok((config, registry))
    }

    /// Build a [`ProviderRegistry`] holding one adapter per declared provider.
    pub fn from_config(config: &ModelsConfig) -> Result<ProviderRegistry> {
        let mut registry = ProviderRegistry::new();
        for provider in &config.providers {
            registry.register(Self::create_adapter(provider)?);
        }
        info!(
            providers = registry.len(),
            models = config.models.len(),
            "Provider registry initialised"
        );
        Ok(registry)
    }

    /// Create the transport for one provider section.
    pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn LLMProvider>> {
        debug!(
            provider = %config.name,
            provider_type = %config.provider_type,
            "Creating provider"
        );
        match config.provider_type {
            ProviderType::OpenaiCompatible => Ok(Arc::new(
                OpenAICompatibleProvider::from_config(config.clone())?,
            )),
            ProviderType::Mock => {
                warn!(
                    provider = %config.name,
                    "Mock provider declared in configuration; it serves scripted outcomes only"
                );
                Ok(Arc::new(
                    MockProvider::with_name(&config.name).without_default_response(),
                ))
            }
        }
    }

    /// Create the transport and wrap it in an adapter.
    pub fn create_adapter(config: &ProviderConfig) -> Result<ProviderAdapter> {
        let provider = Self::create_provider(config)?;
        Ok(ProviderAdapter::new(
            provider,
            AdapterConfig::from_provider_config(config),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;

    const MOCK_CONFIG: &str = r#"
[[providers]]
name = "local"
type = "mock"
max_retries = 5

[[providers]]
name = "remote"
type = "openai_compatible"
base_url = "https://api.example.com/v1"
api_key_env = "EQ_FACTORY_TEST_KEY"

[[models]]
id = "model-a"
provider = "local"
input_cost_per_1k = 0.5
output_cost_per_1k = 1.0
max_context_tokens = 4096
"#;

    #[test]
    #[serial]
    fn test_from_config_registers_every_provider() {
        std::env::remove_var("EQ_FACTORY_TEST_KEY");
        let config = ModelsConfig::from_toml(MOCK_CONFIG).unwrap();
        let registry = ProviderFactory::from_config(&config).unwrap();

        assert_eq!(registry.list(), vec!["local", "remote"]);
        let local = registry.get("local").unwrap();
        assert_eq!(local.config().retry.max_retries, 5);
        assert!(local.provider().has_credential());
        assert!(!registry.get("remote").unwrap().provider().has_credential());
    }

    #[test]
    fn test_mock_provider_takes_configured_name() {
        let mut config = ProviderConfig::openai_compatible("ignored", "http://x", "K");
        config.name = "scripted".into();
        config.provider_type = ProviderType::Mock;
        let adapter = ProviderFactory::create_adapter(&config).unwrap();
        assert_eq!(adapter.provider_id(), "scripted");
    }

    #[test]
    #[serial]
    fn test_builtin_defaults_build() {
        let config = ModelsConfig::builtin_defaults();
        let registry = ProviderFactory::from_config(&config).unwrap();
        assert_eq!(registry.len(), config.providers.len());
        assert!(registry.has("openai"));
    }

    #[tokio::test]
    async fn test_configured_mock_does_not_fabricate_answers() {
        let mut config = ProviderConfig::openai_compatible("ignored", "http://x", "K");
        config.name = "local".into();
        config.provider_type = ProviderType::Mock;
        let provider = ProviderFactory::create_provider(&config).unwrap();

        let request = crate::traits::GenerationRequest::new("m", "Hello");
        let err = provider.complete(&request).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_invalid_header_is_configuration_error() {
        let mut config = ProviderConfig::openai_compatible("p", "http://x", "K");
        config
            .headers
            .insert("bad header".into(), "value".into());
        let err = ProviderFactory::create_provider(&config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}

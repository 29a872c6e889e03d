//! Model and provider registries.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ModelRegistry (read-only)                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  gpt-4o               → openai   $0.0025/$0.0100   128k     │
//! │  gpt-4o-mini          → openai   $0.00015/$0.0006  128k     │
//! │  mistral-small-latest → mistral  $0.0002/$0.0006   32k      │
//! │  ...                                                        │
//! └─────────────────────────────┬───────────────────────────────┘
//!                               │ provider_id
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              ProviderRegistry                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─ openai:  Arc<ProviderAdapter>                           │
//! │  ├─ mistral: Arc<ProviderAdapter>                           │
//! │  └─ mock:    Arc<ProviderAdapter>                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The model registry is built once from configuration and never mutated, so
//! concurrent readers need no locking. Declaration order is preserved for
//! listing and for tie-breaks during automatic selection.
//!
//! # Example
//!
//! ```ignore
//! use edgequake_orchestrator::{ModelRegistry, ModelsConfig};
//!
//! let registry = ModelRegistry::from_config(&ModelsConfig::builtin_defaults())?;
//! let model = registry.resolve("gpt-4o-mini")?;
//! assert_eq!(model.provider_id, "openai");
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::adapter::ProviderAdapter;
use crate::error::{LlmError, Result};
use crate::model_config::{ModelDescriptor, ModelsConfig};

// ============================================================================
// Model registry
// ============================================================================

/// Immutable lookup table of model descriptors.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
    index: HashMap<String, usize>,
}

impl ModelRegistry {
    /// Build from descriptors.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Configuration`] if an id appears twice.
    pub fn from_descriptors(models: Vec<ModelDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(models.len());
        for (position, model) in models.iter().enumerate() {
            if index.insert(model.id.clone(), position).is_some() {
                return Err(LlmError::Configuration(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
        }
        Ok(Self { models, index })
    }

    /// Build from a loaded configuration.
    pub fn from_config(config: &ModelsConfig) -> Result<Self> {
        Self::from_descriptors(config.models.clone())
    }

    /// Look up a model by id.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::UnknownModel`] when the id is not registered.
    pub fn resolve(&self, model_id: &str) -> Result<&ModelDescriptor> {
        self.get(model_id)
            .ok_or_else(|| LlmError::UnknownModel(model_id.to_string()))
    }

    /// Like [`ModelRegistry::resolve`], returning `None` instead of an error.
    pub fn get(&self, model_id: &str) -> Option<&ModelDescriptor> {
        self.index.get(model_id).map(|&i| &self.models[i])
    }

    /// Whether a model id is registered.
    pub fn contains(&self, model_id: &str) -> bool {
        self.index.contains_key(model_id)
    }

    /// All models served by one provider, in declaration order.
    pub fn list_by_provider(&self, provider_id: &str) -> Vec<&ModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.provider_id == provider_id)
            .collect()
    }

    /// All models in declaration order.
    pub fn all(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Registered model ids in declaration order.
    pub fn ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id.as_str()).collect()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the registry has no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

// ============================================================================
// Provider registry
// ============================================================================

/// Adapters keyed by provider id.
#[derive(Debug, Default, Clone)]
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<ProviderAdapter>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under its provider's own id.
    ///
    /// Replaces any adapter already registered under that id.
    pub fn register(&mut self, adapter: ProviderAdapter) {
        let id = adapter.provider_id().to_string();
        self.adapters.insert(id, Arc::new(adapter));
    }

    /// Register an adapter under an explicit id.
    pub fn register_as(&mut self, provider_id: impl Into<String>, adapter: Arc<ProviderAdapter>) {
        self.adapters.insert(provider_id.into(), adapter);
    }

    /// Get an adapter by provider id.
    pub fn get(&self, provider_id: &str) -> Option<Arc<ProviderAdapter>> {
        self.adapters.get(provider_id).cloned()
    }

    /// Whether an adapter exists for this provider.
    pub fn has(&self, provider_id: &str) -> bool {
        self.adapters.contains_key(provider_id)
    }

    /// Registered provider ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.adapters.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove an adapter.
    pub fn remove(&mut self, provider_id: &str) -> Option<Arc<ProviderAdapter>> {
        self.adapters.remove(provider_id)
    }

    /// Number of registered adapters.
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapters are registered.
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Remove every adapter.
    pub fn clear(&mut self) {
        self.adapters.clear();
    }
}

use thiserror::Error;

use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model '{name}' can not be used for {capability}")]
    Unsupported { name: String, capability: String },
    #[error("no known model supports {capability}")]
    NoneAvailable { capability: String },
}

/// Outcome of resolving a requested model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelChoice {
    Listed(ModelSpec),
    /// Not in the registry. Passed through so newer models keep working.
    Unlisted(String),
    Default { model: ModelSpec, reason: String },
}

impl ModelChoice {
    pub fn name(&self) -> &str {
        match self {
            Self::Listed(model) | Self::Default { model, .. } => &model.name,
            Self::Unlisted(name) => name,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: ModelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
    ) -> Result<ModelChoice, ModelError> {
        let requested = requested.map(str::trim).filter(|value| !value.is_empty());
        let Some(name) = requested else {
            let model = self
                .registry
                .default_for(capability)
                .cloned()
                .ok_or_else(|| ModelError::NoneAvailable {
                    capability: capability.to_string(),
                })?;
            return Ok(ModelChoice::Default {
                model,
                reason: "No model specified; using default.".to_string(),
            });
        };
        match self.registry.get(name) {
            Some(model) if model.supports(capability) => Ok(ModelChoice::Listed(model.clone())),
            Some(_) => Err(ModelError::Unsupported {
                name: name.to_string(),
                capability: capability.to_string(),
            }),
            None => Ok(ModelChoice::Unlisted(name.to_string())),
        }
    }
}

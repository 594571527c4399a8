use indexmap::IndexMap;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

/// Capability every model used for describing images must carry.
pub const VISION: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn new(name: &str, capabilities: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|item| (*item).to_string()).collect(),
        }
    }

    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Generation models in listing order. The first model carrying a
/// capability is the default for it.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::with_models([
            ModelSpec::new(DEFAULT_MODEL, &["text", VISION]),
            ModelSpec::new("gemini-1.5-pro", &["text", VISION]),
            ModelSpec::new("gemini-2.0-flash", &["text", VISION]),
            ModelSpec::new("gemini-2.5-flash", &["text", VISION]),
            ModelSpec::new("gemini-2.5-pro", &["text", VISION]),
        ])
    }
}

impl ModelRegistry {
    pub fn with_models(models: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|model| (model.name.clone(), model))
                .collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn default_for(&self, capability: &str) -> Option<&ModelSpec> {
        self.models.values().find(|model| model.supports(capability))
    }
}

use indexmap::IndexMap;

/// Model used for prompt analysis when nothing else is requested.
pub const DEFAULT_ANALYSIS_MODEL: &str = "gemini-2.5-flash-image";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub context_window: Option<u64>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

/// Ordered catalogue; the first model with a capability is its default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name.trim())?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, capabilities: &[&str], context_window: Option<u64>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: "gemini".to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                context_window,
            },
        );
    };

    insert(DEFAULT_ANALYSIS_MODEL, &["text", "vision", "image"], Some(32768));
    insert("gemini-2.5-flash", &["text", "vision"], Some(1_048_576));
    insert("gemini-2.5-pro", &["text", "vision"], Some(1_048_576));
    insert("gemini-2.0-flash", &["text", "vision"], Some(1_048_576));
    insert("gemini-3-pro-preview", &["text", "vision"], Some(128_000));
    insert("imagen-4", &["image"], None);

    map
}

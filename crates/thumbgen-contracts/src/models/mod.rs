mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_ANALYSIS_MODEL};
pub use selectors::{ModelSelection, ModelSelector};

//! Mapping from Ollama-style model tags to names the upstream accepts.

use crate::config::UpstreamConfig;

/// Strip the tag/variant suffix: everything from the first `:` onward.
///
/// `"glm-4.6:latest"` becomes `"glm-4.6"`; names without `:` are unchanged.
pub fn normalize_model_name(model: &str) -> &str {
    match model.find(':') {
        Some(pos) => &model[..pos],
        None => model,
    }
}

#[derive(Debug, Clone)]
pub struct ModelMapper {
    family_prefix: String,
    default_model: String,
}

impl ModelMapper {
    pub fn new(family_prefix: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            family_prefix: family_prefix.into(),
            default_model: default_model.into(),
        }
    }

    pub fn from_config(upstream: &UpstreamConfig) -> Self {
        Self::new(
            upstream.effective_model_prefix(),
            upstream.effective_default_model(),
        )
    }

    /// Pick the upstream model for a client-requested name. Names inside the
    /// upstream family pass through normalized; anything else gets the default.
    /// An empty prefix admits every name.
    pub fn resolve_target(&self, requested: &str) -> String {
        let normalized = normalize_model_name(requested);
        if normalized.starts_with(&self.family_prefix) {
            normalized.to_string()
        } else {
            self.default_model.clone()
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }
}

//! Built-in upstream presets for OpenAI-compatible chat backends.
//!
//! Each preset defines the base URL, the environment variable holding the API
//! key, and the model family the gateway routes to. Users specify a provider
//! name in their config and the preset fills in the details.

#[derive(Debug, Clone)]
pub struct ProviderPreset {
    pub name: &'static str,
    pub base_url: &'static str,
    pub default_api_key_env: &'static str,
    /// Model names starting with this prefix are forwarded as-is.
    pub model_prefix: &'static str,
    /// Substituted for any requested model outside the family.
    pub default_model: &'static str,
}

const PRESETS: &[ProviderPreset] = &[
    ProviderPreset {
        name: "zhipu",
        base_url: "https://open.bigmodel.cn/api/paas/v4",
        default_api_key_env: "ZHIPU_API_KEY",
        model_prefix: "glm",
        default_model: "glm-4.6",
    },
    ProviderPreset {
        name: "zai",
        base_url: "https://api.z.ai/api/paas/v4",
        default_api_key_env: "ZAI_API_KEY",
        model_prefix: "glm",
        default_model: "glm-4.6",
    },
    ProviderPreset {
        name: "openai",
        base_url: "https://api.openai.com/v1",
        default_api_key_env: "OPENAI_API_KEY",
        model_prefix: "gpt",
        default_model: "gpt-4o",
    },
    ProviderPreset {
        name: "deepseek",
        base_url: "https://api.deepseek.com/v1",
        default_api_key_env: "DEEPSEEK_API_KEY",
        model_prefix: "deepseek",
        default_model: "deepseek-chat",
    },
    ProviderPreset {
        name: "openrouter",
        base_url: "https://openrouter.ai/api/v1",
        default_api_key_env: "OPENROUTER_API_KEY",
        model_prefix: "z-ai/glm",
        default_model: "z-ai/glm-4.6",
    },
];

impl ProviderPreset {
    #[must_use]
    pub fn from_name(name: &str) -> Option<&'static ProviderPreset> {
        PRESETS.iter().find(|p| p.name == name.to_lowercase())
    }

    #[must_use]
    pub fn all() -> &'static [ProviderPreset] {
        PRESETS
    }
}

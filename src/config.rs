use crate::error::{GatewayError, Result};
use crate::providers::ProviderPreset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest request body accepted on any route, proxy fallback included.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Model names advertised on `/api/tags`.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default)]
    pub recording: RecordingConfig,
    #[serde(default)]
    pub proxy: ProxyModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Inline secret; takes precedence over `api_key_env`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_recording_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_preview_bytes")]
    pub preview_bytes: usize,
    #[serde(default = "default_true")]
    pub capture_request_body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyModeConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_proxy_target")]
    pub target: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    11434
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_provider() -> String {
    "zhipu".to_string()
}

fn default_models() -> Vec<String> {
    vec!["glm-4.6:latest".to_string()]
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_recording_dir() -> PathBuf {
    PathBuf::from("exchange-logs")
}

fn default_preview_bytes() -> usize {
    16 * 1024
}

fn default_true() -> bool {
    true
}

fn default_proxy_target() -> String {
    "http://127.0.0.1:8080".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            upstream: UpstreamConfig::default(),
            models: default_models(),
            recording: RecordingConfig::default(),
            proxy: ProxyModeConfig::default(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: None,
            api_key_env: None,
            api_key: None,
            model_prefix: None,
            default_model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_recording_dir(),
            preview_bytes: default_preview_bytes(),
            capture_request_body: true,
        }
    }
}

impl Default for ProxyModeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target: default_proxy_target(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Search standard locations for a config file, falling back to defaults.
    /// Priority: CLI arg > CWD > XDG config > home dir
    pub fn find_and_load(explicit_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit_path {
            return Self::load(path);
        }

        for candidate in &config_search_paths() {
            if candidate.exists() {
                tracing::info!(path = %candidate.display(), "Loading config");
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl UpstreamConfig {
    fn preset(&self) -> Option<&'static ProviderPreset> {
        ProviderPreset::from_name(&self.provider)
    }

    /// Resolve the effective base URL (config override or provider preset default)
    pub fn effective_base_url(&self) -> Result<String> {
        if let Some(ref url) = self.base_url {
            return Ok(url.clone());
        }

        let preset = self.preset().ok_or_else(|| {
            GatewayError::config(format!(
                "Unknown provider '{}' and no base_url configured. Known providers: {}",
                self.provider,
                ProviderPreset::all()
                    .iter()
                    .map(|p| p.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        Ok(preset.base_url.to_string())
    }

    pub fn chat_completions_url(&self) -> Result<String> {
        Ok(format!(
            "{}/chat/completions",
            self.effective_base_url()?.trim_end_matches('/')
        ))
    }

    pub fn effective_api_key_env(&self) -> String {
        self.api_key_env
            .clone()
            .or_else(|| self.preset().map(|p| p.default_api_key_env.to_string()))
            .unwrap_or_else(|| "API_KEY".to_string())
    }

    pub fn effective_model_prefix(&self) -> String {
        self.model_prefix
            .clone()
            .or_else(|| self.preset().map(|p| p.model_prefix.to_string()))
            .unwrap_or_default()
    }

    pub fn effective_default_model(&self) -> String {
        self.default_model
            .clone()
            .or_else(|| self.preset().map(|p| p.default_model.to_string()))
            .unwrap_or_else(|| "glm-4.6".to_string())
    }

    /// Resolve the API key: inline value first, then the configured environment variable.
    pub fn resolve_api_key(&self) -> Result<String> {
        if let Some(ref key) = self.api_key {
            return Ok(key.clone());
        }

        let var = self.effective_api_key_env();
        std::env::var(&var).map_err(|_| {
            GatewayError::config(format!(
                "Environment variable '{}' not set. Set it with your provider API key.",
                var
            ))
        })
    }
}

pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("ollama-bridge.toml"));

    if cfg!(target_os = "macos") {
        if let Some(home) = home_dir() {
            paths.push(
                home.join("Library")
                    .join("Application Support")
                    .join("ollama-bridge")
                    .join("config.toml"),
            );
        }
    } else {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            paths.push(PathBuf::from(xdg).join("ollama-bridge").join("config.toml"));
        }
        if let Some(home) = home_dir() {
            paths.push(home.join(".config").join("ollama-bridge").join("config.toml"));
        }
    }

    if let Some(home) = home_dir() {
        paths.push(home.join(".ollama-bridge.toml"));
    }

    paths
}

fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
port = 5000
max_body_bytes = 1048576
models = ["glm-4.6:latest", "glm-4.5-air:latest"]

[upstream]
provider = "zai"
api_key_env = "MY_ZAI_KEY"

[recording]
enabled = true
dir = "/tmp/exchanges"
"#
        )
        .unwrap();

        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.max_body_bytes, 1024 * 1024);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.models.len(), 2);
        assert_eq!(config.upstream.effective_api_key_env(), "MY_ZAI_KEY");
        assert!(config.recording.enabled);
        assert_eq!(config.recording.dir, PathBuf::from("/tmp/exchanges"));
        assert_eq!(config.recording.preview_bytes, 16 * 1024);
        assert!(!config.proxy.enabled);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let config = GatewayConfig::load(f.path()).unwrap();
        assert_eq!(config.port, 11434);
        assert_eq!(config.max_body_bytes, 32 * 1024 * 1024);
        assert_eq!(config.upstream.provider, "zhipu");
        assert_eq!(config.upstream.effective_model_prefix(), "glm");
        assert_eq!(config.upstream.effective_default_model(), "glm-4.6");
    }

    #[test]
    fn test_effective_base_url_from_preset() {
        let upstream = UpstreamConfig {
            provider: "zai".to_string(),
            ..UpstreamConfig::default()
        };

        assert_eq!(
            upstream.chat_completions_url().unwrap(),
            "https://api.z.ai/api/paas/v4/chat/completions"
        );
    }

    #[test]
    fn test_effective_base_url_override() {
        let upstream = UpstreamConfig {
            provider: "custom".to_string(),
            base_url: Some("https://my-server.com/v1/".to_string()),
            ..UpstreamConfig::default()
        };

        assert_eq!(
            upstream.chat_completions_url().unwrap(),
            "https://my-server.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_unknown_provider_without_base_url() {
        let upstream = UpstreamConfig {
            provider: "nowhere".to_string(),
            ..UpstreamConfig::default()
        };

        assert!(matches!(
            upstream.effective_base_url(),
            Err(GatewayError::Config { .. })
        ));
    }

    #[test]
    fn test_inline_api_key_wins() {
        let upstream = UpstreamConfig {
            api_key: Some("inline-secret".to_string()),
            api_key_env: Some("OLLAMA_BRIDGE_TEST_NEVER_SET".to_string()),
            ..UpstreamConfig::default()
        };

        assert_eq!(upstream.resolve_api_key().unwrap(), "inline-secret");
    }

    #[test]
    fn test_missing_api_key_is_config_error() {
        let upstream = UpstreamConfig {
            api_key_env: Some("OLLAMA_BRIDGE_TEST_NEVER_SET".to_string()),
            ..UpstreamConfig::default()
        };

        assert!(matches!(
            upstream.resolve_api_key(),
            Err(GatewayError::Config { .. })
        ));
    }
}

use crate::pipeline::retry::ErrorClass;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub collaborators: CollaboratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    #[serde(rename = "ollama")]
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint.
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    /// Prefix used in model ids, e.g. `anthropic` in `anthropic/claude-x`.
    pub id: String,
    pub kind: ProviderKind,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key. Used when `api_key` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_ref().filter(|k| !k.trim().is_empty()) {
            return Some(key.clone());
        }
        let var = self.api_key_env.as_deref()?;
        std::env::var(var).ok().filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Capacity of the per-request event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_buffer: default_event_buffer(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_event_buffer() -> usize {
    64
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before retry n is `n * backoff_step_ms`.
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_brace_tolerance")]
    pub brace_tolerance: usize,
    #[serde(default = "default_short_file_chars")]
    pub short_file_chars: usize,
    /// Pre-provisioned packages never reported for installation.
    #[serde(default = "default_builtin_packages")]
    pub builtin_packages: Vec<String>,
    #[serde(default = "default_true")]
    pub recovery_enabled: bool,
    #[serde(default)]
    pub fallbacks: Vec<FallbackRule>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            max_retries: default_max_retries(),
            backoff_step_ms: default_backoff_step_ms(),
            temperature: None,
            max_tokens: None,
            brace_tolerance: default_brace_tolerance(),
            short_file_chars: default_short_file_chars(),
            builtin_packages: default_builtin_packages(),
            recovery_enabled: true,
            fallbacks: Vec::new(),
        }
    }
}

fn default_model() -> String {
    "ollama/qwen3-coder".to_string()
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_step_ms() -> u64 {
    2000
}

fn default_brace_tolerance() -> usize {
    3
}

fn default_short_file_chars() -> usize {
    20
}

fn default_builtin_packages() -> Vec<String> {
    vec!["react".to_string(), "react-dom".to_string()]
}

fn default_true() -> bool {
    true
}

/// Swap to `model` on the last allowed attempt when `provider` failed with
/// `error_class`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FallbackRule {
    pub provider: String,
    #[serde(default = "default_fallback_class")]
    pub error_class: ErrorClass,
    pub model: String,
}

fn default_fallback_class() -> ErrorClass {
    ErrorClass::Transient
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CollaboratorConfig {
    #[serde(default)]
    pub sandbox_url: Option<String>,
    #[serde(default)]
    pub intent_url: Option<String>,
    #[serde(default = "default_collaborator_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollaboratorConfig {
    fn default() -> Self {
        Self {
            sandbox_url: None,
            intent_url: None,
            timeout_secs: default_collaborator_timeout(),
        }
    }
}

fn default_collaborator_timeout() -> u64 {
    30
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub directory: Option<String>,
    pub retention_days: Option<u64>,
}

fn default_providers() -> Vec<ProviderConfig> {
    vec![ProviderConfig {
        id: "ollama".to_string(),
        kind: ProviderKind::Ollama,
        url: "http://127.0.0.1:11434".to_string(),
        api_key: None,
        api_key_env: None,
    }]
}

impl Config {
    pub fn load_with_path() -> Result<(Self, Option<PathBuf>)> {
        let mut candidates = Vec::new();

        if let Ok(explicit) = std::env::var("CODESTREAM_CONFIG") {
            candidates.push(PathBuf::from(explicit));
        }

        candidates.push(PathBuf::from("codestream.toml"));

        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("codestream").join("codestream.toml"));
        }

        candidates.push(crate::paths::config_dir().join("codestream.toml"));

        for path in candidates {
            if path.exists() {
                let config = Self::load_from(&path)?;
                return Ok((config, Some(path)));
            }
        }

        Ok((Config::default(), None))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Config at {:?} is invalid: {}", path, e))?;
        Ok(config)
    }

    /// Provider used for model ids without a prefix.
    pub fn default_provider(&self) -> &str {
        match self.generation.default_model.split_once('/') {
            Some((provider, _)) if !provider.is_empty() => provider,
            _ => self
                .providers
                .first()
                .map(|p| p.id.as_str())
                .unwrap_or("ollama"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.providers.is_empty() {
            anyhow::bail!("At least one provider must be configured");
        }
        let mut seen_ids = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                anyhow::bail!("Provider ID cannot be empty");
            }
            if provider.id.contains('/') {
                anyhow::bail!("Provider ID '{}' must not contain '/'", provider.id);
            }
            if !seen_ids.insert(&provider.id) {
                anyhow::bail!("Duplicate provider ID: {}", provider.id);
            }
            let parsed = url::Url::parse(provider.url.trim()).map_err(|e| {
                anyhow::anyhow!("Provider '{}' has an invalid URL '{}': {}", provider.id, provider.url, e)
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!(
                    "Provider '{}' URL must start with http:// or https://, got: {}",
                    provider.id,
                    provider.url
                );
            }
        }

        let default_provider = self.default_provider();
        if !seen_ids.iter().any(|id| id.as_str() == default_provider) {
            anyhow::bail!(
                "Default model '{}' refers to unknown provider '{}'",
                self.generation.default_model,
                default_provider
            );
        }
        for rule in &self.generation.fallbacks {
            let Some((provider, _)) = rule.model.split_once('/') else {
                anyhow::bail!("Fallback model '{}' must be provider-prefixed", rule.model);
            };
            if !seen_ids.iter().any(|id| id.as_str() == provider) {
                anyhow::bail!("Fallback model '{}' refers to unknown provider '{}'", rule.model, provider);
            }
        }

        if self.generation.max_retries > 10 {
            anyhow::bail!("generation.max_retries must not exceed 10");
        }
        if self.generation.short_file_chars == 0 {
            anyhow::bail!("generation.short_file_chars must be greater than 0");
        }
        if self.server.event_buffer == 0 {
            anyhow::bail!("server.event_buffer must be greater than 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            server: ServerConfig::default(),
            generation: GenerationConfig::default(),
            collaborators: CollaboratorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

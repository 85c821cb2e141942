use crate::config::{ProviderConfig, ProviderKind};
use crate::ollama::{ChatMessage, OllamaClient};
use crate::openai::OpenAiClient;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Live token stream from an upstream generator.
pub type TokenStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A `"<provider>/<model-name>"` identifier split into its parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelRef {
    pub provider: String,
    pub name: String,
}

impl ModelRef {
    /// Splits on the first `/`. An id without a provider prefix is routed to
    /// `default_provider`.
    pub fn parse(model_id: &str, default_provider: &str) -> Result<Self> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            anyhow::bail!("model id cannot be empty");
        }
        let (provider, name) = match model_id.split_once('/') {
            Some((provider, name)) => (provider, name),
            None => (default_provider, model_id),
        };
        if provider.is_empty() || name.is_empty() {
            anyhow::bail!("invalid model id '{}': expected <provider>/<model>", model_id);
        }
        Ok(Self {
            provider: provider.to_string(),
            name: name.to_string(),
        })
    }

    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.name)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Upstream failure with enough detail to classify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub provider: String,
    pub status: Option<u16>,
    pub timed_out: bool,
    pub connect_failed: bool,
    pub message: String,
}

impl ProviderError {
    pub fn http(provider: &str, status: u16, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            status: Some(status),
            timed_out: false,
            connect_failed: false,
            message: message.into(),
        }
    }

    pub fn stream(provider: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            status: None,
            timed_out: false,
            connect_failed: false,
            message: message.into(),
        }
    }

    pub fn transport(provider: &str, err: &reqwest::Error) -> Self {
        Self {
            provider: provider.to_string(),
            status: err.status().map(|s| s.as_u16()),
            timed_out: err.is_timeout(),
            connect_failed: err.is_connect(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} error ({}): {}", self.provider, status, self.message),
            None => write!(f, "{} error: {}", self.provider, self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

/// The upstream text-generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        model: &ModelRef,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<TokenStream>;
}

enum ProviderClient {
    Ollama(OllamaClient),
    OpenAi(OpenAiClient),
}

/// Routes generation calls to the configured provider by model prefix.
pub struct ModelManager {
    providers: HashMap<String, (ProviderConfig, ProviderClient)>,
}

impl ModelManager {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        let mut providers = HashMap::new();
        for cfg in configs {
            let api_key = cfg.resolved_api_key();
            let client = match cfg.kind {
                ProviderKind::Ollama => ProviderClient::Ollama(OllamaClient::new(cfg.url.clone(), api_key)),
                ProviderKind::OpenAi => {
                    ProviderClient::OpenAi(OpenAiClient::new(&cfg.id, cfg.url.clone(), api_key))
                }
            };
            providers.insert(cfg.id.clone(), (cfg, client));
        }
        Self { providers }
    }

    pub fn list_providers(&self) -> Vec<&ProviderConfig> {
        let mut list: Vec<&ProviderConfig> = self.providers.values().map(|(cfg, _)| cfg).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[async_trait]
impl TextGenerator for ModelManager {
    async fn generate(
        &self,
        model: &ModelRef,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<TokenStream> {
        let (_, client) = self
            .providers
            .get(&model.provider)
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' is not configured", model.provider))?;
        match client {
            ProviderClient::Ollama(c) => c.chat_text_stream(&model.name, messages, options).await,
            ProviderClient::OpenAi(c) => c.chat_text_stream(&model.name, messages, options).await,
        }
    }
}

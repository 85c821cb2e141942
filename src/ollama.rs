use crate::models::{GenerateOptions, ProviderError, TokenStream};
use anyhow::Result;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{FramedRead, LinesCodec};

#[derive(Clone)]
pub struct OllamaClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OllamaClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Streaming text chat. Ollama answers with one JSON object per line.
    pub async fn chat_text_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<TokenStream> {
        let total_len: usize = messages.iter().map(|m| m.content.len()).sum();
        if let Some(last) = messages.last() {
            tracing::info!("Ollama Request (Stream): model={}, messages={}, total_chars={}\nLast Message ({}): {:.200}...",
                model, messages.len(), total_len, last.role, last.content);
        } else {
            tracing::info!(
                "Ollama Request (Stream): model={}, messages={}, total_chars={}",
                model,
                messages.len(),
                total_len
            );
        }

        let url = format!("{}/api/chat", self.base_url);
        let req = ChatRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            stream: Some(true),
            options: RequestOptions::from_generate(options),
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| ProviderError::transport("ollama", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::http("ollama", status.as_u16(), text).into());
        }

        let stream = resp
            .bytes_stream()
            .map(|item| item.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(stream);
        let lines = FramedRead::new(reader, LinesCodec::new());

        let token_stream = lines.filter_map(|line_result| async move {
            let line = match line_result {
                Ok(l) => l,
                Err(e) => return Some(Err(anyhow::anyhow!("stream error: {}", e))),
            };
            if line.trim().is_empty() {
                return None;
            }
            let payload: ChatResponse = match serde_json::from_str(&line) {
                Ok(p) => p,
                Err(e) => {
                    return Some(Err(anyhow::anyhow!(
                        "json parse error: {} (line: {})",
                        e,
                        line
                    )))
                }
            };
            if let Some(err) = payload.error {
                return Some(Err(ProviderError::stream("ollama", err).into()));
            }
            let content = payload.message.map(|m| m.content).unwrap_or_default();
            if content.is_empty() {
                None
            } else {
                Some(Ok(content))
            }
        });

        Ok(token_stream.boxed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<RequestOptions>,
}

#[derive(Debug, Clone, Serialize)]
struct RequestOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

impl RequestOptions {
    fn from_generate(options: &GenerateOptions) -> Option<Self> {
        if options.temperature.is_none() && options.max_tokens.is_none() {
            return None;
        }
        Some(Self {
            temperature: options.temperature,
            num_predict: options.max_tokens,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    error: Option<String>,
}

use crate::models::{GenerateOptions, ProviderError, TokenStream};
use crate::ollama::ChatMessage;
use anyhow::Result;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    provider: String,
}

impl OpenAiClient {
    pub fn new(provider: &str, base_url: String, api_key: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            provider: provider.to_string(),
        }
    }

    /// Streaming text chat completion (SSE format).
    pub async fn chat_text_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &GenerateOptions,
    ) -> Result<TokenStream> {
        let total_len: usize = messages.iter().map(|m| m.content.len()).sum();
        if let Some(last) = messages.last() {
            tracing::info!(
                "OpenAI Request (Stream): provider={}, model={}, messages={}, total_chars={}\nLast Message ({}): {:.200}...",
                self.provider, model, messages.len(), total_len, last.role, last.content
            );
        } else {
            tracing::info!(
                "OpenAI Request (Stream): provider={}, model={}, messages={}, total_chars={}",
                self.provider, model, messages.len(), total_len
            );
        }

        let url = format!("{}/chat/completions", self.base_url);
        let req = OaiRequest {
            model: model.to_string(),
            messages: messages.iter().map(OaiMessage::from_chat).collect(),
            stream: true,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut rb = self.http.post(url).json(&req);
        if let Some(key) = &self.api_key {
            rb = rb.header("Authorization", format!("Bearer {}", key));
        }
        let resp = rb
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.provider, &e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::http(&self.provider, status.as_u16(), text).into());
        }

        // OpenAI streams SSE: "data: {...}\n\n" lines, terminated by "data: [DONE]"
        let byte_stream = resp
            .bytes_stream()
            .map(|item| item.map_err(std::io::Error::other));
        let reader = tokio_util::io::StreamReader::new(byte_stream);
        let lines = tokio_util::codec::FramedRead::new(reader, tokio_util::codec::LinesCodec::new());

        let provider = self.provider.clone();
        let token_stream = lines.filter_map(move |line_result| {
            let provider = provider.clone();
            async move {
                let line = match line_result {
                    Ok(l) => l,
                    Err(e) => return Some(Err(anyhow::anyhow!("stream error: {}", e))),
                };
                parse_sse_line(&provider, &line)
            }
        });

        Ok(token_stream.boxed())
    }
}

/// Content token carried by one SSE line, if any.
fn parse_sse_line(provider: &str, line: &str) -> Option<Result<String>> {
    let trimmed = line.trim();
    let data = trimmed.strip_prefix("data:")?.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let chunk: OaiStreamChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            return Some(Err(anyhow::anyhow!(
                "openai json parse error: {} (data: {})",
                e,
                data
            )));
        }
    };
    if let Some(err) = chunk.error {
        return Some(Err(ProviderError::stream(provider, err.message).into()));
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .unwrap_or_default();
    if content.is_empty() {
        None
    } else {
        Some(Ok(content))
    }
}

// --- Wire types ---

#[derive(Debug, Serialize)]
struct OaiMessage {
    role: String,
    content: String,
}

impl OaiMessage {
    fn from_chat(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role.clone(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OaiRequest {
    model: String,
    messages: Vec<OaiMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChunk {
    #[serde(default)]
    choices: Vec<OaiStreamChoice>,
    #[serde(default)]
    error: Option<OaiStreamError>,
}

#[derive(Debug, Deserialize)]
struct OaiStreamError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OaiStreamChoice {
    delta: OaiStreamDelta,
}

#[derive(Debug, Deserialize)]
struct OaiStreamDelta {
    content: Option<String>,
}

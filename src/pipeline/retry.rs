use crate::config::{FallbackRule, GenerationConfig};
use crate::models::{GenerateOptions, ModelRef, ProviderError, TextGenerator, TokenStream};
use crate::ollama::ChatMessage;
use crate::pipeline::events::{EventSink, ProgressEvent};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate limits, overload, timeouts. Worth another attempt.
    Transient,
    /// Structured tool-call validation failed upstream. Generation can go on.
    ToolValidation,
    Terminal,
}

const RETRYABLE_STATUS: &[u16] = &[408, 429, 500, 502, 503, 504, 529];

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "timeout",
    "timed out",
    "service unavailable",
    "overloaded",
    "temporarily unavailable",
];

const TOOL_VALIDATION_MARKERS: &[&str] = &[
    "tool call validation",
    "tool_use_failed",
    "failed to call a function",
];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

/// Classify an upstream failure. Typed provider errors are checked first,
/// then the rendered message chain.
pub fn classify(err: &anyhow::Error) -> ErrorClass {
    let text = format!("{:#}", err).to_lowercase();
    if TOOL_VALIDATION_MARKERS.iter().any(|m| text.contains(m)) {
        return ErrorClass::ToolValidation;
    }

    for cause in err.chain() {
        if let Some(provider_err) = cause.downcast_ref::<ProviderError>() {
            if provider_err.timed_out || provider_err.connect_failed {
                return ErrorClass::Transient;
            }
            if provider_err.status.is_some_and(is_retryable_status) {
                return ErrorClass::Transient;
            }
        }
        if let Some(req_err) = cause.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() || req_err.is_connect() {
                return ErrorClass::Transient;
            }
        }
    }

    if TRANSIENT_MARKERS.iter().any(|m| text.contains(m)) {
        return ErrorClass::Transient;
    }
    ErrorClass::Terminal
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait before retrying after failed attempt n is `n * backoff_step`.
    pub backoff_step: Duration,
    pub fallbacks: Vec<FallbackRule>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_step: Duration::from_secs(2),
            fallbacks: Vec::new(),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff_step: Duration::from_millis(config.backoff_step_ms),
            fallbacks: config.fallbacks.clone(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        self.backoff_step * failed_attempt
    }

    fn fallback_for(&self, provider: &str, class: ErrorClass) -> Option<&FallbackRule> {
        self.fallbacks
            .iter()
            .find(|rule| rule.provider == provider && rule.error_class == class)
    }
}

/// One generation call, kept only long enough to log and decide.
struct ProviderAttempt<'a> {
    number: u32,
    model: &'a ModelRef,
    error_class: Option<ErrorClass>,
}

impl fmt::Display for ProviderAttempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt {} with {}", self.number, self.model)?;
        if let Some(class) = self.error_class {
            write!(f, " ({:?})", class)?;
        }
        Ok(())
    }
}

pub struct OpenedStream {
    pub stream: TokenStream,
    /// Model that actually answered, which differs from the request after a fallback.
    pub model: ModelRef,
    pub attempts: u32,
}

/// Open a token stream, retrying transient failures with linear backoff.
/// Retry notices go to `sink` as `info` events.
pub async fn open_stream_with_retry(
    generator: &dyn TextGenerator,
    model: &ModelRef,
    messages: &[ChatMessage],
    options: &GenerateOptions,
    policy: &RetryPolicy,
    sink: &EventSink,
) -> Result<OpenedStream> {
    let max_attempts = policy.max_attempts();
    let mut current = model.clone();
    let mut attempt = 1;

    loop {
        let result = generator.generate(&current, messages, options).await;
        let err = match result {
            Ok(stream) => {
                info!(
                    "Stream opened: {}",
                    ProviderAttempt {
                        number: attempt,
                        model: &current,
                        error_class: None,
                    }
                );
                return Ok(OpenedStream {
                    stream,
                    model: current,
                    attempts: attempt,
                });
            }
            Err(err) => err,
        };

        let class = classify(&err);
        warn!(
            "Provider {} failed: {:#}",
            ProviderAttempt {
                number: attempt,
                model: &current,
                error_class: Some(class),
            },
            err
        );

        // Tool-call validation is retried like a transient failure when it
        // happens before any output.
        let retryable = matches!(class, ErrorClass::Transient | ErrorClass::ToolValidation);
        if !retryable {
            return Err(err);
        }
        if attempt >= max_attempts {
            return Err(err.context(format!(
                "{} failed after {} attempts",
                current, attempt
            )));
        }

        let delay = policy.backoff_for(attempt);
        attempt += 1;

        if attempt == max_attempts {
            if let Some(rule) = policy.fallback_for(&current.provider, class) {
                match ModelRef::parse(&rule.model, &current.provider) {
                    Ok(fallback) => {
                        info!("Switching from {} to fallback model {}", current, fallback);
                        sink.emit(ProgressEvent::info(format!(
                            "{} is unavailable, switching to {}",
                            current, fallback
                        )))
                        .await?;
                        current = fallback;
                    }
                    Err(e) => warn!("Ignoring invalid fallback model '{}': {}", rule.model, e),
                }
            }
        }

        sink.emit(ProgressEvent::info(format!(
            "Provider busy, retrying in {}s (attempt {}/{})",
            delay.as_secs(),
            attempt,
            max_attempts
        )))
        .await?;
        tokio::time::sleep(delay).await;
    }
}

/// Run one generation to completion and return the full reply text.
pub async fn generate_text_with_retry(
    generator: &dyn TextGenerator,
    model: &ModelRef,
    messages: &[ChatMessage],
    options: &GenerateOptions,
    policy: &RetryPolicy,
    sink: &EventSink,
) -> Result<String> {
    use futures_util::StreamExt;

    let mut opened = open_stream_with_retry(generator, model, messages, options, policy, sink).await?;
    let mut text = String::new();
    while let Some(chunk) = opened.stream.next().await {
        text.push_str(&chunk?);
    }
    Ok(text)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Generator that fails with queued errors before answering with `reply`.
    pub(crate) struct FlakyGenerator {
        pub calls: AtomicUsize,
        pub failures: Mutex<Vec<ProviderError>>,
        pub models_seen: Mutex<Vec<String>>,
        pub reply: Vec<String>,
    }

    impl FlakyGenerator {
        pub(crate) fn new(failures: Vec<ProviderError>, reply: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: Mutex::new(failures),
                models_seen: Mutex::new(Vec::new()),
                reply: reply.iter().map(|s| s.to_string()).collect(),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for FlakyGenerator {
        async fn generate(
            &self,
            model: &ModelRef,
            _messages: &[ChatMessage],
            _options: &GenerateOptions,
        ) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.models_seen.lock().unwrap().push(model.id());
            let mut failures = self.failures.lock().unwrap();
            if !failures.is_empty() {
                return Err(failures.remove(0).into());
            }
            let chunks: Vec<Result<String>> = self.reply.iter().cloned().map(Ok).collect();
            Ok(futures_util::stream::iter(chunks).boxed())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            backoff_step: Duration::ZERO,
            fallbacks: Vec::new(),
        }
    }

    fn overloaded() -> ProviderError {
        ProviderError::http("groq", 503, "service unavailable")
    }

    #[test]
    fn classifies_status_and_message() {
        let err: anyhow::Error = ProviderError::http("x", 429, "slow down").into();
        assert_eq!(classify(&err), ErrorClass::Transient);

        let err: anyhow::Error = ProviderError::http("x", 401, "bad key").into();
        assert_eq!(classify(&err), ErrorClass::Terminal);

        let err = anyhow::anyhow!("Request timed out after 300s");
        assert_eq!(classify(&err), ErrorClass::Transient);

        let err: anyhow::Error =
            ProviderError::http("groq", 400, "tool call validation failed: bad args").into();
        assert_eq!(classify(&err), ErrorClass::ToolValidation);
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(4));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[test]
    fn attempt_display_names_model_and_class() {
        let model = ModelRef::parse("groq/kimi", "ollama").unwrap();
        let ok = ProviderAttempt {
            number: 1,
            model: &model,
            error_class: None,
        };
        assert_eq!(ok.to_string(), "attempt 1 with groq/kimi");
        let failed = ProviderAttempt {
            number: 2,
            model: &model,
            error_class: Some(ErrorClass::Transient),
        };
        assert_eq!(failed.to_string(), "attempt 2 with groq/kimi (Transient)");
    }

    #[tokio::test]
    async fn always_transient_generator_is_called_three_times() {
        let generator = FlakyGenerator::new(vec![overloaded(), overloaded(), overloaded(), overloaded()], &[]);
        let (sink, mut rx) = EventSink::channel(16);
        let model = ModelRef::parse("groq/kimi", "ollama").unwrap();

        let result = open_stream_with_retry(
            &generator,
            &model,
            &[],
            &GenerateOptions::default(),
            &fast_policy(),
            &sink,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(generator.calls(), 3);
        drop(sink);
        let mut infos = 0;
        while let Some(event) = rx.recv().await {
            assert!(matches!(event, ProgressEvent::Info { .. }));
            infos += 1;
        }
        assert_eq!(infos, 2);
    }

    #[tokio::test]
    async fn terminal_error_is_not_retried() {
        let generator = FlakyGenerator::new(vec![ProviderError::http("groq", 401, "invalid api key")], &["x"]);
        let (sink, _rx) = EventSink::channel(16);
        let model = ModelRef::parse("groq/kimi", "ollama").unwrap();

        let result = open_stream_with_retry(
            &generator,
            &model,
            &[],
            &GenerateOptions::default(),
            &fast_policy(),
            &sink,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn falls_back_on_last_attempt() {
        let generator = FlakyGenerator::new(vec![overloaded(), overloaded()], &["ok"]);
        let (sink, _rx) = EventSink::channel(16);
        let model = ModelRef::parse("groq/kimi", "ollama").unwrap();
        let mut policy = fast_policy();
        policy.fallbacks.push(FallbackRule {
            provider: "groq".to_string(),
            error_class: ErrorClass::Transient,
            model: "anthropic/claude-sonnet-4".to_string(),
        });

        let opened = open_stream_with_retry(
            &generator,
            &model,
            &[],
            &GenerateOptions::default(),
            &policy,
            &sink,
        )
        .await
        .unwrap();

        assert_eq!(opened.attempts, 3);
        assert_eq!(opened.model.id(), "anthropic/claude-sonnet-4");
        let seen = generator.models_seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["groq/kimi", "groq/kimi", "anthropic/claude-sonnet-4"]);
    }

    #[tokio::test]
    async fn collects_full_text_after_recovering() {
        let generator = FlakyGenerator::new(vec![overloaded()], &["hello ", "world"]);
        let (sink, _rx) = EventSink::channel(16);
        let model = ModelRef::parse("groq/kimi", "ollama").unwrap();

        let text = generate_text_with_retry(
            &generator,
            &model,
            &[],
            &GenerateOptions::default(),
            &fast_policy(),
            &sink,
        )
        .await
        .unwrap();

        assert_eq!(text, "hello world");
        assert_eq!(generator.calls(), 2);
    }
}

//! Streaming code generation: one request in, an ordered event stream out.

pub mod audit;
pub mod events;
pub mod extractor;
pub mod packages;
pub mod recovery;
pub mod request;
pub mod retry;
pub mod scanner;
pub mod session;

use crate::collaborators::Collaborators;
use crate::config::Config;
use crate::models::{GenerateOptions, ModelRef, TextGenerator};
use crate::prompts::PromptStore;
use anyhow::Result;
use audit::AuditThresholds;
use events::{EventSink, ProgressEvent};
use futures_util::StreamExt;
use recovery::Recovery;
use request::GenerateRequest;
use retry::{classify, open_stream_with_retry, ErrorClass, RetryPolicy};
use session::GenerationSession;
use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub default_model: String,
    pub default_provider: String,
    pub options: GenerateOptions,
    pub retry: RetryPolicy,
    pub thresholds: AuditThresholds,
    pub builtin_packages: Vec<String>,
    pub recovery_enabled: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        let generation = &config.generation;
        Self {
            default_model: generation.default_model.clone(),
            default_provider: config.default_provider().to_string(),
            options: GenerateOptions {
                temperature: generation.temperature,
                max_tokens: generation.max_tokens,
            },
            retry: RetryPolicy::from_config(generation),
            thresholds: AuditThresholds {
                brace_tolerance: generation.brace_tolerance,
                short_file_chars: generation.short_file_chars,
            },
            builtin_packages: generation.builtin_packages.clone(),
            recovery_enabled: generation.recovery_enabled,
        }
    }
}

/// Shared across requests. Each call to [`Pipeline::run_generation`] owns its
/// own session.
#[derive(Clone)]
pub struct Pipeline {
    pub generator: Arc<dyn TextGenerator>,
    pub prompts: Arc<PromptStore>,
    pub collaborators: Collaborators,
    pub settings: PipelineSettings,
}

impl Pipeline {
    /// Run one request to its terminal event. A terminal failure is sent as an
    /// `error` event and also returned. If the sink closes, the session is
    /// abandoned without recovery.
    pub async fn run_generation(&self, request: &GenerateRequest, sink: &EventSink) -> Result<()> {
        let session_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("generation", %session_id, edit = request.is_edit);
        self.run_inner(request, sink).instrument(span).await
    }

    async fn run_inner(&self, request: &GenerateRequest, sink: &EventSink) -> Result<()> {
        let model_id = if request.model.trim().is_empty() {
            self.settings.default_model.as_str()
        } else {
            request.model.as_str()
        };
        let model = match ModelRef::parse(model_id, &self.settings.default_provider) {
            Ok(model) => model,
            Err(e) => return fail(sink, e).await,
        };
        info!("Generation requested: model={}, prompt_chars={}", model, request.prompt.len());

        sink.emit(ProgressEvent::status("Preparing generation context")).await?;
        let files = self
            .collaborators
            .resolve_files(request, &model.id(), sink)
            .await?;
        let messages = self.prompts.generation_messages(request, &files);

        sink.emit(ProgressEvent::status(format!("Generating code with {}", model)))
            .await?;
        let opened = match open_stream_with_retry(
            self.generator.as_ref(),
            &model,
            &messages,
            &self.settings.options,
            &self.settings.retry,
            sink,
        )
        .await
        {
            Ok(opened) => opened,
            Err(e) => return fail(sink, e).await,
        };
        if opened.attempts > 1 {
            info!("{} answered after {} attempts", opened.model, opened.attempts);
        }

        let mut session = GenerationSession::new(
            request.is_edit,
            opened.model.id(),
            self.settings.builtin_packages.clone(),
        );
        let mut stream = opened.stream;

        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    let events = session.push_chunk(&chunk);
                    sink.emit_all(events).await?;
                }
                Err(e) if classify(&e) == ErrorClass::ToolValidation => {
                    warn!("Tool call validation failed mid-stream: {:#}", e);
                    sink.emit(ProgressEvent::warning(
                        "Tool call validation failed; packages will be detected from imports",
                    ))
                    .await?;
                }
                Err(e) => {
                    if let Some(open) = session.current_file() {
                        warn!("Stream failed while writing {}", open.path);
                    }
                    return fail(sink, e).await;
                }
            }
        }
        drop(stream);
        if let Some(open) = session.current_file() {
            warn!("Stream ended inside {} ({} chars)", open.path, open.content.len());
        }
        sink.emit_all(session.finish_stream()).await?;
        if session.files.is_empty() {
            warn!("Stream produced no complete file blocks");
        }
        info!(
            "Stream finished: {} chars, {} files",
            session.accumulated_text.len(),
            session.files.len()
        );

        let findings = audit::audit(&session.accumulated_text, &self.settings.thresholds);
        session.warnings = findings.iter().map(|w| w.message.clone()).collect();
        if !findings.is_empty() {
            for finding in &findings {
                warn!("Truncation check: {}", finding.message);
            }
            sink.emit(ProgressEvent::Warning {
                message: format!("Detected {} potential truncation issue(s)", findings.len()),
                warnings: Some(session.warnings.clone()),
            })
            .await?;
        }

        let flagged = audit::flagged_paths(&findings);
        if self.settings.recovery_enabled && !flagged.is_empty() && !sink.is_closed() {
            sink.emit(ProgressEvent::status(format!(
                "Recovering {} truncated file(s)",
                flagged.len()
            )))
            .await?;
            let recovery = Recovery {
                generator: self.generator.as_ref(),
                prompts: &self.prompts,
                model: &opened.model,
                options: &self.settings.options,
                policy: &self.settings.retry,
                sink,
            };
            let mut text = session.accumulated_text.clone();
            let unresolved = recovery.run(&request.prompt, &mut text, &findings).await?;

            session.warnings = findings
                .iter()
                .filter(|w| w.path.is_none())
                .map(|w| w.message.clone())
                .chain(unresolved)
                .collect();
            let events = session.replace_text(text);
            sink.emit_all(events).await?;
        }

        let payload = session.complete_payload();
        info!(
            "Generation complete: files={}, components={}, warnings={}",
            payload.files,
            payload.components,
            session.warnings.len()
        );
        sink.emit(ProgressEvent::Complete(payload)).await
    }
}

async fn fail(sink: &EventSink, err: anyhow::Error) -> Result<()> {
    error!("Generation failed: {:#}", err);
    sink.emit(ProgressEvent::error(format!("{:#}", err))).await?;
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProviderError, TokenStream};
    use crate::ollama::ChatMessage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    enum Script {
        Fail(ProviderError),
        Chunks(Vec<Result<String, ProviderError>>),
    }

    /// Plays one script per call, repeating the last one when exhausted.
    struct ScriptedGenerator {
        calls: AtomicUsize,
        scripts: Mutex<Vec<Script>>,
        /// Receiver dropped on the first call, simulating a client disconnect.
        disconnect: Mutex<Option<mpsc::Receiver<ProgressEvent>>>,
    }

    impl ScriptedGenerator {
        fn new(scripts: Vec<Script>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                scripts: Mutex::new(scripts),
                disconnect: Mutex::new(None),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            _model: &ModelRef,
            _messages: &[ChatMessage],
            _options: &GenerateOptions,
        ) -> Result<TokenStream> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            drop(self.disconnect.lock().unwrap().take());

            let mut scripts = self.scripts.lock().unwrap();
            let script = if scripts.len() > 1 {
                scripts.remove(0)
            } else {
                match scripts.first() {
                    Some(Script::Fail(e)) => Script::Fail(e.clone()),
                    Some(Script::Chunks(items)) => Script::Chunks(items.clone()),
                    None => Script::Chunks(Vec::new()),
                }
            };
            match script {
                Script::Fail(e) => Err(e.into()),
                Script::Chunks(items) => {
                    let items: Vec<Result<String>> =
                        items.into_iter().map(|i| i.map_err(anyhow::Error::from)).collect();
                    Ok(futures_util::stream::iter(items).boxed())
                }
            }
        }
    }

    fn chunks(parts: &[&str]) -> Script {
        Script::Chunks(parts.iter().map(|p| Ok(p.to_string())).collect())
    }

    fn pipeline(generator: Arc<ScriptedGenerator>) -> Pipeline {
        let mut settings = PipelineSettings::from_config(&Config::default());
        settings.retry.backoff_step = Duration::ZERO;
        Pipeline {
            generator,
            prompts: Arc::new(PromptStore::load(None)),
            collaborators: Collaborators::default(),
            settings,
        }
    }

    fn request(prompt: &str, is_edit: bool) -> GenerateRequest {
        GenerateRequest {
            prompt: prompt.to_string(),
            model: "ollama/qwen3-coder".to_string(),
            context: None,
            is_edit,
        }
    }

    async fn collect(mut rx: mpsc::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    async fn run(generator: Arc<ScriptedGenerator>, req: GenerateRequest) -> (Result<()>, Vec<ProgressEvent>) {
        let pipeline = pipeline(generator);
        let (sink, rx) = EventSink::channel(8);
        let collector = tokio::spawn(collect(rx));
        let result = pipeline.run_generation(&req, &sink).await;
        drop(sink);
        (result, collector.await.unwrap())
    }

    #[tokio::test]
    async fn button_scenario_end_to_end() {
        let generator = Arc::new(ScriptedGenerator::new(vec![chunks(&[
            "I'll add a but",
            "ton.\n<fi",
            "le path=\"src/components/Btn.jsx\">export default function Btn(){return <button>Hi</button>}</fi",
            "le>\n<explanation>Added a button.</explanation>",
        ])]));
        let (result, events) = run(generator.clone(), request("add a button", false)).await;
        result.unwrap();

        let conversations: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Conversation { .. }))
            .collect();
        assert_eq!(
            conversations,
            vec![&ProgressEvent::Conversation {
                text: "I'll add a button.".to_string()
            }]
        );
        let components = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::Component { name, .. } if name == "Btn"))
            .count();
        assert_eq!(components, 1);

        let Some(ProgressEvent::Complete(payload)) = events.last() else {
            panic!("last event should be complete: {:?}", events.last());
        };
        assert_eq!(payload.files, 1);
        assert_eq!(payload.explanation, "Added a button.");
        assert!(payload.packages_to_install.is_none());
        assert_eq!(payload.model, "ollama/qwen3-coder");
        assert_eq!(generator.calls(), 1);

        let frame = events.last().unwrap().to_json();
        assert!(!frame.contains("packagesToInstall"));
    }

    #[tokio::test]
    async fn always_transient_provider_ends_with_error_after_three_calls() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Script::Fail(ProviderError::http(
            "ollama",
            503,
            "service unavailable",
        ))]));
        let (result, events) = run(generator.clone(), request("x", false)).await;

        assert!(result.is_err());
        assert_eq!(generator.calls(), 3);
        assert!(matches!(events.last(), Some(ProgressEvent::Error { .. })));
        assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Complete(_))));
    }

    #[tokio::test]
    async fn tool_validation_mid_stream_continues() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Script::Chunks(vec![
            Ok("<file path=\"src/App.jsx\">export default function App() { return null }".to_string()),
            Err(ProviderError::stream("groq", "tool call validation failed")),
            Ok("</file>".to_string()),
        ])]));
        let (result, events) = run(generator, request("x", true)).await;
        result.unwrap();

        assert!(events.iter().any(|e| matches!(e, ProgressEvent::Warning { message, .. } if message.contains("Tool call validation"))));
        let Some(ProgressEvent::Complete(payload)) = events.last() else {
            panic!("expected complete");
        };
        assert_eq!(payload.files, 1);
    }

    #[tokio::test]
    async fn terminal_error_mid_stream_ends_request() {
        let generator = Arc::new(ScriptedGenerator::new(vec![Script::Chunks(vec![
            Ok("<file path=\"src/App.jsx\">".to_string()),
            Err(ProviderError::stream("ollama", "model not found")),
            Ok("never seen</file>".to_string()),
        ])]));
        let (result, events) = run(generator.clone(), request("x", false)).await;

        assert!(result.is_err());
        assert!(matches!(events.last(), Some(ProgressEvent::Error { .. })));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn truncated_file_is_recovered() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            chunks(&["Building.\n<file path=\"src/App.jsx\">export default function App() { return <"]),
            chunks(&["```jsx\nexport default function App() { return <div /> }\n```"]),
        ]));
        let (result, events) = run(generator.clone(), request("make an app", false)).await;
        result.unwrap();
        assert_eq!(generator.calls(), 2);

        let warning = events.iter().find_map(|e| match e {
            ProgressEvent::Warning { warnings: Some(list), .. } => Some(list.clone()),
            _ => None,
        });
        let warning = warning.unwrap();
        assert!(warning.contains(&"File tag mismatch: 1 open, 0 closed".to_string()));
        assert!(warning.iter().any(|w| w.contains("incomplete HTML tags")));

        let Some(ProgressEvent::Complete(payload)) = events.last() else {
            panic!("expected complete");
        };
        assert_eq!(payload.files, 1);
        assert!(payload
            .generated_code
            .ends_with("<file path=\"src/App.jsx\">\nexport default function App() { return <div /> }\n</file>"));
        assert_eq!(
            payload.warnings,
            Some(vec!["File tag mismatch: 1 open, 0 closed".to_string()])
        );
    }

    #[tokio::test]
    async fn abandoned_session_issues_no_recovery_call() {
        let generator = Arc::new(ScriptedGenerator::new(vec![
            chunks(&["<file path=\"src/App.jsx\">export default function App() { return <"]),
            chunks(&["recovered"]),
        ]));
        let pipeline = pipeline(generator.clone());
        let (sink, rx) = EventSink::channel(64);
        *generator.disconnect.lock().unwrap() = Some(rx);

        let result = pipeline.run_generation(&request("x", false), &sink).await;

        assert!(result.is_err());
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn empty_model_uses_default() {
        let generator = Arc::new(ScriptedGenerator::new(vec![chunks(&["<explanation>ok</explanation>"])]));
        let mut req = request("x", false);
        req.model = String::new();
        let (result, events) = run(generator, req).await;
        result.unwrap();
        let Some(ProgressEvent::Complete(payload)) = events.last() else {
            panic!("expected complete");
        };
        assert_eq!(payload.model, Config::default().generation.default_model);
        assert_eq!(payload.files, 0);
    }
}

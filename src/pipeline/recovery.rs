//! Re-requests files the audit flagged and splices the answers back into the
//! accumulated text.

use super::events::{EventSink, ProgressEvent};
use super::retry::{generate_text_with_retry, RetryPolicy};
use super::session::TruncationWarning;
use crate::models::{GenerateOptions, ModelRef, TextGenerator};
use crate::prompts::PromptStore;
use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;
use tracing::{info, warn};

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```(?:[\w+.-]*[^\S\n]*\n)?([\s\S]*?)```").unwrap());

static WRAPPED_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<file path="[^"]+">(.*?)(?:</file>|\z)"#).unwrap());

pub struct Recovery<'a> {
    pub generator: &'a dyn TextGenerator,
    pub prompts: &'a PromptStore,
    pub model: &'a ModelRef,
    pub options: &'a GenerateOptions,
    pub policy: &'a RetryPolicy,
    pub sink: &'a EventSink,
}

impl Recovery<'_> {
    /// Repair every distinct flagged path in `text`. Returns the warnings
    /// left for files that could not be recovered.
    ///
    /// Errors only when the event sink is gone, in which case the session is
    /// abandoned.
    pub async fn run(
        &self,
        original_request: &str,
        text: &mut String,
        warnings: &[TruncationWarning],
    ) -> Result<Vec<String>> {
        let mut unresolved = Vec::new();

        for path in super::audit::flagged_paths(warnings) {
            self.sink
                .emit(ProgressEvent::info(format!("Recovering truncated file {}", path)))
                .await?;

            let messages = self.prompts.recovery_messages(&path, original_request);
            let reply = generate_text_with_retry(
                self.generator,
                self.model,
                &messages,
                self.options,
                self.policy,
                self.sink,
            )
            .await;

            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    if self.sink.is_closed() {
                        return Err(e);
                    }
                    warn!("Recovery of {} failed: {:#}", path, e);
                    let message = format!("File {} may be incomplete; manual review needed", path);
                    self.sink.emit(ProgressEvent::warning(message.clone())).await?;
                    unresolved.push(message);
                    continue;
                }
            };

            let content = strip_fences(&reply);
            if content.is_empty() || !splice_file(text, &path, content)? {
                warn!("Recovery of {} returned nothing usable", path);
                let message = format!("File {} may be incomplete; manual review needed", path);
                self.sink.emit(ProgressEvent::warning(message.clone())).await?;
                unresolved.push(message);
                continue;
            }

            info!("Recovered truncated file {} ({} chars)", path, content.len());
            self.sink
                .emit(ProgressEvent::info(format!("Recovered {}", path)))
                .await?;
        }

        Ok(unresolved)
    }
}

/// Content of the first fenced block, else of a `<file>` wrapper, else the
/// whole reply.
pub fn strip_fences(reply: &str) -> &str {
    if let Some(inner) = FENCE_RE.captures(reply).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    if let Some(inner) = WRAPPED_FILE_RE.captures(reply).and_then(|c| c.get(1)) {
        return inner.as_str().trim();
    }
    reply.trim()
}

/// Replace the last region opened by `<file path="{path}">` with a closed
/// block holding `content`. Returns false when the path has no region.
pub fn splice_file(text: &mut String, path: &str, content: &str) -> Result<bool> {
    let opening = format!("<file path=\"{}\">", path);
    let region = Regex::new(&format!(r"(?s){}(.*?)(?:</file>|\z)", regex::escape(&opening)))?;

    let Some(range) = region.find_iter(text).last().map(|m| m.range()) else {
        return Ok(false);
    };
    let block = format!("{}\n{}\n</file>", opening, content);
    text.replace_range(range, &block);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProviderError;
    use crate::pipeline::retry::tests::FlakyGenerator;
    use std::time::Duration;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            backoff_step: Duration::ZERO,
            fallbacks: Vec::new(),
        }
    }

    #[test]
    fn strips_first_fenced_block() {
        let reply = "Here you go:\n```jsx\nexport default 1;\n```\nand more\n```\nx\n```";
        assert_eq!(strip_fences(reply), "export default 1;");
        assert_eq!(strip_fences("  plain body \n"), "plain body");
        assert_eq!(strip_fences("<file path=\"a.js\">\nbody\n</file>"), "body");
    }

    #[test]
    fn single_line_fence_keeps_whole_body() {
        assert_eq!(strip_fences("```export default 1```"), "export default 1");
        assert_eq!(strip_fences("Here:\n```\nconst a = 1;\n```"), "const a = 1;");
        assert_eq!(strip_fences("```jsx \nconst b = 2;```"), "const b = 2;");
    }

    #[test]
    fn splices_unclosed_region_at_end() {
        let mut text = "intro\n<file path=\"src/App.jsx\">function App() {".to_string();
        assert!(splice_file(&mut text, "src/App.jsx", "function App() { return 1 }").unwrap());
        assert_eq!(
            text,
            "intro\n<file path=\"src/App.jsx\">\nfunction App() { return 1 }\n</file>"
        );
    }

    #[test]
    fn splice_targets_last_occurrence_and_escapes_path() {
        let mut text = concat!(
            "<file path=\"src/(a).js\">v1</file>\n",
            "<file path=\"src/(a).js\">v2 trunc</file>\n",
            "<explanation>x</explanation>"
        )
        .to_string();
        assert!(splice_file(&mut text, "src/(a).js", "v3").unwrap());
        assert!(text.starts_with("<file path=\"src/(a).js\">v1</file>\n"));
        assert!(text.contains("<file path=\"src/(a).js\">\nv3\n</file>\n<explanation>"));
        assert!(!splice_file(&mut text, "missing.js", "x").unwrap());
    }

    #[tokio::test]
    async fn repairs_flagged_file() {
        let generator = FlakyGenerator::new(Vec::new(), &["```jsx\nexport default function App() { return null }\n```"]);
        let prompts = PromptStore::load(None);
        let model = ModelRef::parse("ollama/qwen3-coder", "ollama").unwrap();
        let (sink, _rx) = EventSink::channel(16);
        let recovery = Recovery {
            generator: &generator,
            prompts: &prompts,
            model: &model,
            options: &GenerateOptions::default(),
            policy: &policy(),
            sink: &sink,
        };

        let mut text = "<file path=\"src/App.jsx\">export default function App() {".to_string();
        let warnings = vec![
            TruncationWarning::session("File tag mismatch: 1 open, 0 closed"),
            TruncationWarning::file("src/App.jsx", "File src/App.jsx appears severely truncated"),
        ];
        let unresolved = recovery.run("make an app", &mut text, &warnings).await.unwrap();

        assert!(unresolved.is_empty());
        assert_eq!(generator.calls(), 1);
        assert!(text.ends_with("return null }\n</file>"));
    }

    #[tokio::test]
    async fn failed_recovery_leaves_text_and_warns() {
        let failures = vec![
            ProviderError::http("ollama", 400, "bad request"),
        ];
        let generator = FlakyGenerator::new(failures, &["unused"]);
        let prompts = PromptStore::load(None);
        let model = ModelRef::parse("ollama/qwen3-coder", "ollama").unwrap();
        let (sink, mut rx) = EventSink::channel(16);
        let recovery = Recovery {
            generator: &generator,
            prompts: &prompts,
            model: &model,
            options: &GenerateOptions::default(),
            policy: &policy(),
            sink: &sink,
        };

        let original = "<file path=\"a.js\">function a() {".to_string();
        let mut text = original.clone();
        let warnings = vec![TruncationWarning::file("a.js", "File a.js appears severely truncated")];
        let unresolved = recovery.run("req", &mut text, &warnings).await.unwrap();

        assert_eq!(text, original);
        assert_eq!(unresolved, vec!["File a.js may be incomplete; manual review needed"]);
        assert_eq!(generator.calls(), 1);
        drop(recovery);
        drop(sink);
        let mut saw_warning = false;
        while let Some(event) = rx.recv().await {
            if let ProgressEvent::Warning { message, .. } = event {
                saw_warning = message.contains("manual review");
            }
        }
        assert!(saw_warning);
    }
}

use crate::pipeline::events::{EventSink, ProgressEvent};
use crate::pipeline::request::{GenerateRequest, RequestContext};
use crate::pipeline::Pipeline;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;

pub struct GenerateArgs<'a> {
    pub prompt: String,
    pub model: Option<String>,
    pub is_edit: bool,
    /// JSON file holding the request `context` object.
    pub context_file: Option<&'a Path>,
}

/// Run one request and print its frames to stdout. Fails when the stream
/// ended with an `error` event.
pub async fn run(pipeline: Pipeline, args: GenerateArgs<'_>, buffer: usize) -> Result<()> {
    let context = match args.context_file {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading context file {}", path.display()))?;
            let context: RequestContext = serde_json::from_str(&raw)
                .with_context(|| format!("parsing context file {}", path.display()))?;
            Some(context)
        }
        None => None,
    };
    let request = GenerateRequest {
        prompt: args.prompt,
        model: args.model.unwrap_or_default(),
        context,
        is_edit: args.is_edit,
    };

    let (sink, mut rx) = EventSink::channel(buffer);
    let task = tokio::spawn(async move { pipeline.run_generation(&request, &sink).await });

    let mut failed = None;
    let stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        if let ProgressEvent::Error { error } = &event {
            failed = Some(error.clone());
        }
        let mut out = stdout.lock();
        out.write_all(event.to_frame().as_bytes())?;
        out.flush()?;
        if event.is_terminal() {
            break;
        }
    }
    // The pipeline's own error was already printed as a frame.
    let _ = task.await?;

    match failed {
        Some(error) => anyhow::bail!("generation failed: {}", error),
        None => Ok(()),
    }
}

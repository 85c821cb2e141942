use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;

/// Events streamed to the caller. Serialized with a `type` discriminator and
/// framed as `data: <json>\n\n`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    Status {
        message: String,
    },
    Conversation {
        text: String,
    },
    Stream {
        text: String,
        raw: bool,
    },
    Package {
        name: String,
        message: String,
    },
    Component {
        name: String,
        path: String,
        index: usize,
    },
    App {
        message: String,
        path: String,
    },
    Warning {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        warnings: Option<Vec<String>>,
    },
    Info {
        message: String,
    },
    Error {
        error: String,
    },
    Complete(CompletePayload),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub generated_code: String,
    pub explanation: String,
    pub files: usize,
    pub components: usize,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages_to_install: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl ProgressEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
            warnings: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn raw(text: &str) -> Self {
        Self::Stream {
            text: text.to_string(),
            raw: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete(_))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"event serialization failed: {e}"}}"#)
        })
    }

    /// `data: <json>\n\n`
    pub fn to_frame(&self) -> String {
        format!("data: {}\n\n", self.to_json())
    }
}

/// Ordered, back-pressured event writer. Every emit waits for channel
/// capacity, so a slow consumer throttles the pipeline.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Fails once the receiving side is gone; the caller must then abandon
    /// the session.
    pub async fn emit(&self, event: ProgressEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow::anyhow!("event receiver dropped; session abandoned"))
    }

    pub async fn emit_all(&self, events: Vec<ProgressEvent>) -> Result<()> {
        for event in events {
            self.emit(event).await?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

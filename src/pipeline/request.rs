use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Inbound body of `POST /api/generate-code-stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    /// `"<provider>/<model>"`. Empty means the configured default.
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub context: Option<RequestContext>,
    #[serde(default)]
    pub is_edit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// File tree rendered as text.
    #[serde(default)]
    pub structure: Option<String>,
    #[serde(default)]
    pub current_files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub conversation: Option<Conversation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub edits: Vec<ConversationEdit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEdit {
    pub prompt: String,
    #[serde(default)]
    pub target_files: Vec<String>,
}

impl GenerateRequest {
    pub fn sandbox_id(&self) -> Option<&str> {
        self.context
            .as_ref()
            .and_then(|c| c.sandbox_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    pub fn current_files(&self) -> Option<&BTreeMap<String, String>> {
        self.context
            .as_ref()
            .and_then(|c| c.current_files.as_ref())
            .filter(|files| !files.is_empty())
    }
}

//! Prompt template store.
//!
//! Loads prompt templates from `~/.codestream/prompts/` at runtime, falling
//! back to compiled-in defaults from `prompts/` in the source tree. Templates
//! use `{variable}` placeholders that are substituted via [`PromptStore::render`].

use crate::ollama::ChatMessage;
use crate::pipeline::request::{Conversation, GenerateRequest};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Well-known prompt keys
// ---------------------------------------------------------------------------

/// Output format and conventions for every generation.
pub const GENERATION_SYSTEM: &str = "generation-system";
/// Appended to the system prompt for edits of an existing project.
pub const EDIT_MODE: &str = "edit-mode";
/// Re-request one truncated file. Vars: `{path}`, `{request}`.
pub const RECOVERY: &str = "recovery";

const DEFAULTS: &[(&str, &str)] = &[
    (GENERATION_SYSTEM, include_str!("../prompts/generation-system.md")),
    (EDIT_MODE, include_str!("../prompts/edit-mode.md")),
    (RECOVERY, include_str!("../prompts/recovery.md")),
];

const HISTORY_MESSAGES: usize = 10;
const HISTORY_EDITS: usize = 5;

/// Runtime prompt template store.
///
/// Embedded defaults are loaded first, then any `.md` files in `override_dir`
/// replace templates with the same stem.
pub struct PromptStore {
    prompts: HashMap<String, String>,
}

impl PromptStore {
    pub fn load(override_dir: Option<&Path>) -> Self {
        let mut prompts: HashMap<String, String> = DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if let Some(dir) = override_dir {
            Self::overlay_from_dir(&mut prompts, dir);
        }

        Self { prompts }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.prompts.get(key).map(|s| s.as_str())
    }

    /// Render a template, replacing every `{name}` with the value from `vars`.
    /// Unknown keys in the template are left as-is.
    pub fn render(&self, key: &str, vars: &[(&str, &str)]) -> Option<String> {
        self.get(key).map(|tpl| Self::substitute(tpl, vars))
    }

    pub fn substitute(tpl: &str, vars: &[(&str, &str)]) -> String {
        let mut out = tpl.to_string();
        for (name, value) in vars {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }

    /// `~/.codestream/prompts/`
    pub fn default_override_dir() -> PathBuf {
        crate::paths::codestream_home().join("prompts")
    }

    pub fn system_prompt(&self, is_edit: bool) -> String {
        let mut prompt = self.get(GENERATION_SYSTEM).unwrap_or_default().trim().to_string();
        if is_edit {
            if let Some(edit) = self.get(EDIT_MODE) {
                prompt.push_str("\n\n");
                prompt.push_str(edit.trim());
            }
        }
        prompt
    }

    /// System prompt plus one user message carrying project context, recent
    /// history and the request itself.
    pub fn generation_messages(
        &self,
        request: &GenerateRequest,
        files: &[(String, String)],
    ) -> Vec<ChatMessage> {
        let mut sections = Vec::new();
        let context = request.context.as_ref();

        if let Some(structure) = context
            .and_then(|c| c.structure.as_deref())
            .filter(|s| !s.trim().is_empty())
        {
            sections.push(format!("## Project structure\n{}", structure.trim()));
        }
        if !files.is_empty() {
            sections.push(render_files(files));
        }
        if let Some(history) = context
            .and_then(|c| c.conversation.as_ref())
            .and_then(render_history)
        {
            sections.push(history);
        }
        sections.push(format!("## Request\n{}", request.prompt.trim()));

        vec![
            ChatMessage::system(self.system_prompt(request.is_edit)),
            ChatMessage::user(sections.join("\n\n")),
        ]
    }

    /// Only the path, the original request and the instruction.
    pub fn recovery_messages(&self, path: &str, original_request: &str) -> Vec<ChatMessage> {
        let text = self
            .render(RECOVERY, &[("path", path), ("request", original_request.trim())])
            .unwrap_or_else(|| {
                format!(
                    "Return the complete content of {} for this request:\n{}",
                    path, original_request
                )
            });
        vec![ChatMessage::user(text)]
    }

    fn overlay_from_dir(prompts: &mut HashMap<String, String>, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(content) = std::fs::read_to_string(&path) {
                tracing::debug!("Prompt override loaded: {}", path.display());
                prompts.insert(stem.to_string(), content);
            }
        }
    }
}

fn render_files(files: &[(String, String)]) -> String {
    let mut out = String::from("## Current files");
    for (path, content) in files {
        out.push_str(&format!("\n<file path=\"{}\">\n{}\n</file>", path, content.trim_end()));
    }
    out
}

fn render_history(conversation: &Conversation) -> Option<String> {
    let mut lines = Vec::new();

    let skip = conversation.messages.len().saturating_sub(HISTORY_MESSAGES);
    for msg in conversation.messages.iter().skip(skip) {
        lines.push(format!("{}: {}", msg.role, msg.content.trim()));
    }

    let skip = conversation.edits.len().saturating_sub(HISTORY_EDITS);
    let edits: Vec<String> = conversation
        .edits
        .iter()
        .skip(skip)
        .map(|edit| {
            if edit.target_files.is_empty() {
                format!("- {}", edit.prompt.trim())
            } else {
                format!("- {} ({})", edit.prompt.trim(), edit.target_files.join(", "))
            }
        })
        .collect();

    if lines.is_empty() && edits.is_empty() {
        return None;
    }
    let mut out = String::from("## Recent conversation");
    if !lines.is_empty() {
        out.push('\n');
        out.push_str(&lines.join("\n"));
    }
    if !edits.is_empty() {
        out.push_str("\n\nRecent edits:\n");
        out.push_str(&edits.join("\n"));
    }
    Some(out)
}

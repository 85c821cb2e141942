use super::events::{CompletePayload, ProgressEvent};
use super::extractor::{extract_files, FileBlockExtractor};
use super::packages::PackageCollector;
use super::scanner::TagScanner;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

static EXPLANATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<explanation>(.*?)</explanation>").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Script,
    Style,
    Data,
    Markup,
    Text,
}

impl FileKind {
    pub fn from_path(path: &str) -> Self {
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let ext = match file_name.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Self::Text,
        };
        match ext.as_str() {
            "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Self::Script,
            "css" | "scss" | "sass" | "less" => Self::Style,
            "json" => Self::Data,
            "html" | "htm" => Self::Markup,
            _ => Self::Text,
        }
    }

    pub fn is_source(&self) -> bool {
        matches!(self, Self::Script)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Streaming,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
    pub kind: FileKind,
    pub status: FileStatus,
    /// The path had already been written earlier in this session.
    pub edited: bool,
}

impl FileBlock {
    pub fn complete(path: &str, content: &str) -> Self {
        Self {
            path: path.to_string(),
            content: content.trim().to_string(),
            kind: FileKind::from_path(path),
            status: FileStatus::Complete,
            edited: false,
        }
    }

    pub fn streaming(path: &str, content: &str) -> Self {
        Self {
            status: FileStatus::Streaming,
            ..Self::complete(path, content)
        }
    }

    pub fn file_stem(&self) -> &str {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        name.split_once('.').map(|(stem, _)| stem).unwrap_or(name)
    }

    pub fn is_component(&self) -> bool {
        self.path.contains("components/")
    }

    pub fn is_app_entry(&self) -> bool {
        matches!(self.file_stem(), "App" | "main" | "index") && self.kind.is_source()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    Replaced,
}

/// Path-keyed file blocks in first-seen order. Later writes replace earlier
/// ones in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMap {
    blocks: Vec<FileBlock>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&FileBlock> {
        self.blocks.iter().find(|b| b.path == path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Insert or replace. Returns `None` when an identical block is already
    /// present, which is not counted as a write.
    pub fn upsert(&mut self, mut block: FileBlock) -> Option<WriteOutcome> {
        match self.blocks.iter_mut().find(|b| b.path == block.path) {
            Some(existing) if existing.content == block.content => None,
            Some(existing) => {
                block.edited = true;
                *existing = block;
                Some(WriteOutcome::Replaced)
            }
            None => {
                self.blocks.push(block);
                Some(WriteOutcome::Created)
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileBlock> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// A structural finding from the truncation audit. Session-level findings
/// carry no path and are never acted on by recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TruncationWarning {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl TruncationWarning {
    pub fn session(message: impl Into<String>) -> Self {
        Self {
            path: None,
            message: message.into(),
        }
    }

    pub fn file(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: Some(path.to_string()),
            message: message.into(),
        }
    }
}

/// State of one generation request. Fed chunk by chunk; every call returns
/// the progress events caused by that chunk, in order.
#[derive(Debug)]
pub struct GenerationSession {
    pub accumulated_text: String,
    pub is_edit_mode: bool,
    /// Provider-prefixed id of the model that produced the stream.
    pub model_id: String,
    pub files: FileMap,
    pub packages: PackageCollector,
    pub warnings: Vec<String>,
    scanner: TagScanner,
    extractor: FileBlockExtractor,
    components_seen: usize,
}

impl GenerationSession {
    pub fn new(is_edit_mode: bool, model_id: impl Into<String>, builtin_packages: Vec<String>) -> Self {
        Self {
            accumulated_text: String::new(),
            is_edit_mode,
            model_id: model_id.into(),
            files: FileMap::new(),
            packages: PackageCollector::new(builtin_packages),
            warnings: Vec::new(),
            scanner: TagScanner::new(),
            extractor: FileBlockExtractor::new(),
            components_seen: 0,
        }
    }

    pub fn push_chunk(&mut self, chunk: &str) -> Vec<ProgressEvent> {
        let mut events = vec![ProgressEvent::raw(chunk)];
        self.accumulated_text.push_str(chunk);

        for text in self.scanner.push(chunk) {
            events.push(ProgressEvent::Conversation { text });
        }

        if self.is_edit_mode {
            for name in self.packages.scan_declarations(&self.accumulated_text) {
                events.push(package_event(name));
            }
        }

        for completed in self.extractor.update(&self.accumulated_text, &mut self.files) {
            if self.is_edit_mode {
                for name in self.packages.scan_imports(&completed.content) {
                    events.push(package_event(name));
                }
            }
            if completed.outcome != WriteOutcome::Created {
                continue;
            }
            let Some(block) = self.files.get(&completed.path) else {
                continue;
            };
            if block.is_component() {
                self.components_seen += 1;
                events.push(ProgressEvent::Component {
                    name: block.file_stem().to_string(),
                    path: block.path.clone(),
                    index: self.components_seen,
                });
            } else if block.is_app_entry() {
                events.push(ProgressEvent::App {
                    message: format!("Generated {}", block.path),
                    path: block.path.clone(),
                });
            }
        }

        events
    }

    /// The file currently being streamed, if any.
    pub fn current_file(&self) -> Option<FileBlock> {
        self.extractor.current_file(&self.accumulated_text, &self.files)
    }

    /// Flush narration still buffered when the stream ends.
    pub fn finish_stream(&mut self) -> Vec<ProgressEvent> {
        self.scanner
            .finish()
            .map(|text| vec![ProgressEvent::Conversation { text }])
            .unwrap_or_default()
    }

    /// Swap in repaired text and rebuild the file map from it. In edit mode,
    /// imports of the rebuilt files are rescanned.
    pub fn replace_text(&mut self, text: String) -> Vec<ProgressEvent> {
        self.accumulated_text = text;
        self.files = extract_files(&self.accumulated_text);

        let mut events = Vec::new();
        if self.is_edit_mode {
            let contents: Vec<String> = self.files.iter().map(|b| b.content.clone()).collect();
            for content in contents {
                for name in self.packages.scan_imports(&content) {
                    events.push(package_event(name));
                }
            }
        }
        events
    }

    pub fn explanation(&self) -> String {
        EXPLANATION_RE
            .captures(&self.accumulated_text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default()
    }

    pub fn complete_payload(&self) -> CompletePayload {
        let packages = self.packages.packages();
        CompletePayload {
            generated_code: self.accumulated_text.clone(),
            explanation: self.explanation(),
            files: self.files.len(),
            components: self.files.iter().filter(|b| b.is_component()).count(),
            model: self.model_id.clone(),
            packages_to_install: (self.is_edit_mode && !packages.is_empty()).then(|| packages.to_vec()),
            warnings: (!self.warnings.is_empty()).then(|| self.warnings.clone()),
        }
    }
}

fn package_event(name: String) -> ProgressEvent {
    ProgressEvent::Package {
        message: format!("Package detected: {}", name),
        name,
    }
}

//! Incremental `<file path="…">…</file>` extraction over the growing stream
//! buffer.

use super::session::{FileBlock, FileMap, WriteOutcome};
use regex::Regex;
use std::sync::LazyLock;

static COMPLETE_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<file path="([^"]+)">(.*?)</file>"#).unwrap());

static OPEN_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<file path="([^"]+)">"#).unwrap());

/// A file block that reached `complete` during an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub path: String,
    /// Content as written by this block. A later block for the same path in
    /// the same update may already have replaced it in the map.
    pub content: String,
    pub outcome: WriteOutcome,
}

/// Remembers how far the buffer has been consumed so each complete block is
/// applied exactly once, in stream order.
#[derive(Debug, Default, Clone)]
pub struct FileBlockExtractor {
    consumed: usize,
}

impl FileBlockExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply every complete block that appeared since the last call.
    pub fn update(&mut self, text: &str, files: &mut FileMap) -> Vec<CompletedFile> {
        let Some(unconsumed) = text.get(self.consumed..) else {
            return Vec::new();
        };
        let mut completed = Vec::new();
        let mut last_end = None;

        for caps in COMPLETE_FILE_RE.captures_iter(unconsumed) {
            let (Some(whole), Some(path), Some(body)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            last_end = Some(whole.end());
            let block = FileBlock::complete(path.as_str(), body.as_str());
            let content = block.content.clone();
            if let Some(outcome) = files.upsert(block) {
                completed.push(CompletedFile {
                    path: path.as_str().to_string(),
                    content,
                    outcome,
                });
            }
        }

        if let Some(end) = last_end {
            self.consumed += end;
        }
        completed
    }

    /// The trailing block still being streamed, if its path has not already
    /// completed. Never stored in the file map.
    pub fn current_file(&self, text: &str, files: &FileMap) -> Option<FileBlock> {
        let unconsumed = text.get(self.consumed..)?;
        let caps = OPEN_FILE_RE.captures_iter(unconsumed).last()?;
        let (whole, path) = (caps.get(0)?, caps.get(1)?);
        let body = &unconsumed[whole.end()..];
        if body.contains("</file>") || files.contains(path.as_str()) {
            return None;
        }
        Some(FileBlock::streaming(path.as_str(), body))
    }
}

/// One-shot extraction of every complete block in `text`.
pub fn extract_files(text: &str) -> FileMap {
    let mut files = FileMap::new();
    FileBlockExtractor::new().update(text, &mut files);
    files
}

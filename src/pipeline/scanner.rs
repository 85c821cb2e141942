//! Chunk-oblivious classifier separating narration from tagged payload.
//!
//! Any text outside a recognized tag is collected as narration and flushed
//! as one conversational unit when the next tag opens. A marker split across
//! chunk boundaries is held back until it can be classified, so the sequence
//! of flushed segments does not depend on how the stream was chunked.

use regex::Regex;
use std::sync::LazyLock;

/// Tags whose content is machine payload rather than narration.
pub const TAG_VOCABULARY: &[&str] = &[
    "file",
    "package",
    "packages",
    "explanation",
    "command",
    "structure",
    "template",
];

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    let names = TAG_VOCABULARY.join("|");
    Regex::new(&format!(r"<(/?)({names})(?:\s[^>]*)?>|<({names})\s")).unwrap()
});

/// Longest text that can still turn into a marker once more input arrives.
fn max_pending_len() -> usize {
    TAG_VOCABULARY.iter().map(|t| t.len()).max().unwrap_or(0) + 3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Open,
    Close,
}

#[derive(Debug, Default, Clone)]
pub struct TagScanner {
    in_tag: bool,
    conversational_buffer: String,
    /// Unclassified tail of the previous chunk (a possible partial marker).
    carry: String,
}

impl TagScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns every narration segment flushed by a tag
    /// opening inside this chunk, in stream order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(chunk);

        let mut flushed = Vec::new();
        let mut cursor = 0;

        for caps in MARKER_RE.captures_iter(&text) {
            let Some(whole) = caps.get(0) else { continue };
            let marker = if caps.get(1).is_some_and(|m| m.as_str() == "/") {
                Marker::Close
            } else {
                Marker::Open
            };

            if !self.in_tag {
                self.conversational_buffer
                    .push_str(&text[cursor..whole.start()]);
            }
            match marker {
                Marker::Open => {
                    if let Some(segment) = self.flush() {
                        flushed.push(segment);
                    }
                    self.in_tag = true;
                }
                Marker::Close => {
                    self.in_tag = false;
                }
            }
            cursor = whole.end();
        }

        let rest = &text[cursor..];
        let hold = partial_marker_start(rest);
        if !self.in_tag {
            self.conversational_buffer.push_str(&rest[..hold]);
        }
        self.carry = rest[hold..].to_string();

        flushed
    }

    /// Flush whatever narration is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        let carry = std::mem::take(&mut self.carry);
        if !self.in_tag {
            self.conversational_buffer.push_str(&carry);
        }
        self.flush()
    }

    fn flush(&mut self) -> Option<String> {
        let segment = std::mem::take(&mut self.conversational_buffer);
        let trimmed = segment.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Byte offset in `rest` from which the text may be an incomplete marker.
/// Returns `rest.len()` when nothing needs to be held back.
fn partial_marker_start(rest: &str) -> usize {
    let Some(lt) = rest.rfind('<') else {
        return rest.len();
    };
    let tail = &rest[lt..];
    if tail.len() > max_pending_len() || tail.contains('>') {
        return rest.len();
    }
    if could_become_marker(tail) {
        lt
    } else {
        rest.len()
    }
}

fn could_become_marker(tail: &str) -> bool {
    let body = tail.strip_prefix('<').unwrap_or(tail);
    let (closing, name) = match body.strip_prefix('/') {
        Some(name) => (true, name),
        None => (false, body),
    };
    TAG_VOCABULARY.iter().any(|tag| {
        if tag.starts_with(name) {
            return true;
        }
        // `<file path="...` without its `>` yet.
        !closing
            && name.len() > tag.len()
            && name.starts_with(tag)
            && name[tag.len()..].starts_with(char::is_whitespace)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(chunks: &[&str]) -> (Vec<String>, bool) {
        let mut scanner = TagScanner::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(scanner.push(chunk));
        }
        out.extend(scanner.finish());
        (out, scanner.in_tag)
    }

    #[test]
    fn narration_before_tag_is_flushed_on_open() {
        let (segments, in_tag) =
            scan_all(&["I'll add a button.\n<file path=\"a.jsx\">x</file>"]);
        assert_eq!(segments, vec!["I'll add a button.".to_string()]);
        assert!(!in_tag);
    }

    #[test]
    fn marker_split_across_chunks_is_recognized() {
        let (segments, _) = scan_all(&[
            "Planning the layout. <fi",
            "le path=\"src/App.jsx\">body</fi",
            "le>",
        ]);
        assert_eq!(segments, vec!["Planning the layout.".to_string()]);
    }

    #[test]
    fn payload_inside_tags_is_not_narration() {
        let (segments, _) = scan_all(&[
            "<explanation>Added a button.</explanation>",
            "<package>zustand</package>",
        ]);
        assert!(segments.is_empty());
    }

    #[test]
    fn trailing_narration_is_flushed_on_finish() {
        let (segments, _) = scan_all(&["<file path=\"a.js\">1</file>\nAll done", " now."]);
        assert_eq!(segments, vec!["All done now.".to_string()]);
    }

    #[test]
    fn non_vocabulary_angle_brackets_stay_in_narration() {
        let (segments, _) = scan_all(&["Use a <div> wrapper and x < y", "<file path=\"a\">"]);
        assert_eq!(segments, vec!["Use a <div> wrapper and x < y".to_string()]);
    }

    #[test]
    fn unmatched_closing_marker_is_tolerated() {
        let (segments, in_tag) = scan_all(&["stray </file> text <command>npm i</command>"]);
        assert_eq!(segments, vec!["stray  text".to_string()]);
        assert!(!in_tag);
    }

    #[test]
    fn every_split_point_yields_same_segments() {
        let input = "Intro text.\n<file path=\"src/components/Btn.jsx\">a</file>\nMiddle\n<packages>\nreact-icons\n</packages>tail";
        let (expected, _) = scan_all(&[input]);
        for split in 1..input.len() {
            if !input.is_char_boundary(split) {
                continue;
            }
            let (got, _) = scan_all(&[&input[..split], &input[split..]]);
            assert_eq!(got, expected, "split at {split}");
        }
    }
}

//! Post-stream structural checks for files that were likely cut off.
//!
//! The rule set is closed and conservative. Every finding may cost a
//! recovery call, so a missed truncation is preferred over a false alarm.

use super::session::{FileKind, TruncationWarning};
use regex::Regex;
use std::sync::LazyLock;

pub const FILE_OPEN_PATTERN: &str = "<file path=\"";
pub const FILE_CLOSE_PATTERN: &str = "</file>";

/// Captures a file region up to its closing tag, or to the end of the text
/// when the tag never closed.
static FILE_REGION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<file path="([^"]+)">(.*?)(?:</file>|\z)"#).unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditThresholds {
    /// Unmatched brace difference tolerated before flagging.
    pub brace_tolerance: usize,
    /// Source files shorter than this (in chars) are checked for a bare
    /// `function` with no body.
    pub short_file_chars: usize,
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self {
            brace_tolerance: 3,
            short_file_chars: 20,
        }
    }
}

/// Raw region captured for one `<file>` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRegion<'a> {
    pub path: &'a str,
    pub content: &'a str,
    pub closed: bool,
}

pub fn file_regions(text: &str) -> Vec<FileRegion<'_>> {
    FILE_REGION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(FileRegion {
                path: caps.get(1)?.as_str(),
                content: caps.get(2)?.as_str(),
                closed: whole.as_str().ends_with(FILE_CLOSE_PATTERN),
            })
        })
        .collect()
}

pub fn audit(text: &str, thresholds: &AuditThresholds) -> Vec<TruncationWarning> {
    let mut warnings = Vec::new();

    let opened = text.matches(FILE_OPEN_PATTERN).count();
    let closed = text.matches(FILE_CLOSE_PATTERN).count();
    if opened != closed {
        warnings.push(TruncationWarning::session(format!(
            "File tag mismatch: {opened} open, {closed} closed"
        )));
    }

    for region in file_regions(text) {
        warnings.extend(audit_region(&region, thresholds));
    }
    warnings
}

fn audit_region(region: &FileRegion<'_>, thresholds: &AuditThresholds) -> Vec<TruncationWarning> {
    let mut warnings = Vec::new();
    let path = region.path;
    let trailing = region.content.trim_end();

    if trailing.ends_with('<') || trailing.ends_with("</") {
        warnings.push(TruncationWarning::file(
            path,
            format!("File {path} appears to end with incomplete HTML tags"),
        ));
    }

    if !FileKind::from_path(path).is_source() {
        return warnings;
    }

    let content = region.content.trim();
    let open_braces = content.matches('{').count();
    let close_braces = content.matches('}').count();
    if open_braces.abs_diff(close_braces) > thresholds.brace_tolerance {
        warnings.push(TruncationWarning::file(
            path,
            format!(
                "File {path} has severely unmatched braces ({open_braces} open, {close_braces} closed)"
            ),
        ));
    }

    if content.chars().count() < thresholds.short_file_chars
        && content.contains("function")
        && !content.contains('}')
    {
        warnings.push(TruncationWarning::file(
            path,
            format!("File {path} appears severely truncated"),
        ));
    }

    warnings
}

/// Distinct paths with at least one per-file finding, in first-flagged order.
pub fn flagged_paths(warnings: &[TruncationWarning]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for path in warnings.iter().filter_map(|w| w.path.as_ref()) {
        if !paths.contains(path) {
            paths.push(path.clone());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(text: &str) -> Vec<TruncationWarning> {
        audit(text, &AuditThresholds::default())
    }

    #[test]
    fn well_formed_output_has_no_findings() {
        let text = "<file path=\"src/App.jsx\">export default function App() { return <div>{x}</div>; }</file>";
        assert!(run(text).is_empty());
    }

    #[test]
    fn tag_count_mismatch_is_one_session_warning() {
        let text = "<file path=\"a.css\">body {}</file><file path=\"b.css\">p {}";
        let warnings = run(text);
        let session: Vec<_> = warnings.iter().filter(|w| w.path.is_none()).collect();
        assert_eq!(session.len(), 1);
        assert!(session[0].message.contains("2 open, 1 closed"));
    }

    #[test]
    fn small_brace_difference_is_tolerated() {
        let text = "<file path=\"a.js\">const s = `${a} {{`; function f() { if (x) { y(); }</file>";
        assert!(run(text).is_empty());
    }

    #[test]
    fn large_brace_difference_is_flagged_once() {
        let body = "{ { { { { { { { } } }";
        let text = format!("<file path=\"src/Big.jsx\">{body}</file>");
        let warnings = run(&text);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].path.as_deref(), Some("src/Big.jsx"));
        assert!(warnings[0].message.contains("8 open, 3 closed"));
    }

    #[test]
    fn brace_rule_ignores_non_source_files() {
        let text = "<file path=\"a.css\">{{{{{{{{</file>";
        assert!(run(text).is_empty());
    }

    #[test]
    fn dangling_tag_opener_is_flagged() {
        let text = "<file path=\"index.html\"><html><body></";
        let warnings = run(text);
        assert!(warnings.iter().any(|w| w.path.as_deref() == Some("index.html")
            && w.message.contains("incomplete HTML tags")));
        assert!(warnings.iter().any(|w| w.path.is_none()));
    }

    #[test]
    fn short_bodiless_function_is_flagged() {
        let text = "<file path=\"a.js\">function f(</file>";
        let warnings = run(text);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("severely truncated"));
    }

    #[test]
    fn ellipsis_and_spread_are_not_findings() {
        let text = "<file path=\"a.jsx\">const b = { ...a }; const msg = 'Loading...';</file>";
        assert!(run(text).is_empty());
    }

    #[test]
    fn unclosed_final_region_is_captured() {
        let regions = file_regions("<file path=\"a.js\">x</file><file path=\"b.js\">partial");
        assert_eq!(regions.len(), 2);
        assert!(regions[0].closed);
        assert_eq!(regions[1].path, "b.js");
        assert_eq!(regions[1].content, "partial");
        assert!(!regions[1].closed);
    }

    #[test]
    fn flagged_paths_are_distinct() {
        let warnings = vec![
            TruncationWarning::session("x"),
            TruncationWarning::file("a.js", "1"),
            TruncationWarning::file("b.js", "2"),
            TruncationWarning::file("a.js", "3"),
        ];
        assert_eq!(flagged_paths(&warnings), vec!["a.js", "b.js"]);
    }
}

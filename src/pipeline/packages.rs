//! Dependency names from `<package>` / `<packages>` tags and from import
//! statements of completed files.

use regex::Regex;
use std::sync::LazyLock;

static PACKAGE_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<package>(.*?)</package>").unwrap());

static PACKAGES_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<packages>(.*?)</packages>").unwrap());

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?:\bimport\s+(?:[\w*$\s{},]+?\s+from\s+)?|\bexport\s+[\w*$\s{},]+?\s+from\s+|\brequire\s*\(\s*|\bimport\s*\(\s*)['"]([^'"\n]+)['"]"#,
    )
    .unwrap()
});

/// Ordered, de-duplicated set of collected package names.
#[derive(Debug, Clone, Default)]
pub struct PackageCollector {
    packages: Vec<String>,
    builtins: Vec<String>,
    package_tag_offset: usize,
    packages_tag_offset: usize,
}

impl PackageCollector {
    pub fn new(builtins: Vec<String>) -> Self {
        Self {
            builtins,
            ..Self::default()
        }
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// Collect names declared by tags that closed since the last call.
    /// Returns only the names that were not seen before.
    pub fn scan_declarations(&mut self, text: &str) -> Vec<String> {
        let mut found = Vec::new();

        let (names, offset) = scan_tags(&PACKAGE_TAG_RE, text, self.package_tag_offset);
        self.package_tag_offset = offset;
        found.extend(names);

        let (names, offset) = scan_tags(&PACKAGES_TAG_RE, text, self.packages_tag_offset);
        self.packages_tag_offset = offset;
        found.extend(names);

        found
            .into_iter()
            .filter_map(|name| self.insert(&name))
            .collect()
    }

    /// Collect names imported by a completed file's content.
    pub fn scan_imports(&mut self, content: &str) -> Vec<String> {
        let specifiers: Vec<String> = IMPORT_RE
            .captures_iter(content)
            .filter_map(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .collect();
        let names: Vec<String> = specifiers
            .iter()
            .filter_map(|spec| package_name_from_specifier(spec))
            .filter(|name| !self.builtins.iter().any(|b| b == name))
            .collect();
        names.into_iter().filter_map(|name| self.insert(&name)).collect()
    }

    fn insert(&mut self, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() || self.packages.iter().any(|p| p == name) {
            return None;
        }
        self.packages.push(name.to_string());
        Some(name.to_string())
    }
}

/// Names from every tag match in `text[offset..]`, plus the offset after the
/// last match.
fn scan_tags(re: &Regex, text: &str, offset: usize) -> (Vec<String>, usize) {
    let Some(unconsumed) = text.get(offset..) else {
        return (Vec::new(), offset);
    };
    let mut names = Vec::new();
    let mut next_offset = offset;
    for caps in re.captures_iter(unconsumed) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        next_offset = offset + whole.end();
        names.extend(
            body.as_str()
                .split(|c| c == ',' || c == '\n')
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        );
    }
    (names, next_offset)
}

/// Package name for an import specifier, or `None` for local and alias
/// paths. Scoped packages keep their scope segment.
pub fn package_name_from_specifier(spec: &str) -> Option<String> {
    let spec = spec.trim();
    if spec.is_empty() || spec.starts_with('.') || spec.starts_with('/') || spec.starts_with("@/")
    {
        return None;
    }
    let mut segments = spec.split('/');
    let first = segments.next()?;
    if first.starts_with('@') {
        let second = segments.next().filter(|s| !s.is_empty())?;
        Some(format!("{first}/{second}"))
    } else {
        Some(first.to_string())
    }
}

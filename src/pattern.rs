//! Exclusion pattern compiler and matcher.
//!
//! A specification is either one inline pattern or the path of a side file
//! holding one pattern per line (`#` comments and blank lines skipped); file
//! patterns are OR-ed together. Each pattern splits into an optional module
//! qualifier and a path glob where `*` matches any run of characters,
//! separators included, and every other character (including `$`) is
//! literal. Matching is over the full entry path, not component-by-component.

use std::fs;
use std::path::Path;

use crate::error::LinkError;
use crate::pool::Resource;

/// One compiled exclusion pattern.
#[derive(Debug, Clone)]
struct ExcludePattern {
    /// Entries must belong to this module when present.
    module: Option<String>,
    /// Glob applied to the entry path.
    glob: String,
}

impl ExcludePattern {
    /// Compile one raw pattern.
    ///
    /// A leading `/segment/` whose segment is non-empty and wildcard-free is
    /// a module qualifier; the remainder (with its `/`) is the glob. In
    /// every other case the whole string is the glob.
    fn compile(raw: &str) -> Result<Self, LinkError> {
        if raw.is_empty() {
            return Err(LinkError::Pattern("empty pattern".to_string()));
        }
        if let Some(body) = raw.strip_prefix('/') {
            if let Some(idx) = body.find('/') {
                let prefix = &body[..idx];
                if !prefix.is_empty() && !prefix.contains('*') {
                    return Ok(Self {
                        module: Some(prefix.to_string()),
                        glob: body[idx..].to_string(),
                    });
                }
            }
        }
        Ok(Self {
            module: None,
            glob: raw.to_string(),
        })
    }

    fn matches(&self, module: &str, path: &str) -> bool {
        if let Some(qualifier) = &self.module {
            if qualifier != module {
                return false;
            }
        }
        wildcard_match(&self.glob, path)
    }
}

/// A set of compiled patterns; an entry is excluded when any pattern
/// matches it.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<ExcludePattern>,
}

impl PatternSet {
    /// Compile a specification. When `spec` names an existing file, its
    /// line-delimited contents become independent patterns; otherwise `spec`
    /// itself is the single pattern.
    pub fn parse(spec: &str) -> Result<Self, LinkError> {
        let candidate = Path::new(spec);
        if candidate.is_file() {
            let text = fs::read_to_string(candidate).map_err(|e| {
                LinkError::Pattern(format!("reading pattern file '{spec}': {e}"))
            })?;
            return Self::parse_lines(&text, spec);
        }
        Ok(Self {
            patterns: vec![ExcludePattern::compile(spec)?],
        })
    }

    fn parse_lines(text: &str, origin: &str) -> Result<Self, LinkError> {
        let mut patterns = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            patterns.push(ExcludePattern::compile(line)?);
        }
        if patterns.is_empty() {
            return Err(LinkError::Pattern(format!(
                "pattern file '{origin}' holds no patterns"
            )));
        }
        Ok(Self { patterns })
    }

    /// Whether any pattern matches the given identity.
    pub fn matches(&self, module: &str, path: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(module, path))
    }

    /// Whether any pattern matches the entry.
    pub fn matches_resource(&self, resource: &Resource) -> bool {
        self.matches(resource.module(), resource.path())
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Full-string glob match where `*` matches any run of characters
/// (separators included) and everything else is literal.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }
    let first = parts[0];
    let last = parts[parts.len() - 1];
    if !text.starts_with(first) || !text.ends_with(last) {
        return false;
    }
    let mut pos = first.len();
    let end = text.len() - last.len();
    if pos > end {
        return false;
    }
    for mid in &parts[1..parts.len() - 1] {
        if mid.is_empty() {
            continue;
        }
        match text[pos..end].find(mid) {
            Some(found) => pos += found + mid.len(),
            None => return false,
        }
    }
    true
}

//! Include/exclude filtering of scanned paths.
//!
//! Patterns use standard glob syntax (`**`, `{a,b}`, `[abc]`) and are matched
//! against the `/`-separated path relative to the scan root. An exclude match
//! always wins over an include match.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::DmeError;

/// Always excluded so the uploader never ships its own logs.
pub const TOOL_LOG_PATTERN: &str = "**/dme-upload*.log";
/// Metadata description files are read for their entity, never registered themselves.
pub const SIDECAR_PATTERN: &str = "**/*.metadata.json";

#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    include_set: Option<GlobSet>,
    exclude_set: Option<GlobSet>,
}

impl PathFilter {
    /// A filter that matches everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_patterns(include: Vec<String>, exclude: Vec<String>) -> Result<Self, DmeError> {
        let include_set = compile(&include)?;
        let exclude_set = compile(&exclude)?;
        Ok(Self {
            include,
            exclude,
            include_set,
            exclude_set,
        })
    }

    /// Like [`PathFilter::with_patterns`] with tool logs and sidecar files appended to the excludes.
    pub fn for_scan(include: Vec<String>, mut exclude: Vec<String>) -> Result<Self, DmeError> {
        for builtin in [TOOL_LOG_PATTERN, SIDECAR_PATTERN] {
            if !exclude.iter().any(|pattern| pattern == builtin) {
                exclude.push(builtin.to_string());
            }
        }
        Self::with_patterns(include, exclude)
    }

    /// Whether a file at `path` should be kept.
    pub fn matches(&self, path: &str) -> bool {
        let included = match &self.include_set {
            Some(set) => set.is_match(path),
            None => true,
        };
        included && !self.is_excluded(path)
    }

    /// Directories bypass include patterns but still honour excludes.
    pub fn is_excluded(&self, path: &str) -> bool {
        match &self.exclude_set {
            Some(set) => set.is_match(path),
            None => false,
        }
    }

    pub fn include_patterns(&self) -> &[String] {
        &self.include
    }

    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude
    }
}

fn compile(patterns: &[String]) -> Result<Option<GlobSet>, DmeError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| DmeError::InvalidGlobPattern {
            pattern: pattern.clone(),
            reason: err.to_string(),
        })?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|err| DmeError::InvalidGlobPattern {
            pattern: patterns.join(", "),
            reason: err.to_string(),
        })?;
    Ok(Some(set))
}

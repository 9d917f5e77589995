//! Inventory of the local source tree.
//!
//! The scanner produces the complete, sorted list of [`PathEntry`] values
//! before anything is registered. Symbolic links are never followed; a link
//! is reported in the debug log and left out of the inventory. Names that are
//! not valid UTF-8 are logged as warnings and skipped.

use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::domain::PathEntry;
use crate::error::DmeError;
use crate::glob::PathFilter;

#[derive(Debug, Clone, Default)]
pub struct PathScanner {
    filter: PathFilter,
}

impl PathScanner {
    pub fn new(filter: PathFilter) -> Self {
        Self { filter }
    }

    /// Walks `root` and returns every kept entry, directories ahead of their contents.
    pub fn scan(&self, root: &Path) -> Result<Vec<PathEntry>, DmeError> {
        ensure_readable_dir(root)?;

        let mut entries = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|dent| {
                if !dent.file_type().is_dir() {
                    return true;
                }
                match relative_utf8(root, dent.path()) {
                    Ok(rel) => !self.filter.is_excluded(rel.as_str()),
                    Err(err) => {
                        warn!(error = %err, "skipping directory");
                        false
                    }
                }
            });

        for dent in walker {
            let dent = dent.map_err(|err| {
                DmeError::Filesystem(format!("scan of {} failed: {err}", root.display()))
            })?;
            let file_type = dent.file_type();
            if file_type.is_symlink() {
                debug!(path = %dent.path().display(), "skipping symbolic link");
                continue;
            }
            let relative = match relative_utf8(root, dent.path()) {
                Ok(relative) => relative,
                Err(err) => {
                    warn!(error = %err, "skipping entry");
                    continue;
                }
            };
            if !file_type.is_dir() && !self.filter.matches(relative.as_str()) {
                debug!(path = %relative, "excluded by pattern");
                continue;
            }
            let metadata = dent
                .metadata()
                .map_err(|err| DmeError::Filesystem(err.to_string()))?;
            entries.push(build_entry(dent.path(), relative, &metadata));
        }

        finish(entries)
    }

    /// Builds the inventory from an explicit list of paths relative to `root`.
    pub fn scan_file_list(&self, root: &Path, list: &Path) -> Result<Vec<PathEntry>, DmeError> {
        ensure_readable_dir(root)?;
        let lines = read_list_file(list)?;

        let mut entries = Vec::new();
        for line in lines {
            let relative = Utf8PathBuf::from(line.trim_start_matches("./").trim_start_matches('/'));
            let absolute = root.join(relative.as_std_path());
            let metadata = fs::symlink_metadata(&absolute)
                .map_err(|_| DmeError::SourceNotFound(absolute.clone()))?;
            if metadata.file_type().is_symlink() {
                debug!(path = %absolute.display(), "skipping symbolic link");
                continue;
            }
            let kept = if metadata.is_dir() {
                !self.filter.is_excluded(relative.as_str())
            } else {
                self.filter.matches(relative.as_str())
            };
            if !kept {
                debug!(path = %relative, "excluded by pattern");
                continue;
            }
            entries.push(build_entry(&absolute, relative, &metadata));
        }

        finish(entries)
    }
}

/// Reads a newline-delimited list, skipping blank lines and `#` comments.
pub fn read_list_file(path: &Path) -> Result<Vec<String>, DmeError> {
    let content = fs::read_to_string(path).map_err(|err| DmeError::ListRead {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Reads an optional pattern file; a missing setting means no patterns.
pub fn read_patterns(path: Option<&Path>) -> Result<Vec<String>, DmeError> {
    match path {
        Some(path) => read_list_file(path),
        None => Ok(Vec::new()),
    }
}

pub fn total_file_bytes(entries: &[PathEntry]) -> u64 {
    entries
        .iter()
        .filter(|entry| !entry.is_directory)
        .map(|entry| entry.size_bytes)
        .sum()
}

fn ensure_readable_dir(root: &Path) -> Result<(), DmeError> {
    let metadata = fs::metadata(root).map_err(|_| DmeError::SourceNotFound(root.to_path_buf()))?;
    if !metadata.is_dir() {
        return Err(DmeError::SourceNotFound(root.to_path_buf()));
    }
    fs::read_dir(root).map_err(|_| DmeError::SourceNotFound(root.to_path_buf()))?;
    Ok(())
}

fn relative_utf8(root: &Path, path: &Path) -> Result<Utf8PathBuf, DmeError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| DmeError::Filesystem(format!("{} escapes scan root", path.display())))?;
    Utf8PathBuf::from_path_buf(relative.to_path_buf())
        .map_err(|_| DmeError::Filesystem(format!("non-utf8 path {}", path.display())))
}

fn build_entry(path: &Path, relative: Utf8PathBuf, metadata: &fs::Metadata) -> PathEntry {
    let name = relative
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| relative.to_string());
    let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);
    PathEntry {
        name,
        relative_path: relative,
        absolute_path: PathBuf::from(path),
        is_directory: metadata.is_dir(),
        size_bytes: if metadata.is_dir() { 0 } else { metadata.len() },
        last_modified,
    }
}

fn finish(mut entries: Vec<PathEntry>) -> Result<Vec<PathEntry>, DmeError> {
    entries.sort();
    entries.dedup_by(|a, b| a.relative_path == b.relative_path);
    let dirs = entries.iter().filter(|e| e.is_directory).count();
    info!(
        entries = entries.len(),
        directories = dirs,
        files = entries.len() - dirs,
        aggregate_bytes = total_file_bytes(&entries),
        "scan complete"
    );
    Ok(entries)
}

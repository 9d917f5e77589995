use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::DmeError;

pub const COLLECTION_TYPE: &str = "collection_type";
pub const OBJECT_NAME: &str = "object_name";
pub const MODIFIED_DATE: &str = "modified_date";
pub const FOLDER: &str = "Folder";

/// Characters the archive refuses inside a destination path.
pub const FORBIDDEN_PATH_CHARS: &[char] = &['?', ';', '\\'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveType {
    Posix,
    ObjectStore,
}

impl fmt::Display for ArchiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveType::Posix => write!(f, "posix"),
            ArchiveType::ObjectStore => write!(f, "object-store"),
        }
    }
}

/// How file bytes reach the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum UploadMode {
    /// Registration request and file body travel in one multipart call.
    Inline,
    /// The archive hands out a presigned URL and the bytes go straight to storage.
    UploadUrl,
}

impl fmt::Display for UploadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadMode::Inline => write!(f, "inline"),
            UploadMode::UploadUrl => write!(f, "upload-url"),
        }
    }
}

/// Snapshot of one filesystem entry taken at scan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathEntry {
    pub name: String,
    /// Path relative to the scan root, `/`-separated.
    pub relative_path: Utf8PathBuf,
    pub absolute_path: PathBuf,
    pub is_directory: bool,
    pub size_bytes: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

impl PathEntry {
    pub fn kind(&self) -> EntityKind {
        if self.is_directory {
            EntityKind::Collection
        } else {
            EntityKind::DataObject
        }
    }

    /// Location of the sidecar description file for this entry.
    pub fn sidecar_path(&self) -> PathBuf {
        let mut raw = self.absolute_path.clone().into_os_string();
        raw.push(".metadata.json");
        PathBuf::from(raw)
    }
}

// Component-wise ordering keeps every directory ahead of its descendants.
impl Ord for PathEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.relative_path
            .components()
            .map(|c| c.as_str())
            .cmp(other.relative_path.components().map(|c| c.as_str()))
            .then_with(|| other.is_directory.cmp(&self.is_directory))
    }
}

impl PartialOrd for PathEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub attribute: String,
    pub value: String,
}

impl MetadataEntry {
    pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }
}

pub fn has_attribute(entries: &[MetadataEntry], attribute: &str) -> bool {
    entries.iter().any(|entry| entry.attribute == attribute)
}

pub fn ensure_unique_attributes(entries: &[MetadataEntry]) -> Result<(), DmeError> {
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if !seen.insert(entry.attribute.as_str()) {
            return Err(DmeError::DuplicateAttribute(entry.attribute.clone()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Collection,
    DataObject,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Collection => write!(f, "collection"),
            EntityKind::DataObject => write!(f, "data-object"),
        }
    }
}

/// One registration call against the archive. Built fresh per entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub kind: EntityKind,
    pub path: ArchivePath,
    pub metadata_entries: Vec<MetadataEntry>,
    /// Present only when parent collections should be auto-created.
    pub parent_metadata_entries: Option<Vec<MetadataEntry>>,
    pub checksum: Option<String>,
    pub generate_upload_url: bool,
    pub upload_parts: Option<u32>,
}

impl RegistrationRequest {
    pub fn collection(path: ArchivePath, metadata_entries: Vec<MetadataEntry>) -> Self {
        Self {
            kind: EntityKind::Collection,
            path,
            metadata_entries,
            parent_metadata_entries: None,
            checksum: None,
            generate_upload_url: false,
            upload_parts: None,
        }
    }

    pub fn data_object(path: ArchivePath, metadata_entries: Vec<MetadataEntry>) -> Self {
        Self {
            kind: EntityKind::DataObject,
            ..Self::collection(path, metadata_entries)
        }
    }

    pub fn with_parents(mut self, parents: Vec<MetadataEntry>) -> Self {
        self.parent_metadata_entries = Some(parents);
        self
    }

    pub fn create_parent_collections(&self) -> bool {
        self.parent_metadata_entries.is_some()
    }
}

/// A validated destination path inside the archive, always absolute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ArchivePath(Utf8PathBuf);

impl ArchivePath {
    /// Joins the destination base path and an entry's relative path.
    pub fn join(base: &str, relative: &Utf8Path) -> Result<Self, DmeError> {
        let mut path = Utf8PathBuf::from("/");
        let segments = base
            .split('/')
            .chain(relative.as_str().split('/'))
            .filter(|segment| !segment.is_empty());
        for segment in segments {
            path.push(segment);
        }
        validate_archive_path(path.as_str())?;
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    /// Path without the leading slash, as embedded in endpoint URLs.
    pub fn trimmed(&self) -> &str {
        self.0.as_str().trim_start_matches('/')
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ArchivePath {
    type Err = DmeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::join(value, Utf8Path::new(""))
    }
}

pub fn validate_archive_path(path: &str) -> Result<(), DmeError> {
    if path.chars().any(char::is_whitespace) {
        return Err(DmeError::InvalidArchivePath {
            path: path.to_string(),
            reason: "contains whitespace".to_string(),
        });
    }
    if let Some(ch) = path.chars().find(|ch| FORBIDDEN_PATH_CHARS.contains(ch)) {
        return Err(DmeError::InvalidArchivePath {
            path: path.to_string(),
            reason: format!("contains forbidden character '{ch}' (forbidden: ? ; \\)"),
        });
    }
    if path == "/" {
        return Err(DmeError::InvalidArchivePath {
            path: path.to_string(),
            reason: "archive root cannot be registered".to_string(),
        });
    }
    Ok(())
}

/// Per-run settings shared read-only by every work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCriteria {
    pub destination_base_path: String,
    pub metadata_only: bool,
    pub checksum: bool,
    pub archive_type: ArchiveType,
    pub upload_mode: UploadMode,
    pub extract_metadata: bool,
    pub metadata_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub entry: PathEntry,
    pub criteria: Arc<RunCriteria>,
}

impl WorkItem {
    pub fn new(entry: PathEntry, criteria: Arc<RunCriteria>) -> Self {
        Self { entry, criteria }
    }

    pub fn archive_path(&self) -> Result<ArchivePath, DmeError> {
        ArchivePath::join(
            &self.criteria.destination_base_path,
            &self.entry.relative_path,
        )
    }
}

/// One contiguous byte range of a multipart transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadPart {
    pub part_number: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
    pub etag: Option<String>,
}

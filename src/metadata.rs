//! Attribute/value metadata for entities and their auto-created parents.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::domain::{
    COLLECTION_TYPE, EntityKind, FOLDER, MODIFIED_DATE, MetadataEntry, OBJECT_NAME, PathEntry,
    RunCriteria, ensure_unique_attributes, has_attribute,
};
use crate::error::DmeError;

const DATE_FORMAT: &str = "%m/%d/%Y %H:%M:%S";
const MAX_LINE_COUNT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataResolution {
    Resolved(Vec<MetadataEntry>),
    /// Metadata-only run and no description file exists for the entity.
    Skip,
}

/// Sidecar files come either wrapped or as a bare list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SidecarDocument {
    Wrapped {
        #[serde(rename = "metadataEntries")]
        metadata_entries: Vec<MetadataEntry>,
    },
    Bare(Vec<MetadataEntry>),
}

impl SidecarDocument {
    fn into_entries(self) -> Vec<MetadataEntry> {
        match self {
            SidecarDocument::Wrapped { metadata_entries } => metadata_entries,
            SidecarDocument::Bare(entries) => entries,
        }
    }
}

/// Derives attribute/value pairs by looking at a file's content.
pub trait ContentExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<Vec<MetadataEntry>, DmeError>;
}

/// Extension-based type detection plus a line count for small text files.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicContentExtractor;

impl ContentExtractor for BasicContentExtractor {
    fn extract(&self, path: &Path) -> Result<Vec<MetadataEntry>, DmeError> {
        let mut entries = Vec::new();
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        if let Some(ext) = &extension {
            entries.push(MetadataEntry::new("file_extension", ext.clone()));
        }
        entries.push(MetadataEntry::new(
            "content_type",
            content_type_for(extension.as_deref()),
        ));

        let metadata = fs::metadata(path).map_err(|err| DmeError::ContentExtraction {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
        if metadata.len() <= MAX_LINE_COUNT_BYTES {
            let bytes = fs::read(path).map_err(|err| DmeError::ContentExtraction {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            if !bytes.contains(&0) {
                if let Ok(text) = std::str::from_utf8(&bytes) {
                    entries.push(MetadataEntry::new("line_count", text.lines().count().to_string()));
                }
            }
        }
        Ok(entries)
    }
}

fn content_type_for(extension: Option<&str>) -> &'static str {
    match extension {
        Some("txt" | "log" | "md") => "text/plain",
        Some("csv") => "text/csv",
        Some("tsv") => "text/tab-separated-values",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("html" | "htm") => "text/html",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz" | "tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("tif" | "tiff") => "image/tiff",
        Some("fastq" | "fq" | "fasta" | "fa" | "sam" | "vcf") => "text/plain",
        Some("bam") => "application/x-bam",
        _ => "application/octet-stream",
    }
}

#[derive(Clone, Default)]
pub struct MetadataResolver {
    extractor: Option<Arc<dyn ContentExtractor>>,
}

impl MetadataResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Resolves the entity's own metadata.
    ///
    /// Order: explicit metadata file, then the `<path>.metadata.json` sidecar,
    /// then (outside metadata-only runs) synthesized defaults enriched with
    /// content-derived pairs when extraction is enabled.
    ///
    /// The explicit file and the metadata-only skip apply to data objects
    /// only; a collection always resolves to its sidecar or its defaults.
    pub fn resolve(
        &self,
        entry: &PathEntry,
        criteria: &RunCriteria,
    ) -> Result<MetadataResolution, DmeError> {
        let explicit = match entry.kind() {
            EntityKind::DataObject => criteria.metadata_file.clone(),
            EntityKind::Collection => None,
        };
        let description = explicit.unwrap_or_else(|| entry.sidecar_path());
        if description.exists() {
            let entries = read_sidecar(&description)?;
            debug!(path = %entry.relative_path, attributes = entries.len(), "metadata from file");
            return Ok(MetadataResolution::Resolved(entries));
        }
        if criteria.metadata_only && !entry.is_directory {
            return Ok(MetadataResolution::Skip);
        }

        let mut entries = default_metadata(entry);
        if criteria.extract_metadata && !entry.is_directory {
            if let Some(extractor) = &self.extractor {
                for extracted in extractor.extract(&entry.absolute_path)? {
                    if !has_attribute(&entries, &extracted.attribute) {
                        entries.push(extracted);
                    }
                }
            }
        }
        Ok(MetadataResolution::Resolved(entries))
    }

    /// Metadata applied to any parent collection the archive creates for `entry`.
    ///
    /// Looks one segment up, reads that directory's own sidecar or synthesizes
    /// defaults, and guarantees a `collection_type`.
    pub fn resolve_parent(&self, entry: &PathEntry) -> Result<Vec<MetadataEntry>, DmeError> {
        let Some(parent_path) = entry.absolute_path.parent() else {
            return Ok(vec![MetadataEntry::new(COLLECTION_TYPE, FOLDER)]);
        };
        let relative = entry
            .relative_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        let name = parent_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("/")
            .to_string();
        let last_modified = fs::metadata(parent_path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let parent = PathEntry {
            name,
            relative_path: relative,
            absolute_path: parent_path.to_path_buf(),
            is_directory: true,
            size_bytes: 0,
            last_modified,
        };

        let sidecar = parent.sidecar_path();
        let mut entries = if sidecar.exists() {
            read_sidecar(&sidecar)?
        } else {
            default_metadata(&parent)
        };
        if !has_attribute(&entries, COLLECTION_TYPE) {
            entries.push(MetadataEntry::new(COLLECTION_TYPE, FOLDER));
        }
        Ok(entries)
    }
}

pub fn read_sidecar(path: &Path) -> Result<Vec<MetadataEntry>, DmeError> {
    let content = fs::read_to_string(path).map_err(|err| DmeError::MetadataRead {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let document: SidecarDocument =
        serde_json::from_str(&content).map_err(|err| DmeError::MetadataRead {
            path: path.to_path_buf(),
            message: err.to_string(),
        })?;
    let entries = document.into_entries();
    ensure_unique_attributes(&entries)?;
    Ok(entries)
}

pub fn default_metadata(entry: &PathEntry) -> Vec<MetadataEntry> {
    let modified = entry.last_modified.unwrap_or_else(Utc::now);
    let mut entries = Vec::with_capacity(2);
    if entry.is_directory {
        entries.push(MetadataEntry::new(COLLECTION_TYPE, FOLDER));
    } else {
        entries.push(MetadataEntry::new(OBJECT_NAME, entry.name.clone()));
    }
    entries.push(MetadataEntry::new(
        MODIFIED_DATE,
        modified.format(DATE_FORMAT).to_string(),
    ));
    entries
}

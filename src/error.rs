use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DmeError {
    #[error("source not found or unreadable: {0}")]
    SourceNotFound(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no auth token configured (set `token` or `token_file`)")]
    MissingCredentials,

    #[error("failed to read pattern or file list {path}: {message}")]
    ListRead { path: PathBuf, message: String },

    #[error("invalid glob pattern '{pattern}': {reason}")]
    InvalidGlobPattern { pattern: String, reason: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid archive path '{path}': {reason}")]
    InvalidArchivePath { path: String, reason: String },

    #[error("failed to read JSON metadata file {path}: {message}")]
    MetadataRead { path: PathBuf, message: String },

    #[error("duplicate metadata attribute '{0}'")]
    DuplicateAttribute(String),

    #[error("content extraction failed for {path}: {message}")]
    ContentExtraction { path: PathBuf, message: String },

    #[error("archive request failed: {0}")]
    RemoteHttp(String),

    #[error("archive request timed out: {0}")]
    RemoteTimeout(String),

    #[error("archive returned status {status}: {message}")]
    RemoteStatus { status: u16, message: String },

    #[error("archive did not return an upload URL for {0}")]
    MissingUploadUrl(String),

    #[error("storage request failed: {0}")]
    StorageHttp(String),

    #[error("storage request timed out: {0}")]
    StorageTimeout(String),

    #[error("storage returned status {status}: {message}")]
    StorageStatus { status: u16, message: String },

    #[error("part {part_number} failed after {attempts} attempt(s): {message}")]
    PartUpload {
        part_number: u32,
        attempts: u32,
        message: String,
    },

    #[error("failed to register collection {path}: {message}")]
    CollectionRegistration { path: String, message: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("worker {0} terminated unexpectedly")]
    WorkerPanicked(usize),

    #[error("failed to get confirmation: {0}")]
    Confirmation(String),
}

impl DmeError {
    /// Failures worth another attempt at the part layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            DmeError::StorageHttp(_) | DmeError::StorageTimeout(_) => true,
            DmeError::StorageStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

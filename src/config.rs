use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8Path;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{ArchivePath, ArchiveType, RunCriteria, UploadMode};
use crate::error::DmeError;
use crate::retry::RetryPolicy;
use crate::scanner::read_patterns;

pub const DEFAULT_CONFIG_FILE: &str = "dme-upload.json";

pub const MIB: u64 = 1024 * 1024;
/// Smallest part size and multipart threshold the object store accepts.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

const DEFAULT_THREADS: usize = 4;
const DEFAULT_PART_SIZE: u64 = 100 * MIB;
const DEFAULT_MULTIPART_THRESHOLD: u64 = 5 * 1024 * MIB;
const DEFAULT_POOL_SIZE: usize = 4;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_SECS: u64 = 5;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// On-disk shape of `dme-upload.json`. Every field is optional so CLI flags can fill gaps.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(default)]
    pub source: Option<PathBuf>,
    #[serde(default)]
    pub file_list: Option<PathBuf>,
    #[serde(default)]
    pub destination_base_path: Option<String>,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub include_pattern_file: Option<PathBuf>,
    #[serde(default)]
    pub exclude_pattern_file: Option<PathBuf>,
    #[serde(default)]
    pub metadata_only: Option<bool>,
    #[serde(default)]
    pub checksum: Option<bool>,
    #[serde(default)]
    pub extract_metadata: Option<bool>,
    #[serde(default)]
    pub metadata_file: Option<PathBuf>,
    #[serde(default)]
    pub archive_type: Option<ArchiveType>,
    #[serde(default)]
    pub upload_mode: Option<UploadMode>,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default)]
    pub part_size: Option<u64>,
    #[serde(default)]
    pub multipart_threshold: Option<u64>,
    #[serde(default)]
    pub multipart_pool_size: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_seconds: Option<u64>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub confirm: Option<bool>,
    #[serde(default)]
    pub test_run: Option<bool>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Validated settings for one run. Built once at startup and never reloaded.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub schema_version: u32,
    pub connection: Connection,
    pub source: PathBuf,
    pub file_list: Option<PathBuf>,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub criteria: RunCriteria,
    pub threads: usize,
    pub transfer: TransferSettings,
    pub confirm: bool,
    pub test_run: bool,
    pub log_dir: PathBuf,
}

/// What every archive call needs.
#[derive(Debug, Clone)]
pub struct Connection {
    pub server_url: String,
    pub token: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub part_size: u64,
    pub multipart_threshold: u64,
    pub pool_size: usize,
    pub retry: RetryPolicy,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            pool_size: DEFAULT_POOL_SIZE,
            retry: RetryPolicy::fixed(
                DEFAULT_MAX_ATTEMPTS,
                Duration::from_secs(DEFAULT_BACKOFF_SECS),
            ),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads the config file. Without an explicit path a missing default file
    /// yields an empty config that CLI flags are expected to fill.
    pub fn load(path: Option<&Path>) -> Result<Config, DmeError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DmeError::ConfigRead(config_path.clone()))?;
        serde_json::from_str(&content).map_err(|err| DmeError::ConfigParse(err.to_string()))
    }

    pub fn resolve(path: Option<&Path>) -> Result<RunConfig, DmeError> {
        Self::resolve_config(Self::load(path)?)
    }

    pub fn resolve_config(config: Config) -> Result<RunConfig, DmeError> {
        let schema_version = config.schema_version.unwrap_or(1);
        let connection = Self::resolve_connection(&config)?;

        let source = config
            .source
            .ok_or_else(|| DmeError::InvalidConfig("`source` is required".to_string()))?;
        let destination_base_path = required(config.destination_base_path, "destination_base_path")?
            .replace('\\', "/");
        // Validates the base itself; the root "/" is refused as a destination.
        let base = ArchivePath::join(&destination_base_path, Utf8Path::new(""))?;

        let mut include_patterns = config.include_patterns;
        include_patterns.extend(read_patterns(config.include_pattern_file.as_deref())?);
        let mut exclude_patterns = config.exclude_patterns;
        exclude_patterns.extend(read_patterns(config.exclude_pattern_file.as_deref())?);

        let threads = config.threads.unwrap_or(DEFAULT_THREADS);
        if threads == 0 {
            return Err(DmeError::InvalidConfig("`threads` must be at least 1".to_string()));
        }
        let pool_size = config.multipart_pool_size.unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 {
            return Err(DmeError::InvalidConfig(
                "`multipart_pool_size` must be at least 1".to_string(),
            ));
        }
        let max_attempts = config.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(DmeError::InvalidConfig(
                "`max_attempts` must be at least 1".to_string(),
            ));
        }
        let archive_type = config.archive_type.unwrap_or(ArchiveType::Posix);
        let upload_mode = config.upload_mode.unwrap_or(match archive_type {
            ArchiveType::Posix => UploadMode::Inline,
            ArchiveType::ObjectStore => UploadMode::UploadUrl,
        });

        let criteria = RunCriteria {
            destination_base_path: base.as_str().to_string(),
            metadata_only: config.metadata_only.unwrap_or(false),
            checksum: config.checksum.unwrap_or(true),
            archive_type,
            upload_mode,
            extract_metadata: config.extract_metadata.unwrap_or(false),
            metadata_file: config.metadata_file,
        };

        let transfer = TransferSettings {
            part_size: config.part_size.unwrap_or(DEFAULT_PART_SIZE).max(MIN_PART_SIZE),
            multipart_threshold: config
                .multipart_threshold
                .unwrap_or(DEFAULT_MULTIPART_THRESHOLD)
                .max(MIN_PART_SIZE),
            pool_size,
            retry: RetryPolicy::fixed(
                max_attempts,
                Duration::from_secs(config.backoff_seconds.unwrap_or(DEFAULT_BACKOFF_SECS)),
            ),
        };

        let log_dir = match config.log_dir {
            Some(dir) => dir,
            None => default_log_dir()?,
        };

        Ok(RunConfig {
            schema_version,
            connection,
            source,
            file_list: config.file_list,
            include_patterns,
            exclude_patterns,
            criteria,
            threads,
            transfer,
            confirm: config.confirm.unwrap_or(true),
            test_run: config.test_run.unwrap_or(false),
            log_dir,
        })
    }
}

impl ConfigLoader {
    /// Server, token and timeout only; enough for calls that touch no local tree.
    pub fn resolve_connection(config: &Config) -> Result<Connection, DmeError> {
        let server_url = required(config.server_url.clone(), "server_url")?
            .trim_end_matches('/')
            .to_string();
        let token = resolve_token(config.token.clone(), config.token_file.as_deref())?;
        let timeout_secs = config.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(DmeError::InvalidConfig(
                "`timeout_seconds` must be at least 1".to_string(),
            ));
        }
        Ok(Connection {
            server_url,
            token,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

pub fn default_log_dir() -> Result<PathBuf, DmeError> {
    BaseDirs::new()
        .map(|dirs| {
            dirs.home_dir()
                .join(".cache")
                .join("dme-bulk-uploader")
                .join("logs")
        })
        .ok_or_else(|| DmeError::Filesystem("unable to resolve log directory".to_string()))
}

fn required(value: Option<String>, field: &str) -> Result<String, DmeError> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(DmeError::InvalidConfig(format!("`{field}` is required"))),
    }
}

fn resolve_token(token: Option<String>, token_file: Option<&Path>) -> Result<String, DmeError> {
    if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
        return Ok(token.trim().to_string());
    }
    if let Some(path) = token_file {
        let content =
            fs::read_to_string(path).map_err(|_| DmeError::ConfigRead(path.to_path_buf()))?;
        let token = content.trim();
        if !token.is_empty() {
            return Ok(token.to_string());
        }
    }
    Err(DmeError::MissingCredentials)
}

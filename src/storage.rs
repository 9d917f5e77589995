//! Byte transfer to presigned object-storage URLs.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::{Body, Client};
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::error::DmeError;
use crate::progress::{ProgressReader, TransferProgressBridge};

pub trait ObjectStorage: Send + Sync {
    /// Uploads `length` bytes of `file` starting at `offset` and returns the
    /// ETag the store answered with, if any.
    fn put_range(
        &self,
        url: &str,
        file: &Path,
        offset: u64,
        length: u64,
        progress: Arc<TransferProgressBridge>,
    ) -> Result<Option<String>, DmeError>;
}

#[derive(Clone)]
pub struct PresignedHttpStorage {
    client: Client,
}

impl PresignedHttpStorage {
    /// Presigned URLs carry their own credentials, so no auth header is attached.
    pub fn new(timeout: Duration) -> Result<Self, DmeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dme-upload/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DmeError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| DmeError::StorageHttp(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ObjectStorage for PresignedHttpStorage {
    fn put_range(
        &self,
        url: &str,
        file: &Path,
        offset: u64,
        length: u64,
        progress: Arc<TransferProgressBridge>,
    ) -> Result<Option<String>, DmeError> {
        let mut handle = File::open(file).map_err(|err| {
            DmeError::Filesystem(format!("failed to open {}: {err}", file.display()))
        })?;
        handle
            .seek(SeekFrom::Start(offset))
            .map_err(|err| DmeError::Filesystem(err.to_string()))?;
        let reader = ProgressReader::new(handle.take(length), progress);

        debug!(offset, length, "uploading byte range");
        let response = self
            .client
            .put(url)
            .header(CONTENT_LENGTH, length)
            .body(Body::sized(reader, length))
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    DmeError::StorageTimeout(err.to_string())
                } else {
                    DmeError::StorageHttp(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status = status.as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "storage request failed".to_string());
            return Err(DmeError::StorageStatus { status, message });
        }
        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }
}

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{ArchivePath, MetadataEntry, RegistrationRequest, UploadPart};
use crate::error::DmeError;
use crate::progress::{ProgressReader, TransferProgressBridge};

/// Where the archive wants the bytes of a data object sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Single { url: String },
    Multipart { upload_id: String, parts: Vec<PartUrl> },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartUrl {
    pub part_number: u32,
    #[serde(rename = "partUploadRequestURL")]
    pub url: String,
}

/// Calls against the remote data-management API.
pub trait DmeClient: Send + Sync {
    fn register_collection(&self, request: &RegistrationRequest) -> Result<(), DmeError>;

    /// Registers a data object and sends its bytes in the same request.
    fn register_data_object(
        &self,
        request: &RegistrationRequest,
        file: &Path,
        progress: Arc<TransferProgressBridge>,
    ) -> Result<(), DmeError>;

    /// Registers a data object and asks for presigned URL(s) to upload to.
    fn request_upload_url(&self, request: &RegistrationRequest) -> Result<UploadTarget, DmeError>;

    fn complete_multipart_upload(
        &self,
        path: &ArchivePath,
        upload_id: &str,
        parts: &[UploadPart],
    ) -> Result<(), DmeError>;

    fn delete_data_object(&self, path: &ArchivePath) -> Result<(), DmeError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationBody<'a> {
    metadata_entries: &'a [MetadataEntry],
    create_parent_collections: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_collections_bulk_metadata_entries: Option<ParentMetadata<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    checksum: Option<&'a str>,
    #[serde(rename = "generateUploadRequestURL", skip_serializing_if = "is_false")]
    generate_upload_request_url: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_parts: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParentMetadata<'a> {
    default_collection_metadata_entries: &'a [MetadataEntry],
}

impl<'a> From<&'a RegistrationRequest> for RegistrationBody<'a> {
    fn from(request: &'a RegistrationRequest) -> Self {
        Self {
            metadata_entries: &request.metadata_entries,
            create_parent_collections: request.create_parent_collections(),
            parent_collections_bulk_metadata_entries: request
                .parent_metadata_entries
                .as_deref()
                .map(|entries| ParentMetadata {
                    default_collection_metadata_entries: entries,
                }),
            checksum: request.checksum.as_deref(),
            generate_upload_request_url: request.generate_upload_url,
            upload_parts: request.upload_parts,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    #[serde(default, rename = "uploadRequestURL")]
    upload_request_url: Option<String>,
    #[serde(default)]
    multipart_upload: Option<MultipartUploadResponse>,
}

#[derive(Debug, Deserialize)]
struct MultipartUploadResponse {
    id: String,
    #[serde(default)]
    parts: Vec<PartUrl>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteMultipartBody<'a> {
    multipart_upload_id: &'a str,
    upload_part_e_tags: Vec<PartETag<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PartETag<'a> {
    part_number: u32,
    #[serde(rename = "eTag")]
    etag: &'a str,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct DmeHttpClient {
    client: Client,
    base_url: Url,
}

impl DmeHttpClient {
    pub fn new(server_url: &str, token: &str, timeout: Duration) -> Result<Self, DmeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dme-upload/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DmeError::InvalidConfig(err.to_string()))?,
        );
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| DmeError::InvalidConfig("token contains invalid characters".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| DmeError::RemoteHttp(err.to_string()))?;
        let base_url = Url::parse(server_url)
            .map_err(|err| DmeError::InvalidConfig(format!("server_url: {err}")))?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, prefix: &[&str], path: &ArchivePath, suffix: &[&str]) -> Result<Url, DmeError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DmeError::InvalidConfig("server_url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(prefix)
            .extend(path.trimmed().split('/'))
            .extend(suffix);
        Ok(url)
    }

    fn send(&self, request: RequestBuilder) -> Result<Response, DmeError> {
        request.send().map_err(|err| {
            if err.is_timeout() {
                DmeError::RemoteTimeout(err.to_string())
            } else {
                DmeError::RemoteHttp(err.to_string())
            }
        })
    }
}

impl DmeClient for DmeHttpClient {
    fn register_collection(&self, request: &RegistrationRequest) -> Result<(), DmeError> {
        let url = self.endpoint(&["collection"], &request.path, &[])?;
        debug!(%url, "registering collection");
        let response = self.send(self.client.put(url).json(&RegistrationBody::from(request)))?;
        ensure_success(response).map(|_| ())
    }

    fn register_data_object(
        &self,
        request: &RegistrationRequest,
        file: &Path,
        progress: Arc<TransferProgressBridge>,
    ) -> Result<(), DmeError> {
        let url = self.endpoint(&["dataObject"], &request.path, &[])?;
        let body = serde_json::to_vec(&RegistrationBody::from(request))
            .map_err(|err| DmeError::RemoteHttp(err.to_string()))?;
        let handle = File::open(file).map_err(|err| {
            DmeError::Filesystem(format!("failed to open {}: {err}", file.display()))
        })?;
        let length = handle
            .metadata()
            .map_err(|err| DmeError::Filesystem(err.to_string()))?
            .len();
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("dataObject")
            .to_string();

        let registration = Part::bytes(body)
            .mime_str("application/json")
            .map_err(|err| DmeError::RemoteHttp(err.to_string()))?;
        let data = Part::reader_with_length(ProgressReader::new(handle, progress), length)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|err| DmeError::RemoteHttp(err.to_string()))?;
        let form = Form::new()
            .part("dataObjectRegistration", registration)
            .part("dataObject", data);

        debug!(%url, bytes = length, "registering data object inline");
        let response = self.send(self.client.put(url).multipart(form))?;
        ensure_success(response).map(|_| ())
    }

    fn request_upload_url(&self, request: &RegistrationRequest) -> Result<UploadTarget, DmeError> {
        let url = self.endpoint(&["v2", "dataObject"], &request.path, &[])?;
        debug!(%url, parts = ?request.upload_parts, "requesting upload url");
        let response = self.send(self.client.put(url).json(&RegistrationBody::from(request)))?;
        let response = ensure_success(response)?;
        let parsed: UploadUrlResponse = response
            .json()
            .map_err(|err| DmeError::RemoteHttp(format!("invalid upload URL response: {err}")))?;

        match (request.upload_parts, parsed) {
            (
                Some(_),
                UploadUrlResponse {
                    multipart_upload: Some(multipart),
                    ..
                },
            ) if !multipart.parts.is_empty() => Ok(UploadTarget::Multipart {
                upload_id: multipart.id,
                parts: multipart.parts,
            }),
            (
                None,
                UploadUrlResponse {
                    upload_request_url: Some(url),
                    ..
                },
            ) => Ok(UploadTarget::Single { url }),
            _ => Err(DmeError::MissingUploadUrl(request.path.to_string())),
        }
    }

    fn complete_multipart_upload(
        &self,
        path: &ArchivePath,
        upload_id: &str,
        parts: &[UploadPart],
    ) -> Result<(), DmeError> {
        let url = self.endpoint(&["dataObject"], path, &["completeMultipartUpload"])?;
        let upload_part_e_tags = parts
            .iter()
            .map(|part| {
                part.etag
                    .as_deref()
                    .map(|etag| PartETag {
                        part_number: part.part_number,
                        etag,
                    })
                    .ok_or_else(|| DmeError::PartUpload {
                        part_number: part.part_number,
                        attempts: 0,
                        message: "missing ETag".to_string(),
                    })
            })
            .collect::<Result<Vec<_>, DmeError>>()?;
        let body = CompleteMultipartBody {
            multipart_upload_id: upload_id,
            upload_part_e_tags,
        };
        debug!(%url, parts = parts.len(), "completing multipart upload");
        let response = self.send(self.client.post(url).json(&body))?;
        ensure_success(response).map(|_| ())
    }

    fn delete_data_object(&self, path: &ArchivePath) -> Result<(), DmeError> {
        let url = self.endpoint(&["dataObject"], path, &[])?;
        debug!(%url, "deleting data object");
        let response = self.send(self.client.delete(url))?;
        ensure_success(response).map(|_| ())
    }
}

fn ensure_success(response: Response) -> Result<Response, DmeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let status = status.as_u16();
    let text = response.text().unwrap_or_default();
    Err(DmeError::RemoteStatus {
        status,
        message: remote_error_message(status, &text),
    })
}

/// Pulls `message` out of the archive's error document, falling back to the raw body.
pub fn remote_error_message(status: u16, body: &str) -> String {
    if let Ok(RemoteErrorBody {
        message: Some(message),
    }) = serde_json::from_str::<RemoteErrorBody>(body)
    {
        return message;
    }
    match (status, body.trim()) {
        (401, _) => "unauthorized access".to_string(),
        (_, "") => "no response body".to_string(),
        (_, raw) => raw.to_string(),
    }
}

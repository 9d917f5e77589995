#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dme_bulk_uploader::client::{DmeClient, PartUrl, UploadTarget};
use dme_bulk_uploader::config::{Config, ConfigLoader, RunConfig};
use dme_bulk_uploader::dispatcher::CancelFlag;
use dme_bulk_uploader::domain::{ArchivePath, RegistrationRequest, UploadPart};
use dme_bulk_uploader::error::DmeError;
use dme_bulk_uploader::metadata::MetadataResolver;
use dme_bulk_uploader::progress::TransferProgressBridge;
use dme_bulk_uploader::registrar::Registrar;
use dme_bulk_uploader::storage::ObjectStorage;

#[derive(Default)]
pub struct MockClient {
    pub collections: Mutex<Vec<RegistrationRequest>>,
    pub data_objects: Mutex<Vec<RegistrationRequest>>,
    pub completed: Mutex<Vec<(String, String, Vec<UploadPart>)>>,
    pub fail_suffix: Option<String>,
    pub panic_suffix: Option<String>,
    /// Answers every upload URL request with a multipart target.
    pub always_multipart: bool,
    pub fail_collections: bool,
}

impl MockClient {
    pub fn failing_on(suffix: &str) -> Self {
        Self {
            fail_suffix: Some(suffix.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_collections() -> Self {
        Self {
            fail_collections: true,
            ..Self::default()
        }
    }

    pub fn collection_paths(&self) -> Vec<String> {
        self.collections
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.path.to_string())
            .collect()
    }

    pub fn data_object_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .data_objects
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.path.to_string())
            .collect();
        paths.sort();
        paths
    }

    fn check(&self, request: &RegistrationRequest) -> Result<(), DmeError> {
        if let Some(suffix) = &self.panic_suffix {
            if request.path.as_str().ends_with(suffix.as_str()) {
                panic!("mock client asked to panic on {}", request.path);
            }
        }
        match &self.fail_suffix {
            Some(suffix) if request.path.as_str().ends_with(suffix.as_str()) => {
                Err(DmeError::RemoteStatus {
                    status: 500,
                    message: "internal error".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl DmeClient for MockClient {
    fn register_collection(&self, request: &RegistrationRequest) -> Result<(), DmeError> {
        if self.fail_collections {
            return Err(DmeError::RemoteStatus {
                status: 403,
                message: "not permitted".to_string(),
            });
        }
        self.collections.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn register_data_object(
        &self,
        request: &RegistrationRequest,
        _file: &Path,
        _progress: Arc<TransferProgressBridge>,
    ) -> Result<(), DmeError> {
        self.check(request)?;
        self.data_objects.lock().unwrap().push(request.clone());
        Ok(())
    }

    fn request_upload_url(&self, request: &RegistrationRequest) -> Result<UploadTarget, DmeError> {
        self.check(request)?;
        self.data_objects.lock().unwrap().push(request.clone());
        let parts = match request.upload_parts {
            None if self.always_multipart => Some(1),
            parts => parts,
        };
        Ok(match parts {
            Some(parts) => UploadTarget::Multipart {
                upload_id: "upload-1".to_string(),
                parts: (1..=parts)
                    .map(|part_number| PartUrl {
                        part_number,
                        url: format!("https://store.test/part/{part_number}"),
                    })
                    .collect(),
            },
            None => UploadTarget::Single {
                url: "https://store.test/object".to_string(),
            },
        })
    }

    fn complete_multipart_upload(
        &self,
        path: &ArchivePath,
        upload_id: &str,
        parts: &[UploadPart],
    ) -> Result<(), DmeError> {
        self.completed.lock().unwrap().push((
            path.to_string(),
            upload_id.to_string(),
            parts.to_vec(),
        ));
        Ok(())
    }

    fn delete_data_object(&self, _path: &ArchivePath) -> Result<(), DmeError> {
        Ok(())
    }
}

/// Records every range PUT; ranges listed in `failures` fail with 503 that many times first.
#[derive(Default)]
pub struct MockStorage {
    pub puts: Mutex<Vec<(u64, u64)>>,
    pub failures: Mutex<HashMap<u64, u32>>,
    pub permanent_failure_offset: Option<u64>,
    /// Raised while the first PUT is in flight; that PUT still succeeds.
    pub cancel_during_put: Option<CancelFlag>,
}

impl MockStorage {
    pub fn failing_at(offset: u64, times: u32) -> Self {
        let storage = Self::default();
        storage.failures.lock().unwrap().insert(offset, times);
        storage
    }

    pub fn attempts_at(&self, offset: u64) -> usize {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _)| *o == offset)
            .count()
    }
}

impl ObjectStorage for MockStorage {
    fn put_range(
        &self,
        _url: &str,
        _file: &Path,
        offset: u64,
        length: u64,
        _progress: Arc<TransferProgressBridge>,
    ) -> Result<Option<String>, DmeError> {
        self.puts.lock().unwrap().push((offset, length));
        if let Some(cancel) = &self.cancel_during_put {
            cancel.cancel();
        }
        if self.permanent_failure_offset == Some(offset) {
            return Err(DmeError::StorageStatus {
                status: 503,
                message: "slow down".to_string(),
            });
        }
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(&offset) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DmeError::StorageStatus {
                    status: 503,
                    message: "slow down".to_string(),
                });
            }
        }
        Ok(Some(format!("\"etag-{offset}\"")))
    }
}

pub fn write_file(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

pub fn base_config(source: &Path, log_dir: &Path) -> Config {
    Config {
        server_url: Some("https://dme.test/api".to_string()),
        token: Some("token".to_string()),
        source: Some(source.to_path_buf()),
        destination_base_path: Some("/proj/run1".to_string()),
        log_dir: Some(log_dir.to_path_buf()),
        confirm: Some(false),
        threads: Some(2),
        backoff_seconds: Some(0),
        ..Config::default()
    }
}

pub fn resolve(config: Config) -> RunConfig {
    ConfigLoader::resolve_config(config).unwrap()
}

pub fn registrar(
    client: Arc<MockClient>,
    storage: Arc<MockStorage>,
    config: &RunConfig,
    cancel: CancelFlag,
) -> Registrar {
    Registrar::new(
        client,
        storage,
        MetadataResolver::new(),
        config.transfer.clone(),
        cancel,
    )
}

//! Registration of a single entity with the archive.

use std::sync::Arc;

use tracing::{debug, info};

use crate::checksum::md5_file;
use crate::client::{DmeClient, UploadTarget};
use crate::config::TransferSettings;
use crate::dispatcher::CancelFlag;
use crate::domain::{ArchivePath, EntityKind, RegistrationRequest, UploadMode, WorkItem};
use crate::error::DmeError;
use crate::metadata::{MetadataResolution, MetadataResolver};
use crate::multipart::{ChunkedUploadCoordinator, normalize_part_size};
use crate::progress::{TransferEvent, TransferListener, TransferProgressBridge};
use crate::retry::retry_with_backoff;
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered {
        kind: EntityKind,
        path: ArchivePath,
        bytes: u64,
    },
    /// Metadata-only run and the entity has no description file.
    Skipped,
}

#[derive(Clone)]
pub struct Registrar {
    client: Arc<dyn DmeClient>,
    storage: Arc<dyn ObjectStorage>,
    resolver: MetadataResolver,
    transfer: TransferSettings,
    cancel: CancelFlag,
    listener: Option<Arc<dyn TransferListener>>,
}

impl Registrar {
    pub fn new(
        client: Arc<dyn DmeClient>,
        storage: Arc<dyn ObjectStorage>,
        resolver: MetadataResolver,
        transfer: TransferSettings,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            client,
            storage,
            resolver,
            transfer,
            cancel,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn register(&self, item: &WorkItem) -> Result<RegistrationOutcome, DmeError> {
        let path = item.archive_path()?;
        let metadata = match self.resolver.resolve(&item.entry, &item.criteria)? {
            MetadataResolution::Resolved(entries) => entries,
            MetadataResolution::Skip => {
                debug!(path = %item.entry.relative_path, "no metadata file, skipping");
                return Ok(RegistrationOutcome::Skipped);
            }
        };
        let parents = self.resolver.resolve_parent(&item.entry)?;

        match item.entry.kind() {
            EntityKind::Collection => {
                let request = RegistrationRequest::collection(path.clone(), metadata)
                    .with_parents(parents);
                self.client.register_collection(&request)?;
                info!(path = %path, "collection registered");
                Ok(RegistrationOutcome::Registered {
                    kind: EntityKind::Collection,
                    path,
                    bytes: 0,
                })
            }
            EntityKind::DataObject => {
                let request =
                    RegistrationRequest::data_object(path.clone(), metadata).with_parents(parents);
                let bridge = Arc::new(self.bridge(&path, item.entry.size_bytes));
                bridge.handle(TransferEvent::Started {
                    total_bytes: item.entry.size_bytes,
                });
                let result = match item.criteria.upload_mode {
                    UploadMode::Inline => self.upload_inline(item, request, bridge.clone()),
                    UploadMode::UploadUrl => self.upload_via_url(item, request, bridge.clone()),
                };
                match result {
                    Ok(()) => {
                        bridge.handle(TransferEvent::Completed);
                        Ok(RegistrationOutcome::Registered {
                            kind: EntityKind::DataObject,
                            path,
                            bytes: item.entry.size_bytes,
                        })
                    }
                    Err(err) => {
                        bridge.handle(TransferEvent::Failed(err.to_string()));
                        Err(err)
                    }
                }
            }
        }
    }

    fn bridge(&self, path: &ArchivePath, size: u64) -> TransferProgressBridge {
        let bridge = TransferProgressBridge::new(path.to_string(), size);
        match &self.listener {
            Some(listener) => bridge.with_listener(listener.clone()),
            None => bridge,
        }
    }

    fn upload_inline(
        &self,
        item: &WorkItem,
        mut request: RegistrationRequest,
        bridge: Arc<TransferProgressBridge>,
    ) -> Result<(), DmeError> {
        if item.criteria.checksum {
            request.checksum = Some(md5_file(&item.entry.absolute_path)?);
        }
        self.client
            .register_data_object(&request, &item.entry.absolute_path, bridge)
    }

    // No local checksum on this path; the store computes its own.
    fn upload_via_url(
        &self,
        item: &WorkItem,
        mut request: RegistrationRequest,
        bridge: Arc<TransferProgressBridge>,
    ) -> Result<(), DmeError> {
        let size = item.entry.size_bytes;
        let file = &item.entry.absolute_path;
        request.generate_upload_url = true;
        let part_size = (size > self.transfer.multipart_threshold)
            .then(|| normalize_part_size(size, self.transfer.part_size));
        request.upload_parts = part_size.map(|part_size| size.div_ceil(part_size) as u32);

        match (self.client.request_upload_url(&request)?, part_size) {
            (UploadTarget::Single { url }, _) => {
                retry_with_backoff(&self.transfer.retry, |_| {
                    self.storage.put_range(&url, file, 0, size, bridge.clone())
                })
                .map_err(|exhausted| DmeError::PartUpload {
                    part_number: 1,
                    attempts: exhausted.attempts,
                    message: exhausted.error.to_string(),
                })?;
                Ok(())
            }
            (UploadTarget::Multipart { upload_id, parts }, Some(part_size)) => {
                let coordinator = ChunkedUploadCoordinator::new(
                    self.storage.clone(),
                    self.transfer.retry.clone(),
                    self.transfer.pool_size,
                    self.cancel.clone(),
                );
                let uploaded = coordinator.upload(file, size, part_size, &parts, bridge)?;
                self.client
                    .complete_multipart_upload(&request.path, &upload_id, &uploaded)
            }
            (UploadTarget::Multipart { .. }, None) => Err(DmeError::RemoteHttp(format!(
                "archive offered a multipart upload for single-part object {}",
                request.path
            ))),
        }
    }
}

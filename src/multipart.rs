//! Splitting large objects into independently retried parts.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, info};

use crate::client::PartUrl;
use crate::config::MIN_PART_SIZE;
use crate::dispatcher::CancelFlag;
use crate::domain::UploadPart;
use crate::error::DmeError;
use crate::progress::TransferProgressBridge;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::storage::ObjectStorage;

pub const MAX_PARTS: u64 = 10_000;
const PART_ALIGNMENT: u64 = 1024;

/// Part size actually used for a file: at least 5 MiB, a multiple of 1 KiB,
/// and large enough that the file needs no more than 10 000 parts.
pub fn normalize_part_size(file_size: u64, requested: u64) -> u64 {
    let mut part_size = align_up(requested.max(MIN_PART_SIZE));
    if file_size.div_ceil(part_size) > MAX_PARTS {
        part_size = align_up(file_size.div_ceil(MAX_PARTS));
        while file_size.div_ceil(part_size) > MAX_PARTS {
            part_size += PART_ALIGNMENT;
        }
    }
    part_size
}

fn align_up(value: u64) -> u64 {
    value.div_ceil(PART_ALIGNMENT) * PART_ALIGNMENT
}

/// Contiguous, gap-free ranges covering `[0, file_size)`.
pub fn plan_parts(file_size: u64, part_size: u64) -> Vec<UploadPart> {
    if file_size == 0 || part_size == 0 {
        return Vec::new();
    }
    let count = file_size.div_ceil(part_size);
    (0..count)
        .map(|index| {
            let byte_offset = index * part_size;
            UploadPart {
                part_number: (index + 1) as u32,
                byte_offset,
                byte_length: part_size.min(file_size - byte_offset),
                etag: None,
            }
        })
        .collect()
}

pub struct ChunkedUploadCoordinator {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
    pool_size: usize,
    cancel: CancelFlag,
}

impl ChunkedUploadCoordinator {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        retry: RetryPolicy,
        pool_size: usize,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            storage,
            retry,
            pool_size: pool_size.max(1),
            cancel,
        }
    }

    /// Uploads every part and returns them ordered by part number, each with its ETag.
    ///
    /// The first part that exhausts its retries fails the whole object; parts
    /// already in flight finish, queued parts are dropped.
    pub fn upload(
        &self,
        file: &Path,
        file_size: u64,
        part_size: u64,
        urls: &[PartUrl],
        progress: Arc<TransferProgressBridge>,
    ) -> Result<Vec<UploadPart>, DmeError> {
        let planned = plan_parts(file_size, part_size);
        if urls.len() != planned.len() {
            return Err(DmeError::RemoteHttp(format!(
                "archive returned {} part URLs for {} parts",
                urls.len(),
                planned.len()
            )));
        }

        let mut jobs = Vec::with_capacity(planned.len());
        for part in planned {
            let url = urls
                .iter()
                .find(|url| url.part_number == part.part_number)
                .ok_or_else(|| {
                    DmeError::RemoteHttp(format!("no URL for part {}", part.part_number))
                })?;
            jobs.push((part, url.url.clone()));
        }
        let expected = jobs.len();
        let workers = self.pool_size.min(expected.max(1));
        info!(file = %file.display(), parts = expected, part_size, workers, "starting multipart upload");

        let (job_tx, job_rx) = bounded(expected.max(1));
        for job in jobs {
            job_tx
                .send(job)
                .map_err(|err| DmeError::Filesystem(err.to_string()))?;
        }
        drop(job_tx);

        let (result_tx, result_rx) = unbounded();
        let abort = AtomicBool::new(false);
        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let progress = progress.clone();
                let abort = &abort;
                scope.spawn(move || {
                    for (part, url) in job_rx.iter() {
                        if abort.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                            abort.store(true, Ordering::Release);
                            break;
                        }
                        let outcome = self.upload_part(file, part, &url, progress.clone());
                        if outcome.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        let _ = result_tx.send(outcome);
                    }
                });
            }
        });
        drop(result_tx);

        let mut completed = Vec::with_capacity(expected);
        let mut failure = None;
        for outcome in result_rx.iter() {
            match outcome {
                Ok(part) => completed.push(part),
                Err(err) => {
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = failure {
            return Err(err);
        }
        // Workers stop taking parts once cancelled, so a short count means a cancel.
        if completed.len() != expected {
            debug!(completed = completed.len(), expected, "multipart upload cancelled");
            return Err(DmeError::Cancelled);
        }
        completed.sort_by_key(|part| part.part_number);
        Ok(completed)
    }

    fn upload_part(
        &self,
        file: &Path,
        mut part: UploadPart,
        url: &str,
        progress: Arc<TransferProgressBridge>,
    ) -> Result<UploadPart, DmeError> {
        let etag = retry_with_backoff(&self.retry, |attempt| {
            debug!(part = part.part_number, attempt, bytes = part.byte_length, "uploading part");
            self.storage
                .put_range(url, file, part.byte_offset, part.byte_length, progress.clone())
        })
        .map_err(|exhausted| DmeError::PartUpload {
            part_number: part.part_number,
            attempts: exhausted.attempts,
            message: exhausted.error.to_string(),
        })?;

        let etag = etag.ok_or_else(|| DmeError::PartUpload {
            part_number: part.part_number,
            attempts: 1,
            message: "storage returned no ETag".to_string(),
        })?;
        debug!(part = part.part_number, etag = %etag, "part uploaded");
        part.etag = Some(etag);
        Ok(part)
    }
}

//! Byte-level transfer progress.
//!
//! Storage transports emit [`TransferEvent`]s; the [`TransferProgressBridge`]
//! turns them into throttled log lines and a single terminal callback on an
//! optional [`TransferListener`].

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{debug, info, warn};

/// Cumulative bytes are logged at most once per this many bytes.
pub const LOG_INTERVAL_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started { total_bytes: u64 },
    BytesTransferred(u64),
    Completed,
    Failed(String),
}

/// Receives the outcome of one transfer. Exactly one method is called, once.
pub trait TransferListener: Send + Sync {
    fn on_completed(&self, bytes_transferred: u64);
    fn on_failed(&self, reason: &str);
}

pub struct TransferProgressBridge {
    label: String,
    total_bytes: AtomicU64,
    transferred: AtomicU64,
    logged_buckets: AtomicU64,
    finished: AtomicBool,
    listener: Option<Arc<dyn TransferListener>>,
}

impl TransferProgressBridge {
    pub fn new(label: impl Into<String>, total_bytes: u64) -> Self {
        Self {
            label: label.into(),
            total_bytes: AtomicU64::new(total_bytes),
            transferred: AtomicU64::new(0),
            logged_buckets: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn TransferListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn handle(&self, event: TransferEvent) {
        if self.is_finished() {
            return;
        }
        match event {
            TransferEvent::Started { total_bytes } => {
                self.total_bytes.store(total_bytes, Ordering::Relaxed);
                debug!(transfer = %self.label, total_bytes, "transfer started");
            }
            TransferEvent::BytesTransferred(bytes) => self.add_bytes(bytes),
            TransferEvent::Completed => {
                if !self.finished.swap(true, Ordering::AcqRel) {
                    let bytes = self.bytes_transferred();
                    info!(transfer = %self.label, bytes, "transfer completed");
                    if let Some(listener) = &self.listener {
                        listener.on_completed(bytes);
                    }
                }
            }
            TransferEvent::Failed(reason) => {
                if !self.finished.swap(true, Ordering::AcqRel) {
                    warn!(transfer = %self.label, reason = %reason, "transfer failed");
                    if let Some(listener) = &self.listener {
                        listener.on_failed(&reason);
                    }
                }
            }
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn add_bytes(&self, bytes: u64) {
        let total = self.transferred.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let bucket = total / LOG_INTERVAL_BYTES;
        if bucket == 0 {
            return;
        }
        let previous = self.logged_buckets.fetch_max(bucket, Ordering::AcqRel);
        if previous < bucket {
            info!(
                transfer = %self.label,
                bytes = total,
                total_bytes = self.total_bytes.load(Ordering::Relaxed),
                "transfer progress"
            );
        }
    }
}

/// Reader adapter that reports every chunk read to a bridge.
pub struct ProgressReader<R> {
    inner: R,
    bridge: Arc<TransferProgressBridge>,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R, bridge: Arc<TransferProgressBridge>) -> Self {
        Self { inner, bridge }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        if read > 0 {
            self.bridge
                .handle(TransferEvent::BytesTransferred(read as u64));
        }
        Ok(read)
    }
}

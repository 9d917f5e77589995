mod common;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use common::{MockClient, MockStorage, base_config, registrar, resolve, write_file};
use dme_bulk_uploader::config::{MIB, RunConfig};
use dme_bulk_uploader::dispatcher::CancelFlag;
use dme_bulk_uploader::domain::{EntityKind, PathEntry, UploadMode, WorkItem};
use dme_bulk_uploader::error::DmeError;
use dme_bulk_uploader::progress::TransferListener;
use dme_bulk_uploader::registrar::RegistrationOutcome;

fn work_item(root: &Path, relative: &str, config: &RunConfig) -> WorkItem {
    let absolute = root.join(relative);
    let metadata = fs::metadata(&absolute).unwrap();
    let entry = PathEntry {
        name: relative.rsplit('/').next().unwrap_or(relative).to_string(),
        relative_path: Utf8PathBuf::from(relative),
        absolute_path: absolute,
        is_directory: metadata.is_dir(),
        size_bytes: if metadata.is_dir() { 0 } else { metadata.len() },
        last_modified: None,
    };
    WorkItem::new(entry, Arc::new(config.criteria.clone()))
}

fn upload_url_config(source: &Path, logs: &Path) -> RunConfig {
    let mut config = base_config(source, logs);
    config.upload_mode = Some(UploadMode::UploadUrl);
    config.part_size = Some(10 * MIB);
    config.multipart_threshold = Some(5 * MIB);
    config.max_attempts = Some(3);
    resolve(config)
}

#[derive(Default)]
struct CountingListener {
    completed: AtomicUsize,
    failed: Mutex<Vec<String>>,
}

impl TransferListener for CountingListener {
    fn on_completed(&self, _bytes_transferred: u64) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failed(&self, reason: &str) {
        self.failed.lock().unwrap().push(reason.to_string());
    }
}

#[test]
fn multipart_upload_retries_a_part_and_completes() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "big.bin", &vec![7u8; (25 * MIB) as usize]);
    let config = upload_url_config(source.path(), logs.path());
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MockStorage::failing_at(10 * MIB, 2));
    let registrar = registrar(client.clone(), storage.clone(), &config, CancelFlag::new());

    let outcome = registrar
        .register(&work_item(source.path(), "big.bin", &config))
        .unwrap();

    assert_matches!(
        outcome,
        RegistrationOutcome::Registered { kind: EntityKind::DataObject, bytes, .. } if bytes == 25 * MIB
    );
    let requests = client.data_objects.lock().unwrap();
    assert_eq!(requests[0].upload_parts, Some(3));
    assert!(requests[0].generate_upload_url);
    assert_eq!(requests[0].checksum, None);

    assert_eq!(storage.attempts_at(10 * MIB), 3);
    assert_eq!(storage.attempts_at(0), 1);
    assert_eq!(storage.attempts_at(20 * MIB), 1);

    let completed = client.completed.lock().unwrap();
    assert_eq!(completed.len(), 1);
    let (path, upload_id, parts) = &completed[0];
    assert_eq!(path, "/proj/run1/big.bin");
    assert_eq!(upload_id, "upload-1");
    let lengths: Vec<u64> = parts.iter().map(|p| p.byte_length).collect();
    assert_eq!(lengths, vec![10 * MIB, 10 * MIB, 5 * MIB]);
    let numbers: Vec<u32> = parts.iter().map(|p| p.part_number).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert!(parts.iter().all(|p| p.etag.is_some()));
}

#[test]
fn exhausted_part_fails_without_completing() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "big.bin", &vec![1u8; (12 * MIB) as usize]);
    let config = upload_url_config(source.path(), logs.path());
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MockStorage {
        permanent_failure_offset: Some(10 * MIB),
        ..MockStorage::default()
    });
    let registrar = registrar(client.clone(), storage.clone(), &config, CancelFlag::new());

    let err = registrar
        .register(&work_item(source.path(), "big.bin", &config))
        .unwrap_err();

    assert_matches!(err, DmeError::PartUpload { part_number: 2, attempts: 3, .. });
    assert_eq!(storage.attempts_at(10 * MIB), 3);
    assert!(client.completed.lock().unwrap().is_empty());
}

#[test]
fn small_file_uses_single_presigned_put() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "small.txt", b"tiny");
    let config = upload_url_config(source.path(), logs.path());
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MockStorage::failing_at(0, 1));
    let registrar = registrar(client.clone(), storage.clone(), &config, CancelFlag::new());

    registrar
        .register(&work_item(source.path(), "small.txt", &config))
        .unwrap();

    assert_eq!(client.data_objects.lock().unwrap()[0].upload_parts, None);
    assert_eq!(*storage.puts.lock().unwrap(), vec![(0, 4), (0, 4)]);
    assert!(client.completed.lock().unwrap().is_empty());
}

#[test]
fn inline_upload_carries_checksum_only_when_enabled() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "f.txt", b"hello");

    let config = resolve(base_config(source.path(), logs.path()));
    let client = Arc::new(MockClient::default());
    registrar(client.clone(), Arc::new(MockStorage::default()), &config, CancelFlag::new())
        .register(&work_item(source.path(), "f.txt", &config))
        .unwrap();
    assert_eq!(
        client.data_objects.lock().unwrap()[0].checksum.as_deref(),
        Some("5d41402abc4b2a76b9719d911017c592")
    );

    let mut raw = base_config(source.path(), logs.path());
    raw.checksum = Some(false);
    let config = resolve(raw);
    let client = Arc::new(MockClient::default());
    registrar(client.clone(), Arc::new(MockStorage::default()), &config, CancelFlag::new())
        .register(&work_item(source.path(), "f.txt", &config))
        .unwrap();
    assert_eq!(client.data_objects.lock().unwrap()[0].checksum, None);
}

#[test]
fn forbidden_character_is_rejected_before_any_call() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "what?.txt", b"x");
    let config = resolve(base_config(source.path(), logs.path()));
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MockStorage::default());

    let err = registrar(client.clone(), storage.clone(), &config, CancelFlag::new())
        .register(&work_item(source.path(), "what?.txt", &config))
        .unwrap_err();

    assert_matches!(err, DmeError::InvalidArchivePath { .. });
    assert!(client.data_objects.lock().unwrap().is_empty());
    assert!(storage.puts.lock().unwrap().is_empty());
}

#[test]
fn directory_registers_as_folder_collection() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    fs::create_dir_all(source.path().join("a/b")).unwrap();
    let config = resolve(base_config(source.path(), logs.path()));
    let client = Arc::new(MockClient::default());

    let outcome = registrar(client.clone(), Arc::new(MockStorage::default()), &config, CancelFlag::new())
        .register(&work_item(source.path(), "a/b", &config))
        .unwrap();

    assert_matches!(
        outcome,
        RegistrationOutcome::Registered { kind: EntityKind::Collection, bytes: 0, .. }
    );
    let collections = client.collections.lock().unwrap();
    assert_eq!(collections[0].path.as_str(), "/proj/run1/a/b");
    assert!(collections[0].create_parent_collections());
}

#[test]
fn listener_sees_exactly_one_terminal_event() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "ok.txt", b"a");
    write_file(source.path(), "bad.txt", b"b");
    let config = resolve(base_config(source.path(), logs.path()));
    let client = Arc::new(MockClient::failing_on("bad.txt"));
    let listener = Arc::new(CountingListener::default());
    let registrar = registrar(client, Arc::new(MockStorage::default()), &config, CancelFlag::new())
        .with_listener(listener.clone());

    registrar
        .register(&work_item(source.path(), "ok.txt", &config))
        .unwrap();
    assert!(registrar
        .register(&work_item(source.path(), "bad.txt", &config))
        .is_err());

    assert_eq!(listener.completed.load(Ordering::SeqCst), 1);
    let failed = listener.failed.lock().unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].contains("internal error"));
}

#[test]
fn cancel_lets_the_running_part_finish_and_stops_the_rest() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "big.bin", &vec![3u8; (25 * MIB) as usize]);
    let mut raw = base_config(source.path(), logs.path());
    raw.upload_mode = Some(UploadMode::UploadUrl);
    raw.part_size = Some(10 * MIB);
    raw.multipart_threshold = Some(5 * MIB);
    raw.multipart_pool_size = Some(1);
    let config = resolve(raw);
    let cancel = CancelFlag::new();
    let client = Arc::new(MockClient::default());
    let storage = Arc::new(MockStorage {
        cancel_during_put: Some(cancel.clone()),
        ..MockStorage::default()
    });
    let registrar = registrar(client.clone(), storage.clone(), &config, cancel.clone());

    let err = registrar
        .register(&work_item(source.path(), "big.bin", &config))
        .unwrap_err();

    assert_matches!(err, DmeError::Cancelled);
    assert!(cancel.is_cancelled());
    assert_eq!(*storage.puts.lock().unwrap(), vec![(0, 10 * MIB)]);
    assert!(client.completed.lock().unwrap().is_empty());
}

#[test]
fn multipart_offer_for_a_small_file_is_refused() {
    let source = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_file(source.path(), "small.txt", b"tiny");
    let config = upload_url_config(source.path(), logs.path());
    let client = Arc::new(MockClient {
        always_multipart: true,
        ..MockClient::default()
    });
    let storage = Arc::new(MockStorage::default());

    let err = registrar(client.clone(), storage.clone(), &config, CancelFlag::new())
        .register(&work_item(source.path(), "small.txt", &config))
        .unwrap_err();

    assert_matches!(err, DmeError::RemoteHttp(message) if message.contains("small.txt"));
    assert!(storage.puts.lock().unwrap().is_empty());
    assert!(client.completed.lock().unwrap().is_empty());
}

mod common;

use std::fs;

use assert_matches::assert_matches;

use common::write_file;
use dme_bulk_uploader::error::DmeError;
use dme_bulk_uploader::glob::PathFilter;
use dme_bulk_uploader::scanner::PathScanner;

fn relative_paths(scanner: &PathScanner, root: &std::path::Path) -> Vec<String> {
    scanner
        .scan(root)
        .unwrap()
        .iter()
        .map(|entry| entry.relative_path.to_string())
        .collect()
}

#[test]
fn directories_precede_their_contents() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "b/z.txt", b"1");
    write_file(root.path(), "a/b/c.txt", b"22");
    write_file(root.path(), "a-b/d.txt", b"333");
    write_file(root.path(), "top.txt", b"4444");

    let scanner = PathScanner::new(PathFilter::for_scan(vec![], vec![]).unwrap());
    let paths = relative_paths(&scanner, root.path());
    assert_eq!(
        paths,
        vec!["a", "a/b", "a/b/c.txt", "a-b", "a-b/d.txt", "b", "b/z.txt", "top.txt"]
    );
}

#[test]
fn repeated_scans_are_identical() {
    let root = tempfile::tempdir().unwrap();
    for index in 0..10 {
        write_file(root.path(), &format!("d{}/f{index}.dat", index % 4), b"x");
    }
    let scanner = PathScanner::new(PathFilter::for_scan(vec![], vec![]).unwrap());
    assert_eq!(scanner.scan(root.path()).unwrap(), scanner.scan(root.path()).unwrap());
}

#[test]
fn exclude_wins_over_include() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "keep/a.csv", b"a");
    write_file(root.path(), "keep/b.tmp", b"b");
    write_file(root.path(), "skip/c.csv", b"c");
    write_file(root.path(), "keep/secret.csv", b"d");

    let filter = PathFilter::for_scan(
        vec!["**/*.csv".to_string()],
        vec!["skip".to_string(), "**/secret.csv".to_string()],
    )
    .unwrap();
    let scanner = PathScanner::new(filter);
    let paths = relative_paths(&scanner, root.path());
    assert_eq!(paths, vec!["keep", "keep/a.csv"]);
}

#[test]
fn sidecars_and_tool_logs_are_not_inventoried() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "f.txt", b"x");
    write_file(root.path(), "f.txt.metadata.json", b"[]");
    write_file(root.path(), "dme-upload-20260101-000000-errors.log", b"old");

    let scanner = PathScanner::new(PathFilter::for_scan(vec![], vec![]).unwrap());
    assert_eq!(relative_paths(&scanner, root.path()), vec!["f.txt"]);
}

#[test]
fn sizes_and_kinds_are_captured() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "d/f.bin", &[0u8; 42]);
    let scanner = PathScanner::new(PathFilter::new());
    let entries = scanner.scan(root.path()).unwrap();
    assert!(entries[0].is_directory);
    assert_eq!(entries[0].size_bytes, 0);
    assert!(!entries[1].is_directory);
    assert_eq!(entries[1].size_bytes, 42);
    assert_eq!(entries[1].name, "f.bin");
    assert!(entries[1].last_modified.is_some());
}

#[cfg(unix)]
#[test]
fn symbolic_links_are_skipped() {
    let root = tempfile::tempdir().unwrap();
    let target = write_file(root.path(), "real/f.txt", b"x");
    std::os::unix::fs::symlink(&target, root.path().join("link.txt")).unwrap();
    std::os::unix::fs::symlink(root.path().join("real"), root.path().join("linkdir")).unwrap();

    let scanner = PathScanner::new(PathFilter::new());
    assert_eq!(relative_paths(&scanner, root.path()), vec!["real", "real/f.txt"]);
}

#[test]
fn file_list_restricts_the_inventory() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "a/one.txt", b"1");
    write_file(root.path(), "a/two.txt", b"2");
    write_file(root.path(), "b/three.txt", b"3");
    let list = tempfile::NamedTempFile::new().unwrap();
    fs::write(list.path(), "# replay\nb/three.txt\n\na\na/one.txt\n").unwrap();

    let scanner = PathScanner::new(PathFilter::new());
    let entries = scanner.scan_file_list(root.path(), list.path()).unwrap();
    let paths: Vec<_> = entries.iter().map(|e| e.relative_path.as_str()).collect();
    assert_eq!(paths, vec!["a", "a/one.txt", "b/three.txt"]);
}

#[test]
fn file_list_with_missing_entry_is_fatal() {
    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "a.txt", b"1");
    let list = tempfile::NamedTempFile::new().unwrap();
    fs::write(list.path(), "a.txt\ngone.txt\n").unwrap();

    let err = PathScanner::new(PathFilter::new())
        .scan_file_list(root.path(), list.path())
        .unwrap_err();
    assert_matches!(err, DmeError::SourceNotFound(path) if path.ends_with("gone.txt"));
}

#[test]
fn regular_file_as_root_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    let file = write_file(root.path(), "plain.txt", b"x");
    let err = PathScanner::new(PathFilter::new()).scan(&file).unwrap_err();
    assert_matches!(err, DmeError::SourceNotFound(_));
}

#[cfg(unix)]
#[test]
fn non_utf8_names_are_skipped() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let root = tempfile::tempdir().unwrap();
    write_file(root.path(), "a.txt", b"1");
    write_file(root.path(), "b.txt", b"2");
    write_file(root.path(), "d/c.txt", b"3");
    fs::write(root.path().join(OsStr::from_bytes(b"bad\xff.txt")), b"x").unwrap();
    let bad_dir = root.path().join(OsStr::from_bytes(b"dir\xfe"));
    fs::create_dir(&bad_dir).unwrap();
    fs::write(bad_dir.join("inner.txt"), b"y").unwrap();

    let scanner = PathScanner::new(PathFilter::for_scan(vec![], vec![]).unwrap());
    assert_eq!(
        relative_paths(&scanner, root.path()),
        vec!["a.txt", "b.txt", "d", "d/c.txt"]
    );
}

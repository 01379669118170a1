//! Cross-module tests for the ephemeral store.

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::thread;

use crate::{FileId, FileStore};

#[test]
fn test_put_and_resolve_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    let stored = store.put("demo.pkg", b"package bytes").unwrap();
    assert_eq!(stored.original_name, "demo.pkg");
    assert_eq!(stored.size_bytes, 13);

    let resolved = store.resolve(&stored.id).unwrap();
    assert_eq!(resolved, stored);
    assert_eq!(fs::read(&resolved.path).unwrap(), b"package bytes");
}

#[test]
fn test_resolve_unknown_id() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    let id: FileId = "adgjmp".parse().unwrap();
    assert!(store.resolve(&id).is_none());
}

#[test]
fn test_original_name_may_contain_delimiters() {
    // Names with underscores and dots broke filename-encoded metadata
    // schemes; the sidecar index must keep them verbatim.
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    let name = "my_odd_name_1234567890.tar.gz";
    let stored = store.put(name, b"x").unwrap();
    assert_eq!(store.resolve(&stored.id).unwrap().original_name, name);
}

#[test]
fn test_expired_entry_is_unresolvable_then_swept() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    let stored = store.put("a.txt", b"hello").unwrap();
    assert!(store.resolve(&stored.id).is_some());

    store.force_expire(&stored.id);
    assert!(
        store.resolve(&stored.id).is_none(),
        "expired entries must 404 before the sweep runs"
    );
    assert_eq!(store.live_count(), 1);

    assert_eq!(store.sweep(), 1);
    assert_eq!(store.live_count(), 0);
    assert!(!stored.path.exists());
    assert!(store.resolve(&stored.id).is_none());
}

#[test]
fn test_sweep_keeps_unexpired_entries() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    let keep = store.put("keep.bin", b"keep").unwrap();
    let stale = store.put("drop.bin", b"drop").unwrap();
    store.force_expire(&stale.id);

    assert_eq!(store.sweep(), 1);
    assert!(store.resolve(&keep.id).is_some());
    assert!(keep.path.exists());
}

#[test]
fn test_sweep_survives_missing_content_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::open(dir.path()).unwrap();

    let a = store.put("a.bin", b"a").unwrap();
    let b = store.put("b.bin", b"b").unwrap();
    store.force_expire(&a.id);
    store.force_expire(&b.id);

    // Simulate a racing deletion: the content file is already gone.
    fs::remove_file(&a.path).unwrap();

    assert_eq!(store.sweep(), 2);
    assert_eq!(store.live_count(), 0);
    assert!(!b.path.exists());
}

#[test]
fn test_index_rebuild_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let stored = {
        let store = FileStore::open(dir.path()).unwrap();
        store.put("persist.jar", b"jar bytes").unwrap()
    };

    let reopened = FileStore::open(dir.path()).unwrap();
    let resolved = reopened.resolve(&stored.id).unwrap();
    assert_eq!(resolved.original_name, "persist.jar");
    assert_eq!(fs::read(&resolved.path).unwrap(), b"jar bytes");
}

#[test]
fn test_open_drops_orphaned_content() {
    let dir = tempfile::tempdir().unwrap();

    // Content without a sidecar is not ours to serve.
    fs::write(dir.path().join("adgjmp"), b"stray").unwrap();

    let store = FileStore::open(dir.path()).unwrap();
    assert_eq!(store.live_count(), 0);
    assert!(!dir.path().join("adgjmp").exists());
}

#[test]
fn test_concurrent_puts_get_distinct_ids() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::open(dir.path()).unwrap());

    let mut handles = Vec::new();
    for t in 0..8 {
        let store = store.clone();
        handles.push(thread::spawn(move || {
            let mut ids = Vec::new();
            for i in 0..25 {
                let name = format!("file-{t}-{i}.bin");
                ids.push(store.put(&name, name.as_bytes()).unwrap().id);
            }
            ids
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "duplicate ID handed out: {id}");
        }
    }
    assert_eq!(store.live_count(), 200);
}

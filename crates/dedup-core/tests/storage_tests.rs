use std::fs;

use dedup_core::storage::{FileFilter, FileRecord, FileStatus, Store, SCHEMA_VERSION};
use dedup_core::{Error, Workspace};
use tempfile::tempdir;

fn record(path: &str, size: u64, fingerprint: u64) -> FileRecord {
    let mut record = FileRecord::new(path, size, 1_700_000_000);
    record.fingerprint = Some(fingerprint);
    record
}

#[test]
fn test_create_then_reopen_keeps_data() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("photos.dedup");

    {
        let store = Store::create(&path, "photos").unwrap();
        store.upsert(&record("/data/a.jpg", 10, 1)).unwrap();
        store.add_directory("/data").unwrap();
    }

    let store = Store::open(&path).unwrap();
    assert!(store.get_file_by_path("/data/a.jpg").unwrap().is_some());
    assert_eq!(store.list_directories().unwrap().len(), 1);
    assert_eq!(store.metadata().unwrap().workspace_name, "photos");
}

#[test]
fn test_open_missing_file() {
    let tmp = tempdir().unwrap();
    let err = Store::open(&tmp.path().join("nope.dedup")).err().unwrap();
    assert!(matches!(err, Error::WorkspaceNotFound(_)));
    assert!(err.is_workspace_open_failure());
}

#[test]
fn test_open_garbage_file_is_corrupt_and_untouched() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("broken.dedup");
    fs::write(&path, b"definitely not a database file").unwrap();

    let err = Workspace::open(&path).err().unwrap();
    assert!(
        matches!(err, Error::CorruptWorkspace { .. }),
        "expected corrupt workspace, got {:?}",
        err
    );
    assert!(err.is_workspace_open_failure());
    assert_eq!(
        fs::read(&path).unwrap(),
        b"definitely not a database file",
        "a corrupt workspace must not be re-initialised"
    );
}

#[test]
fn test_open_foreign_sqlite_file_is_corrupt() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("other.db");
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);")
            .unwrap();
    }

    let err = Store::open(&path).err().unwrap();
    assert!(matches!(err, Error::CorruptWorkspace { .. }));
}

#[test]
fn test_open_newer_schema_is_unsupported() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("future.dedup");
    {
        let store = Store::create(&path, "future").unwrap();
        store
            .connection()
            .pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
    }

    let err = Store::open(&path).err().unwrap();
    assert!(matches!(err, Error::UnsupportedSchema { found, .. } if found == SCHEMA_VERSION + 1));
}

#[test]
fn test_reader_sees_committed_rows_only() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("ws.dedup");
    let writer = Store::create(&path, "ws").unwrap();
    writer.upsert(&record("/a", 5, 1)).unwrap();

    let reader = Store::open_read_only(&path).unwrap();
    assert_eq!(reader.stats_snapshot().unwrap().total_files, 1);

    let result: dedup_core::Result<()> = writer.in_transaction(|tx| {
        tx.upsert(&record("/b", 5, 2))?;
        Err(Error::Other("abort chunk".into()))
    });
    assert!(result.is_err());
    assert_eq!(reader.stats_snapshot().unwrap().total_files, 1);
    assert!(reader.upsert(&record("/c", 1, 3)).is_err(), "reader must be read-only");
}

#[test]
fn test_duplicate_groups_ordered_by_waste() {
    let store = Store::open_in_memory().unwrap();
    let small = store.upsert(&record("/s1", 10, 1)).unwrap();
    let small_dup = store.upsert(&record("/s2", 10, 1)).unwrap();
    let big = store.upsert(&record("/b1", 1000, 2)).unwrap();
    let big_dup = store.upsert(&record("/b2", 1000, 2)).unwrap();
    store.commit_duplicate(small_dup, small).unwrap();
    store.commit_duplicate(big_dup, big).unwrap();

    let groups = store.duplicate_groups().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].canonical.path, "/b1");
    assert_eq!(groups[0].wasted_bytes, 1000);
    assert_eq!(groups[1].file_count(), 2);

    let stats = store.stats_snapshot().unwrap();
    assert_eq!(stats.total_files, 4);
    assert_eq!(stats.total_size, 2020);
    assert_eq!(stats.duplicate_groups, 2);
}

#[test]
fn test_every_duplicate_has_exactly_one_link() {
    let store = Store::open_in_memory().unwrap();
    let a = store.upsert(&record("/a", 1, 9)).unwrap();
    let b = store.upsert(&record("/b", 1, 9)).unwrap();
    store.commit_duplicate(b, a).unwrap();
    // relinking replaces the link instead of adding a second one
    store.commit_duplicate(b, a).unwrap();

    let duplicates = store
        .list_files(&FileFilter::with_status(FileStatus::Duplicate))
        .unwrap();
    let links = store.duplicate_links().unwrap();
    assert_eq!(duplicates.len(), 1);
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].file_id, duplicates[0].id);
}

#[test]
fn test_purge_cascades_links() {
    let store = Store::open_in_memory().unwrap();
    let a = store.upsert(&record("/a", 1, 9)).unwrap();
    let b = store.upsert(&record("/b", 1, 9)).unwrap();
    store.commit_duplicate(b, a).unwrap();

    let gone = vec!["/b".to_string()];
    store.mark_missing(&gone).unwrap();
    assert!(store.duplicate_links().unwrap().is_empty());
    store.mark_missing(&gone).unwrap();
    assert_eq!(store.purge_missing(2).unwrap(), 1);
    assert_eq!(store.stats_snapshot().unwrap().total_files, 1);
}

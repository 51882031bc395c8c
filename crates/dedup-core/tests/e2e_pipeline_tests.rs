use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use dedup_core::schedule::{HashScheduler, SizeClass};
use dedup_core::storage::{FileFilter, FileRecord, FileStatus, Store};
use dedup_core::{
    CancelToken, EngineConfig, ProgressReporter, ScanEngine, ScanEvent, ScanOptions,
    ScanOutcome, ScanPhase, ScanProgress, SilentReporter, Workspace,
};
use tempfile::{tempdir, TempDir};

const MIB: usize = 1024 * 1024;

/// Stored path key for a file on disk.
fn key(path: &Path) -> String {
    fs::canonicalize(path)
        .unwrap()
        .to_string_lossy()
        .into_owned()
}

fn workspace_with(root: &Path, config: EngineConfig) -> (TempDir, Workspace) {
    let ws_dir = tempdir().unwrap();
    let ws = Workspace::create(ws_dir.path().join("test.dedup"))
        .unwrap()
        .with_config(config);
    ws.add_directory(root).unwrap();
    (ws_dir, ws)
}

fn scan(ws: &Workspace) -> dedup_core::ScanReport {
    let options = ScanOptions::from_config(ws.config());
    ws.scan(options, &SilentReporter).unwrap()
}

fn file(ws: &Workspace, path: &Path) -> FileRecord {
    let key = key(path);
    ws.query_files(&FileFilter {
        path_contains: Some(key.clone()),
        ..FileFilter::default()
    })
    .unwrap()
    .into_iter()
    .find(|f| f.path == key)
    .unwrap_or_else(|| panic!("{} not indexed", key))
}

fn canonical_count(ws: &Workspace) -> usize {
    ws.query_duplicate_groups().unwrap().len()
}

/// Layout:
///   root/
///     a.bin   (10 MiB, content X)
///     b.bin   (10 MiB, content X)  ← duplicate of a.bin
///     c.bin   (10 MiB, content Y)
fn create_abc_tree(root: &Path) {
    fs::create_dir_all(root).unwrap();
    let x = vec![0x58u8; 10 * MIB];
    let y = vec![0x59u8; 10 * MIB];
    fs::write(root.join("a.bin"), &x).unwrap();
    fs::write(root.join("b.bin"), &x).unwrap();
    fs::write(root.join("c.bin"), &y).unwrap();
}

#[test]
fn test_abc_scenario() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_abc_tree(&root);
    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());

    let report = scan(&ws);
    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.files_seen, 3);
    assert_eq!(report.duplicates_found, 1);

    let a = file(&ws, &root.join("a.bin"));
    let b = file(&ws, &root.join("b.bin"));
    let c = file(&ws, &root.join("c.bin"));
    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(a.confirmation(), b.confirmation());
    assert!(a.confirmation().is_some());
    let statuses = [a.status, b.status];
    assert!(statuses.contains(&FileStatus::Present));
    assert!(statuses.contains(&FileStatus::Duplicate));
    assert_eq!(c.status, FileStatus::Present);
    assert_eq!(ws.stats().unwrap().duplicate_groups, 1);
}

#[test]
fn test_identical_files_share_one_canonical() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    for dir in ["one", "two", "three"] {
        fs::create_dir_all(root.join(dir)).unwrap();
        fs::write(root.join(dir).join("copy.txt"), "shared content xyz").unwrap();
    }
    fs::write(root.join("unique.txt"), "unique content").unwrap();
    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());

    scan(&ws);

    let groups = ws.query_duplicate_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].duplicates.len(), 2);
    assert_eq!(groups[0].canonical.status, FileStatus::Present);
    for dup in &groups[0].duplicates {
        assert_eq!(dup.status, FileStatus::Duplicate);
        assert_ne!(dup.id, groups[0].canonical.id);
    }
}

#[test]
fn test_fingerprint_collision_stays_present() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    // same head, same tail, different middle
    let mut content = vec![1u8; 4096];
    fs::write(root.join("left.bin"), &content).unwrap();
    content[2048] = 2;
    fs::write(root.join("right.bin"), &content).unwrap();

    let config = EngineConfig {
        fingerprint_sample_bytes: 64,
        ..EngineConfig::default()
    };
    let (_ws_dir, ws) = workspace_with(&root, config);
    let report = scan(&ws);

    let left = file(&ws, &root.join("left.bin"));
    let right = file(&ws, &root.join("right.bin"));
    assert_eq!(left.fingerprint, right.fingerprint, "sampled fingerprints collide");
    assert_ne!(left.confirmation(), right.confirmation());
    assert_eq!(left.status, FileStatus::Present);
    assert_eq!(right.status, FileStatus::Present);
    assert_eq!(report.duplicates_found, 0);
    assert_eq!(canonical_count(&ws), 0);
}

#[test]
fn test_rescan_without_changes_is_idempotent() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_abc_tree(&root);
    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());

    scan(&ws);
    let before = ws.query_files(&FileFilter::default()).unwrap();
    let stats_before = ws.stats().unwrap();

    let report = scan(&ws);
    let after = ws.query_files(&FileFilter::default()).unwrap();

    assert_eq!(report.files_hashed, 0, "unchanged files must not be rehashed");
    assert_eq!(report.duplicates_found, 0);
    assert_eq!(ws.stats().unwrap(), stats_before);
    assert_eq!(before.len(), after.len());
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.path, new.path);
        assert_eq!(old.status, new.status);
        assert_eq!(old.fingerprint, new.fingerprint);
        assert_eq!(old.confirmation(), new.confirmation());
        assert_eq!(old.first_seen, new.first_seen);
    }
}

#[test]
fn test_missing_file_lifecycle_and_purge() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("keep.txt"), "keep").unwrap();
    fs::write(root.join("gone.txt"), "gone").unwrap();
    let gone_key = key(&root.join("gone.txt"));

    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());
    scan(&ws);
    fs::remove_file(root.join("gone.txt")).unwrap();

    let find_gone = |ws: &Workspace| {
        ws.query_files(&FileFilter::default())
            .unwrap()
            .into_iter()
            .find(|f| f.path == gone_key)
    };

    let report = scan(&ws);
    assert_eq!(report.missing_marked, 1);
    let record = find_gone(&ws).unwrap();
    assert_eq!(record.status, FileStatus::Missing);
    assert_eq!(record.missing_scans, 1);
    assert_eq!(ws.stats().unwrap().total_files, 1);

    let report = scan(&ws);
    assert_eq!(report.missing_marked, 0, "already missing");
    assert_eq!(find_gone(&ws).unwrap().missing_scans, 2);

    let report = scan(&ws);
    assert_eq!(report.purged, 1);
    assert!(find_gone(&ws).is_none());
}

#[test]
fn test_reappearing_file_is_reconciled() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("a.txt"), "same").unwrap();
    fs::write(root.join("b.txt"), "same").unwrap();

    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());
    scan(&ws);
    fs::rename(root.join("b.txt"), tmp.path().join("b.txt")).unwrap();
    scan(&ws);
    assert_eq!(canonical_count(&ws), 0);

    fs::rename(tmp.path().join("b.txt"), root.join("b.txt")).unwrap();
    scan(&ws);
    let b = file(&ws, &root.join("b.txt"));
    assert_eq!(b.status, FileStatus::Duplicate);
    assert_eq!(b.missing_scans, 0);
    assert_eq!(canonical_count(&ws), 1);
}

#[test]
fn test_missing_canonical_promotes_earliest_duplicate() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    for name in ["a.txt", "b.txt", "c.txt"] {
        fs::write(root.join(name), "triplicate").unwrap();
    }

    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());
    scan(&ws);
    let groups = ws.query_duplicate_groups().unwrap();
    let canonical_path = PathBuf::from(&groups[0].canonical.path);
    fs::remove_file(&canonical_path).unwrap();

    scan(&ws);
    let groups = ws.query_duplicate_groups().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].duplicates.len(), 1);
    assert_eq!(groups[0].canonical.status, FileStatus::Present);
    assert_ne!(PathBuf::from(&groups[0].canonical.path), canonical_path);
}

#[test]
fn test_changed_canonical_leaves_group() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("a.txt"), "original").unwrap();
    fs::write(root.join("b.txt"), "original").unwrap();

    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());
    scan(&ws);
    let canonical = PathBuf::from(&ws.query_duplicate_groups().unwrap()[0].canonical.path);
    fs::write(&canonical, "rewritten with other content").unwrap();

    scan(&ws);
    assert_eq!(canonical_count(&ws), 0);
    assert!(ws
        .query_files(&FileFilter::with_status(FileStatus::Duplicate))
        .unwrap()
        .is_empty());
    let changed = file(&ws, &canonical);
    assert_eq!(changed.size, "rewritten with other content".len() as u64);
}

/// Cancels once `after` chunks have reported progress.
struct CancelAfter {
    token: CancelToken,
    after: usize,
    seen: AtomicUsize,
}

impl ProgressReporter for CancelAfter {
    fn on_progress(&self, _progress: &ScanProgress) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
    }
}

#[test]
fn test_cancel_keeps_committed_chunks() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    for i in 0..10 {
        fs::write(root.join(format!("f{:02}.txt", i)), format!("content {}", i)).unwrap();
    }

    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());
    let options = ScanOptions {
        chunk_size: 2,
        ..ScanOptions::from_config(ws.config())
    };
    let reporter = CancelAfter {
        token: ws.cancel_token(),
        after: 2,
        seen: AtomicUsize::new(0),
    };

    let report = ws.scan(options, &reporter).unwrap();
    assert_eq!(report.outcome, ScanOutcome::Cancelled);
    assert_eq!(report.chunks_committed, 2);
    assert_eq!(report.missing_marked, 0);
    assert_eq!(ws.stats().unwrap().total_files, 4);
    assert!(ws.metadata().unwrap().last_scan.is_none());

    let report = ws.scan(options, &SilentReporter).unwrap();
    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(ws.stats().unwrap().total_files, 10);
    assert!(ws.metadata().unwrap().last_scan.is_some());
}

#[test]
fn test_background_scan_streams_events() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    create_abc_tree(&root);
    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());

    let handle = ws.start_scan(ScanOptions::from_config(ws.config())).unwrap();
    assert!(matches!(
        ws.start_scan(ScanOptions::from_config(ws.config())),
        Err(dedup_core::Error::ScanInProgress)
    ));

    let mut phases = Vec::new();
    let mut last_progress = None;
    let mut finished = None;
    for event in handle.events().iter() {
        match event {
            ScanEvent::Phase(phase) => phases.push(phase),
            ScanEvent::Progress(progress) => last_progress = Some(progress),
            ScanEvent::Skipped(_) => {}
            ScanEvent::Finished(report) => {
                finished = Some(report);
                break;
            }
        }
    }
    let report = handle.join().unwrap();

    assert_eq!(finished.unwrap().outcome, ScanOutcome::Completed);
    assert_eq!(report.duplicates_found, 1);
    assert_eq!(phases.last(), Some(&ScanPhase::Completed));
    let progress = last_progress.unwrap();
    assert_eq!(progress.phase, ScanPhase::Completed);
    assert_eq!(progress.files_seen, 3);
    assert_eq!(progress.duplicates_found, 1);
    assert!(!ws.is_scanning());

    let reader = ws.reader().unwrap();
    assert_eq!(reader.stats_snapshot().unwrap().duplicate_groups, 1);
}

#[cfg(unix)]
#[test]
fn test_unreadable_file_is_skipped_not_fatal() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("ok.txt"), "fine").unwrap();
    let locked = root.join("locked.txt");
    fs::write(&locked, "secret").unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

    // root can read anything; nothing to check then
    if fs::File::open(&locked).is_ok() {
        return;
    }

    let (_ws_dir, ws) = workspace_with(&root, EngineConfig::default());
    let report = scan(&ws);
    assert_eq!(report.outcome, ScanOutcome::Completed);
    assert_eq!(report.errors_skipped, 1);
    assert_eq!(ws.stats().unwrap().total_files, 1);
}

#[cfg(unix)]
#[test]
fn test_unreadable_directory_keeps_its_files() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    let sub = root.join("sub");
    fs::create_dir_all(&sub).unwrap();
    fs::write(root.join("top.txt"), "top level").unwrap();
    fs::write(sub.join("kept.txt"), "inside sub").unwrap();

    let config = EngineConfig {
        missing_scans_before_purge: 2,
        ..EngineConfig::default()
    };
    let (_ws_dir, ws) = workspace_with(&root, config);
    scan(&ws);
    let kept = file(&ws, &sub.join("kept.txt"));

    fs::set_permissions(&sub, fs::Permissions::from_mode(0o000)).unwrap();
    if fs::read_dir(&sub).is_ok() {
        // running as root: permissions are not enforced
        fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    for _ in 0..3 {
        let report = scan(&ws);
        assert_eq!(report.outcome, ScanOutcome::Completed);
        assert_eq!(report.errors_skipped, 1);
        assert_eq!(report.missing_marked, 0);
        assert_eq!(report.purged, 0);
    }
    let missing = ws
        .query_files(&FileFilter {
            status: Some(FileStatus::Missing),
            ..FileFilter::default()
        })
        .unwrap();
    assert!(missing.is_empty(), "unexpected missing files: {:?}", missing);
    assert_eq!(ws.stats().unwrap().total_files, 2);

    fs::set_permissions(&sub, fs::Permissions::from_mode(0o755)).unwrap();
    let report = scan(&ws);
    assert_eq!(report.errors_skipped, 0);
    let again = file(&ws, &sub.join("kept.txt"));
    assert_eq!(again.id, kept.id);
    assert_eq!(again.status, FileStatus::Present);
}

#[test]
fn test_sampled_fingerprints_feed_large_class_stats() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    for i in 0..4u8 {
        fs::write(root.join(format!("big{}.bin", i)), vec![i; 3 * MIB]).unwrap();
    }

    let config = EngineConfig {
        initial_large_threshold: 2 * MIB as u64,
        ..EngineConfig::default()
    };
    let (_ws_dir, ws) = workspace_with(&root, config);
    assert_eq!(ws.scheduler().stat(SizeClass::Large).samples, 0);

    let report = scan(&ws);
    assert_eq!(report.files_hashed, 4);
    assert_eq!(report.duplicates_found, 0);
    let large = ws.scheduler().stat(SizeClass::Large);
    assert_eq!(large.samples, 4);
    assert!(large.bytes_per_sec > 0.0);
}

/// After `after` committed chunks, installs a trigger through a second
/// connection that makes further inserts into `files` fail once the table
/// holds `limit` rows.
struct BreakStoreAfter {
    path: PathBuf,
    after: usize,
    limit: usize,
    seen: AtomicUsize,
}

impl ProgressReporter for BreakStoreAfter {
    fn on_progress(&self, _progress: &ScanProgress) {
        if self.seen.fetch_add(1, Ordering::SeqCst) + 1 != self.after {
            return;
        }
        let conn = rusqlite::Connection::open(&self.path).unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER fail_inserts BEFORE INSERT ON files
             WHEN (SELECT COUNT(*) FROM files) >= {}
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            self.limit
        ))
        .unwrap();
    }
}

#[test]
fn test_store_failure_rolls_back_open_chunk() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(&root).unwrap();
    for i in 0..8 {
        fs::write(root.join(format!("f{:02}.txt", i)), format!("content {}", i)).unwrap();
    }

    let db_path = tmp.path().join("broken.dedup");
    let store = Store::create(&db_path, "broken").unwrap();
    let config = EngineConfig::default();
    let scheduler = HashScheduler::new(&config);
    let options = ScanOptions {
        chunk_size: 2,
        ..ScanOptions::from_config(&config)
    };
    // two chunks of two files commit; the third chunk writes one row, then fails
    let reporter = BreakStoreAfter {
        path: db_path.clone(),
        after: 2,
        limit: 5,
        seen: AtomicUsize::new(0),
    };

    let mut engine = ScanEngine::new(config.clone());
    let err = engine
        .scan(&store, &scheduler, &[root.clone()], &options, &reporter)
        .unwrap_err();

    assert!(matches!(err, dedup_core::Error::Database(_)), "{:?}", err);
    assert_eq!(engine.state(), ScanPhase::Idle);
    assert_eq!(reporter.seen.load(Ordering::SeqCst), 2);

    let reader = Store::open_read_only(&db_path).unwrap();
    let stats = reader.stats_snapshot().unwrap();
    assert_eq!(stats.total_files, 4);
    assert!(reader.metadata().unwrap().last_scan.is_none());
    let indexed = reader.list_files(&FileFilter::default()).unwrap();
    assert_eq!(indexed.len(), 4);
    assert!(indexed.iter().all(|f| f.status == FileStatus::Present));
}

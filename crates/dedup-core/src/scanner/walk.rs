use super::{FileDescriptor, ScanBatches, SkipEvent, SkipReason, WalkItem};
use crate::config::{non_overlapping_directories, EngineConfig};
use crate::error::{Error, Result};
use crate::platform::{file_id, modified_secs, FileId};
use crossbeam_channel::{bounded, Sender};
use glob::Pattern;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Recursive, parallel directory walker.
#[derive(Debug, Clone)]
pub struct Scanner {
    threads: usize,
    follow_symlinks: bool,
    skip_empty_files: bool,
    ignore_patterns: Vec<Pattern>,
}

/// Directories between a root and the current one. Shared by siblings.
struct Ancestry {
    id: FileId,
    parent: Option<Arc<Ancestry>>,
}

impl Ancestry {
    fn contains(chain: &Option<Arc<Ancestry>>, id: &FileId) -> bool {
        let mut node = chain.as_deref();
        while let Some(current) = node {
            if &current.id == id {
                return true;
            }
            node = current.parent.as_deref();
        }
        false
    }
}

struct WalkContext {
    sender: Sender<WalkItem>,
    stop: Arc<AtomicBool>,
    follow_symlinks: bool,
    skip_empty_files: bool,
    ignore_patterns: Vec<Pattern>,
}

impl WalkContext {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Returns false once the consumer has gone away.
    fn emit(&self, item: WalkItem) -> bool {
        if self.stopped() {
            return false;
        }
        if self.sender.send(item).is_err() {
            self.stop.store(true, Ordering::Relaxed);
            return false;
        }
        true
    }

    fn skip(&self, path: &Path, reason: SkipReason) -> bool {
        warn!("Skipping {} ({})", path.display(), reason);
        self.emit(WalkItem::Skip(SkipEvent::new(path, reason)))
    }

    fn is_ignored(&self, path: &Path) -> bool {
        self.ignore_patterns
            .iter()
            .any(|pattern| pattern.matches_path(path))
    }
}

impl Scanner {
    pub fn new(config: &EngineConfig) -> Self {
        let ignore_patterns = config
            .ignore_patterns
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(p) => Some(p),
                Err(e) => {
                    error!("Invalid glob pattern '{}': {}", glob, e);
                    None
                }
            })
            .collect();

        Self {
            threads: num_cpus::get().min(config.scan_threads).max(1),
            follow_symlinks: config.follow_symlinks,
            skip_empty_files: config.skip_empty_files,
            ignore_patterns,
        }
    }

    /// Walk `directories` and yield batches of at most `chunk_size` files.
    ///
    /// Traversal runs in the background and is throttled by a bounded queue, so
    /// memory stays proportional to `chunk_size` regardless of tree size.
    pub fn scan(&self, directories: &[PathBuf], chunk_size: usize) -> Result<ScanBatches> {
        let chunk_size = chunk_size.max(1);
        let (sender, receiver) = bounded(chunk_size.max(64));
        let stop = Arc::new(AtomicBool::new(false));

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("dedup-walk-{}", i))
            .build()
            .map_err(|e| Error::Other(format!("failed to start walker pool: {}", e)))?;

        let mut roots = Vec::new();
        let mut root_skips = Vec::new();
        for dir in directories {
            match fs::canonicalize(dir) {
                Ok(root) if root.is_dir() => roots.push(root),
                Ok(root) => root_skips.push(SkipEvent::new(
                    root,
                    SkipReason::Io("not a directory".to_string()),
                )),
                Err(e) => root_skips.push(SkipEvent::new(dir, SkipReason::from_io(&e))),
            }
        }
        let roots = non_overlapping_directories(roots);
        debug!(
            "Walking {} root(s) on {} thread(s), chunk size {}",
            roots.len(),
            self.threads,
            chunk_size
        );

        let context = WalkContext {
            sender,
            stop: Arc::clone(&stop),
            follow_symlinks: self.follow_symlinks,
            skip_empty_files: self.skip_empty_files,
            ignore_patterns: self.ignore_patterns.clone(),
        };

        let producer = std::thread::Builder::new()
            .name("dedup-scan".into())
            .spawn(move || {
                for skip in root_skips {
                    if !context.skip(&skip.path, skip.reason) {
                        return;
                    }
                }
                let context = &context;
                pool.scope(|scope| {
                    for root in roots {
                        scope.spawn(move |scope| {
                            let chain = match fs::metadata(&root) {
                                Ok(meta) => Some(Arc::new(Ancestry {
                                    id: file_id(&root, &meta),
                                    parent: None,
                                })),
                                Err(e) => {
                                    context.skip(&root, SkipReason::from_io(&e));
                                    return;
                                }
                            };
                            visit_dir(scope, context, root, chain);
                        });
                    }
                });
            })?;

        Ok(ScanBatches::new(receiver, stop, producer, chunk_size))
    }
}

fn visit_dir<'s>(
    scope: &rayon::Scope<'s>,
    context: &'s WalkContext,
    dir: PathBuf,
    chain: Option<Arc<Ancestry>>,
) {
    if context.stopped() {
        return;
    }

    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) => {
            context.skip(&dir, SkipReason::from_io(&e));
            return;
        }
    };

    for entry in entries {
        if context.stopped() {
            return;
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if !context.skip(&dir, SkipReason::from_io(&e)) {
                    return;
                }
                continue;
            }
        };

        let path = entry.path();
        if context.is_ignored(&path) {
            trace!("Ignoring {}", path.display());
            continue;
        }

        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(e) => {
                context.skip(&path, SkipReason::from_io(&e));
                continue;
            }
        };

        let metadata = if file_type.is_symlink() {
            if !context.follow_symlinks {
                trace!("Not following symlink {}", path.display());
                continue;
            }
            fs::metadata(&path)
        } else {
            entry.metadata()
        };
        let metadata = match metadata {
            Ok(metadata) => metadata,
            Err(e) => {
                context.skip(&path, SkipReason::from_io(&e));
                continue;
            }
        };

        if metadata.is_dir() {
            let id = file_id(&path, &metadata);
            if Ancestry::contains(&chain, &id) {
                context.skip(&path, SkipReason::SymlinkLoop);
                continue;
            }
            let child_chain = Some(Arc::new(Ancestry {
                id,
                parent: chain.clone(),
            }));
            scope.spawn(move |scope| visit_dir(scope, context, path, child_chain));
        } else if metadata.is_file() {
            let size = metadata.len();
            if size == 0 && context.skip_empty_files {
                continue;
            }
            let file = FileDescriptor {
                path,
                size,
                modified: modified_secs(&metadata),
            };
            if !context.emit(WalkItem::File(file)) {
                return;
            }
        }
    }
}

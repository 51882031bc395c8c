use crate::config::EngineConfig;
use crate::engine::{CancelToken, ScanEngine, ScanOptions, ScanReport};
use crate::error::{Error, Result};
use crate::platform::path_key;
use crate::progress::{ChannelReporter, ProgressReporter, ScanEvent};
use crate::schedule::HashScheduler;
use crate::storage::{
    DirectoryEntry, DuplicateGroup, FileFilter, FileRecord, StatsSnapshot, Store,
    WorkspaceMetadata,
};
use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::info;

/// One persisted scan set and everything learned about it.
///
/// The workspace keeps its own connection for queries and directory edits.
/// Every scan opens a separate writer connection, so readers keep working
/// while a scan runs and only ever see committed chunks.
pub struct Workspace {
    path: PathBuf,
    store: Mutex<Store>,
    config: EngineConfig,
    scheduler: Arc<HashScheduler>,
    cancel: CancelToken,
    scanning: Arc<AtomicBool>,
}

/// Clears the running flag when a scan ends, however it ends.
struct ScanGuard(Arc<AtomicBool>);

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A scan running on a background thread.
pub struct ScanHandle {
    cancel: CancelToken,
    events: Receiver<ScanEvent>,
    thread: JoinHandle<Result<ScanReport>>,
}

impl ScanHandle {
    /// Ask the scan to stop after the chunk in flight.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn events(&self) -> &Receiver<ScanEvent> {
        &self.events
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the scan and return its report or fatal error.
    pub fn join(self) -> Result<ScanReport> {
        self.thread
            .join()
            .map_err(|_| Error::Other("scan thread panicked".to_string()))?
    }
}

impl Workspace {
    /// Create a new workspace file at `path`. Fails if the file exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "workspace".to_string());
        let store = Store::create(path, &name)?;
        info!("Created workspace '{}' at {}", name, path.display());
        Ok(Self::from_store(path, store))
    }

    /// Open an existing workspace file. A corrupt file is reported, never rebuilt.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let store = Store::open(path)?;
        info!("Opened workspace {}", path.display());
        Ok(Self::from_store(path, store))
    }

    fn from_store(path: &Path, store: Store) -> Self {
        let config = EngineConfig::default();
        Self {
            path: path.to_path_buf(),
            store: Mutex::new(store),
            scheduler: Arc::new(HashScheduler::new(&config)),
            config,
            cancel: CancelToken::new(),
            scanning: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the engine configuration. Resets what the scheduler has learned.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.scheduler = Arc::new(HashScheduler::new(&config));
        self.config = config;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &HashScheduler {
        &self.scheduler
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    fn ensure_idle(&self) -> Result<()> {
        if self.is_scanning() {
            return Err(Error::ScanInProgress);
        }
        Ok(())
    }

    /// Add a directory to the scan set. Returns false when it was already there.
    pub fn add_directory(&self, dir: impl AsRef<Path>) -> Result<bool> {
        self.ensure_idle()?;
        let dir = fs::canonicalize(dir.as_ref())?;
        if !dir.is_dir() {
            return Err(Error::Other(format!("{} is not a directory", dir.display())));
        }
        let added = self.store.lock().add_directory(&path_key(&dir))?;
        if added {
            info!("Added directory {}", dir.display());
        }
        Ok(added)
    }

    /// Remove a directory from the scan set. Indexed files are kept.
    pub fn remove_directory(&self, dir: impl AsRef<Path>) -> Result<bool> {
        self.ensure_idle()?;
        let dir = dir.as_ref();
        let store = self.store.lock();
        if store.remove_directory(&path_key(dir))? {
            return Ok(true);
        }
        match fs::canonicalize(dir) {
            Ok(resolved) => store.remove_directory(&path_key(&resolved)),
            Err(_) => Ok(false),
        }
    }

    pub fn directories(&self) -> Result<Vec<DirectoryEntry>> {
        self.store.lock().list_directories()
    }

    fn scan_roots(&self) -> Result<Vec<PathBuf>> {
        let roots: Vec<PathBuf> = self
            .directories()?
            .into_iter()
            .map(|d| PathBuf::from(d.path))
            .collect();
        if roots.is_empty() {
            return Err(Error::NoDirectories);
        }
        Ok(roots)
    }

    fn begin_scan(&self) -> Result<ScanGuard> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::ScanInProgress);
        }
        self.cancel.reset();
        Ok(ScanGuard(Arc::clone(&self.scanning)))
    }

    /// Scan on the calling thread.
    pub fn scan(&self, options: ScanOptions, reporter: &dyn ProgressReporter) -> Result<ScanReport> {
        let roots = self.scan_roots()?;
        let _guard = self.begin_scan()?;
        let writer = Store::open(&self.path)?;
        let mut engine = ScanEngine::new(self.config.clone()).with_cancel_token(self.cancel.clone());
        engine.scan(&writer, &self.scheduler, &roots, &options, reporter)
    }

    /// Scan on a background thread and stream its events.
    pub fn start_scan(&self, options: ScanOptions) -> Result<ScanHandle> {
        let roots = self.scan_roots()?;
        let guard = self.begin_scan()?;
        let writer = Store::open(&self.path)?;
        let (sender, events) = unbounded();
        let scheduler = Arc::clone(&self.scheduler);
        let mut engine = ScanEngine::new(self.config.clone()).with_cancel_token(self.cancel.clone());

        let thread = thread::Builder::new()
            .name("dedup-engine".into())
            .spawn(move || {
                let _guard = guard;
                let reporter = ChannelReporter::new(sender);
                engine.scan(&writer, &scheduler, &roots, &options, &reporter)
            })?;

        Ok(ScanHandle {
            cancel: self.cancel.clone(),
            events,
            thread,
        })
    }

    /// Cancel the running scan, if any. Committed chunks are kept.
    pub fn cancel_scan(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stats(&self) -> Result<StatsSnapshot> {
        self.store.lock().stats_snapshot()
    }

    pub fn metadata(&self) -> Result<WorkspaceMetadata> {
        self.store.lock().metadata()
    }

    pub fn query_files(&self, filter: &FileFilter) -> Result<Vec<FileRecord>> {
        self.store.lock().list_files(filter)
    }

    pub fn query_duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        self.store.lock().duplicate_groups()
    }

    /// A separate read-only connection, usable from any thread while a scan runs.
    pub fn reader(&self) -> Result<Store> {
        Store::open_read_only(&self.path)
    }
}

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::platform::path_key;
use crate::progress::{ProgressReporter, ScanPhase, ScanProgress};
use crate::reconcile::Reconciler;
use crate::scanner::{Scanner, SkipEvent, SkipReason};
use crate::schedule::{CoreCaps, HashScheduler};
use crate::storage::Store;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Shared cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Per-run scan settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanOptions {
    pub chunk_size: usize,
    pub caps: CoreCaps,
}

impl ScanOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            caps: CoreCaps::from_config(config),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub chunks_committed: usize,
    pub files_seen: u64,
    pub files_hashed: u64,
    pub duplicates_found: u64,
    pub errors_skipped: u64,
    pub missing_marked: usize,
    pub purged: usize,
    pub duration: Duration,
}

/// Drives one scan: walk, hash and reconcile chunk by chunk, then settle the
/// missing-file bookkeeping once the whole tree has been seen.
pub struct ScanEngine {
    config: EngineConfig,
    cancel: CancelToken,
    state: ScanPhase,
}

impl ScanEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
            state: ScanPhase::Idle,
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ScanPhase {
        self.state
    }

    fn enter(&mut self, phase: ScanPhase, reporter: &dyn ProgressReporter) {
        if self.state != phase {
            debug!("Scan phase {} -> {}", self.state.label(), phase.label());
            self.state = phase;
            reporter.on_phase(phase);
        }
    }

    /// Scan `directories` into `store`.
    ///
    /// Each chunk is committed in its own transaction before the next one
    /// starts. A cancelled scan keeps every committed chunk and marks nothing
    /// missing. A store failure rolls back the open chunk and is returned.
    pub fn scan(
        &mut self,
        store: &Store,
        scheduler: &HashScheduler,
        directories: &[PathBuf],
        options: &ScanOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanReport> {
        if directories.is_empty() {
            return Err(Error::NoDirectories);
        }
        let result = self.run(store, scheduler, directories, options, reporter);
        if let Err(e) = &result {
            error!("Scan aborted: {}", e);
            self.state = ScanPhase::Idle;
        }
        result
    }

    fn run(
        &mut self,
        store: &Store,
        scheduler: &HashScheduler,
        directories: &[PathBuf],
        options: &ScanOptions,
        reporter: &dyn ProgressReporter,
    ) -> Result<ScanReport> {
        let started = Instant::now();
        let epoch = store.begin_scan_epoch()?;
        info!(
            "Scan {} started over {} director{}",
            epoch,
            directories.len(),
            if directories.len() == 1 { "y" } else { "ies" }
        );

        let config = self.config.clone();
        let reconciler = Reconciler::new(scheduler, &config, options.caps);
        let scanner = Scanner::new(&config);
        let mut progress = ScanProgress::default();
        let mut unverified: Vec<String> = Vec::new();
        let mut chunks_committed = 0usize;
        let mut cancelled = false;

        self.enter(ScanPhase::Scanning, reporter);
        for batch in scanner.scan(directories, options.chunk_size)? {
            for skip in &batch.skipped {
                reporter.on_skip(skip);
                if hides_existing_files(skip) {
                    unverified.push(path_key(&skip.path));
                }
            }
            progress.errors_skipped += batch.skipped.len() as u64;

            self.enter(ScanPhase::Hashing, reporter);
            let prepared = reconciler.prepare(store, batch.files)?;

            self.enter(ScanPhase::Reconciling, reporter);
            let outcome = store.in_transaction(|tx| reconciler.apply(tx, prepared, epoch))?;
            chunks_committed += 1;

            for skip in &outcome.skipped {
                reporter.on_skip(skip);
            }
            progress.phase = self.state;
            progress.files_seen += outcome.files_seen as u64;
            progress.files_hashed += outcome.files_hashed as u64;
            progress.duplicates_found += outcome.duplicates_found as u64;
            progress.errors_skipped += outcome.skipped.len() as u64;
            if outcome.last_path.is_some() {
                progress.current = outcome.last_path;
            }
            reporter.on_progress(&progress);
            debug!(
                "Chunk {} committed: {} seen, {} unchanged, {} hashed, {} duplicate(s)",
                chunks_committed,
                outcome.files_seen,
                outcome.unchanged,
                outcome.files_hashed,
                outcome.duplicates_found
            );

            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            self.enter(ScanPhase::Scanning, reporter);
        }

        let mut missing_marked = 0;
        let mut purged = 0;
        let outcome = if cancelled {
            self.enter(ScanPhase::Cancelling, reporter);
            info!(
                "Scan cancelled after {} chunk(s); committed results kept",
                chunks_committed
            );
            ScanOutcome::Cancelled
        } else {
            let roots = resolved_roots(directories);
            let purge_after = config.missing_scans_before_purge;
            if !unverified.is_empty() {
                debug!(
                    "{} unreadable path(s) excluded from the missing pass",
                    unverified.len()
                );
            }
            (missing_marked, purged) = store.in_transaction(|tx| {
                let unseen: Vec<String> = tx
                    .unseen_files(epoch)?
                    .into_iter()
                    .map(|f| f.path)
                    .filter(|path| missing_candidate(path, &roots, &unverified))
                    .collect();
                let marked = tx.mark_missing(&unseen)?;
                let purged = tx.purge_missing(purge_after)?;
                let scanned: Vec<String> = directories.iter().map(|d| path_key(d)).collect();
                tx.mark_directories_scanned(&scanned)?;
                tx.refresh_metadata(true)?;
                Ok((marked, purged))
            })?;
            self.enter(ScanPhase::Completed, reporter);
            ScanOutcome::Completed
        };
        progress.phase = self.state;
        reporter.on_progress(&progress);

        let report = ScanReport {
            outcome,
            chunks_committed,
            files_seen: progress.files_seen,
            files_hashed: progress.files_hashed,
            duplicates_found: progress.duplicates_found,
            errors_skipped: progress.errors_skipped,
            missing_marked,
            purged,
            duration: started.elapsed(),
        };
        info!(
            "Scan {} finished ({:?}) in {:.2}s: {} files, {} hashed, {} duplicates, {} missing, {} purged",
            epoch,
            report.outcome,
            report.duration.as_secs_f64(),
            report.files_seen,
            report.files_hashed,
            report.duplicates_found,
            report.missing_marked,
            report.purged
        );
        reporter.on_finished(&report);
        self.state = ScanPhase::Idle;
        Ok(report)
    }
}

/// Roots as the scanner sees them. Roots that cannot be resolved are left out
/// so an unreachable directory never turns its files missing.
fn resolved_roots(directories: &[PathBuf]) -> Vec<String> {
    directories
        .iter()
        .filter_map(|dir| fs::canonicalize(dir).ok())
        .filter(|dir| dir.is_dir())
        .map(|dir| path_key(&dir))
        .collect()
}

fn path_under(path: &str, root: &str) -> bool {
    std::path::Path::new(path).starts_with(root)
}

/// A skipped entry that may still hold indexed files: an unreadable directory
/// or an entry that could not be stat'ed. Vanished entries are really gone.
fn hides_existing_files(skip: &SkipEvent) -> bool {
    skip.reason != SkipReason::NotFound
}

/// An unseen record is only reported missing when it lies under a resolved
/// root and under no path the walk failed to read.
fn missing_candidate(path: &str, roots: &[String], unverified: &[String]) -> bool {
    roots.iter().any(|root| path_under(path, root))
        && !unverified.iter().any(|skipped| path_under(path, skipped))
}

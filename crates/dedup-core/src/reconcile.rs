//! Decides, per chunk, which files are unique and which duplicate an earlier
//! canonical record, and writes the outcome to the store.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::hasher::{
    confirm_hash, fast_fingerprint, fingerprint_read_len, ConfirmationHash, HashSample,
};
use crate::platform::path_key;
use crate::scanner::{FileDescriptor, SkipEvent, SkipReason};
use crate::schedule::{CoreCaps, HashScheduler, SizedTask};
use crate::storage::{FileRecord, FileStatus, Store};
use ahash::{AHashMap, AHashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Outcome of comparing one file against the canonical records that share its
/// fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No canonical shares the fingerprint.
    Unique,
    /// Fingerprints match but a confirmation hash is not known yet.
    NeedsConfirmation,
    Duplicate { canonical_id: i64 },
    /// Fingerprints match, contents differ.
    CollisionUnique,
}

/// What `decide` needs to know about a canonical record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalView {
    pub id: i64,
    pub fingerprint: u64,
    pub confirmation: Option<ConfirmationHash>,
}

impl CanonicalView {
    fn from_record(record: &FileRecord) -> Option<Self> {
        Some(Self {
            id: record.id,
            fingerprint: record.fingerprint?,
            confirmation: record.confirmation(),
        })
    }
}

/// Pure duplicate decision. `canonicals` must be in first-seen order; the
/// first one with an equal confirmation hash wins.
pub fn decide(
    canonicals: &[CanonicalView],
    fingerprint: u64,
    confirmation: Option<&ConfirmationHash>,
) -> Decision {
    let mut matching = canonicals
        .iter()
        .filter(|c| c.fingerprint == fingerprint)
        .peekable();
    if matching.peek().is_none() {
        return Decision::Unique;
    }
    let Some(own) = confirmation else {
        return Decision::NeedsConfirmation;
    };
    for canonical in matching {
        match &canonical.confirmation {
            Some(theirs) if theirs == own => {
                return Decision::Duplicate {
                    canonical_id: canonical.id,
                }
            }
            Some(_) => {}
            None => return Decision::NeedsConfirmation,
        }
    }
    Decision::CollisionUnique
}

/// Per-chunk counters and skips.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub files_seen: usize,
    pub unchanged: usize,
    pub files_hashed: usize,
    pub duplicates_found: usize,
    pub skipped: Vec<SkipEvent>,
    pub last_path: Option<PathBuf>,
}

struct HashTask {
    key: String,
    path: PathBuf,
    size: u64,
}

impl SizedTask for HashTask {
    fn size(&self) -> u64 {
        self.size
    }
}

struct Fingerprinted {
    key: String,
    file: FileDescriptor,
    fingerprint: u64,
    previous: Option<FileRecord>,
}

/// A chunk after the read-only fingerprint pass, ready to be applied.
#[derive(Default)]
pub struct PreparedChunk {
    files_seen: usize,
    unchanged: Vec<i64>,
    unreadable: Vec<i64>,
    fingerprinted: Vec<Fingerprinted>,
    skipped: Vec<SkipEvent>,
    last_path: Option<PathBuf>,
}

impl PreparedChunk {
    /// Files that were read for a fingerprint.
    pub fn hashed(&self) -> usize {
        self.fingerprinted.len()
    }
}

pub struct Reconciler<'a> {
    scheduler: &'a HashScheduler,
    config: &'a EngineConfig,
    caps: CoreCaps,
}

impl<'a> Reconciler<'a> {
    pub fn new(scheduler: &'a HashScheduler, config: &'a EngineConfig, caps: CoreCaps) -> Self {
        Self {
            scheduler,
            config,
            caps,
        }
    }

    /// Compare the batch against the store and fingerprint every new, changed
    /// or reappearing file. Nothing is written.
    pub fn prepare(&self, store: &Store, files: Vec<FileDescriptor>) -> Result<PreparedChunk> {
        let mut chunk = PreparedChunk {
            files_seen: files.len(),
            last_path: files.last().map(|f| f.path.clone()),
            ..PreparedChunk::default()
        };
        let keys: Vec<String> = files.iter().map(|f| path_key(&f.path)).collect();
        let mut existing = store.files_by_paths(keys.iter().map(String::as_str))?;

        let mut pending = Vec::new();
        for (file, key) in files.into_iter().zip(keys) {
            match existing.remove(&key) {
                Some(record)
                    if record.status != FileStatus::Missing
                        && record.fingerprint.is_some()
                        && record.is_unchanged(file.size, file.modified) =>
                {
                    trace!("Unchanged {}", key);
                    chunk.unchanged.push(record.id);
                }
                previous => pending.push((key, file, previous)),
            }
        }

        let sample_bytes = self.config.fingerprint_sample_bytes;
        let tasks = pending
            .iter()
            .map(|(key, file, _)| HashTask {
                key: key.clone(),
                path: file.path.clone(),
                size: file.size,
            })
            .collect();
        let mut fingerprints: AHashMap<String, io::Result<u64>> = self
            .scheduler
            .dispatch(tasks, self.caps, |task| {
                let started = Instant::now();
                let result = fast_fingerprint(&task.path, task.size, sample_bytes);
                let sample = result.is_ok().then(|| {
                    let read = fingerprint_read_len(task.size, sample_bytes);
                    HashSample::partial(read, task.size, started.elapsed())
                });
                ((task.key.clone(), result), sample)
            })
            .into_iter()
            .collect();

        for (key, file, previous) in pending {
            match fingerprints.remove(&key) {
                Some(Ok(fingerprint)) => chunk.fingerprinted.push(Fingerprinted {
                    key,
                    file,
                    fingerprint,
                    previous,
                }),
                Some(Err(e)) => {
                    let reason = SkipReason::from_io(&e);
                    warn!("Could not fingerprint {}: {}", key, e);
                    // A vanished file is left for the end-of-scan missing pass.
                    if reason != SkipReason::NotFound {
                        if let Some(previous) = &previous {
                            chunk.unreadable.push(previous.id);
                        }
                    }
                    chunk.skipped.push(SkipEvent::new(file.path, reason));
                }
                None => {}
            }
        }
        chunk.fingerprinted.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(chunk)
    }

    /// Write a prepared chunk. Must run inside the chunk transaction.
    pub fn apply(&self, store: &Store, chunk: PreparedChunk, epoch: i64) -> Result<ChunkOutcome> {
        let mut outcome = ChunkOutcome {
            files_seen: chunk.files_seen,
            unchanged: chunk.unchanged.len(),
            files_hashed: chunk.fingerprinted.len(),
            skipped: chunk.skipped,
            last_path: chunk.last_path,
            ..ChunkOutcome::default()
        };

        for id in chunk.unchanged.iter().chain(&chunk.unreadable) {
            store.touch_seen(*id, epoch)?;
        }

        for entry in &chunk.fingerprinted {
            if let Some(previous) = &entry.previous {
                invalidate(store, previous)?;
            }
        }

        let (needs_confirmation, tasks) = self.plan(store, &chunk.fingerprinted)?;
        let mut confirmations = self.confirm_all(tasks);

        for entry in chunk.fingerprinted {
            let mut own = None;
            if needs_confirmation.contains(&entry.key) {
                match confirmations.remove(&entry.key) {
                    Some(Ok(hash)) => own = Some(hash),
                    Some(Err(e)) => {
                        self.skip_unconfirmed(store, &entry, e, epoch, &mut outcome)?;
                        continue;
                    }
                    None => {}
                }
            }

            let canonicals =
                self.canonical_views(store, &entry, &mut confirmations, &mut outcome)?;
            let mut decision = decide(&canonicals, entry.fingerprint, own.as_ref());
            if decision == Decision::NeedsConfirmation && own.is_none() {
                match confirm_hash(&entry.file.path, self.config.hash_buffer_bytes) {
                    Ok(hash) => {
                        decision = decide(&canonicals, entry.fingerprint, Some(&hash));
                        own = Some(hash);
                    }
                    Err(e) => {
                        self.skip_unconfirmed(store, &entry, e, epoch, &mut outcome)?;
                        continue;
                    }
                }
            }

            let mut record = FileRecord::new(entry.key, entry.file.size, entry.file.modified);
            record.fingerprint = Some(entry.fingerprint);
            record.set_confirmation(own.as_ref());
            record.last_seen_scan = epoch;
            let id = store.upsert(&record)?;

            match decision {
                Decision::Duplicate { canonical_id } => {
                    store.commit_duplicate(id, canonical_id)?;
                    outcome.duplicates_found += 1;
                    debug!("{} duplicates file {}", record.path, canonical_id);
                }
                Decision::CollisionUnique => {
                    debug!("Fingerprint collision for {}; contents differ", record.path);
                }
                Decision::Unique | Decision::NeedsConfirmation => {}
            }
        }

        Ok(outcome)
    }

    /// Which files need confirmation hashes: every member of a fingerprint
    /// group that meets a stored canonical or another member of the chunk,
    /// plus stored canonicals that were never confirmed.
    fn plan(
        &self,
        store: &Store,
        entries: &[Fingerprinted],
    ) -> Result<(AHashSet<String>, Vec<HashTask>)> {
        let mut groups: AHashMap<u64, Vec<&Fingerprinted>> = AHashMap::new();
        for entry in entries {
            groups.entry(entry.fingerprint).or_default().push(entry);
        }

        let mut needs = AHashSet::new();
        let mut queued = AHashSet::new();
        let mut tasks = Vec::new();
        for (fingerprint, members) in groups {
            let stored: Vec<FileRecord> = store
                .lookup_by_fingerprint(fingerprint, None)?
                .into_iter()
                .filter(|r| r.status == FileStatus::Present)
                .collect();
            if stored.is_empty() && members.len() < 2 {
                continue;
            }
            for member in members {
                needs.insert(member.key.clone());
                if queued.insert(member.key.clone()) {
                    tasks.push(HashTask {
                        key: member.key.clone(),
                        path: member.file.path.clone(),
                        size: member.file.size,
                    });
                }
            }
            for record in stored.iter().filter(|r| r.confirmation().is_none()) {
                if queued.insert(record.path.clone()) {
                    tasks.push(HashTask {
                        key: record.path.clone(),
                        path: PathBuf::from(&record.path),
                        size: record.size,
                    });
                }
            }
        }
        Ok((needs, tasks))
    }

    fn confirm_all(&self, tasks: Vec<HashTask>) -> AHashMap<String, io::Result<ConfirmationHash>> {
        let buffer = self.config.hash_buffer_bytes;
        self.scheduler
            .dispatch(tasks, self.caps, |task| {
                let started = Instant::now();
                let result = confirm_hash(&task.path, buffer);
                let sample = result
                    .is_ok()
                    .then(|| HashSample::new(task.size, started.elapsed()));
                ((task.key.clone(), result), sample)
            })
            .into_iter()
            .collect()
    }

    /// Present records sharing the entry's fingerprint, first-seen order, each
    /// with a confirmation hash. Hashes missing from the store are taken from
    /// this chunk's confirmation pass or computed now, and persisted.
    fn canonical_views(
        &self,
        store: &Store,
        entry: &Fingerprinted,
        confirmations: &mut AHashMap<String, io::Result<ConfirmationHash>>,
        outcome: &mut ChunkOutcome,
    ) -> Result<Vec<CanonicalView>> {
        let mut views = Vec::new();
        let records = store.lookup_by_fingerprint(entry.fingerprint, Some(&entry.key))?;
        for record in records.into_iter().filter(|r| r.status == FileStatus::Present) {
            let Some(mut view) = CanonicalView::from_record(&record) else {
                continue;
            };
            if view.confirmation.is_none() {
                let computed = match confirmations.remove(&record.path) {
                    Some(result) => result,
                    None => confirm_hash(Path::new(&record.path), self.config.hash_buffer_bytes),
                };
                match computed {
                    Ok(hash) => {
                        store.store_confirmation(record.id, &hash)?;
                        view.confirmation = Some(hash);
                    }
                    Err(e) => {
                        warn!("Could not confirm canonical {}: {}", record.path, e);
                        outcome.skipped.push(SkipEvent::new(
                            PathBuf::from(&record.path),
                            SkipReason::from_io(&e),
                        ));
                        continue;
                    }
                }
            }
            views.push(view);
        }
        Ok(views)
    }

    fn skip_unconfirmed(
        &self,
        store: &Store,
        entry: &Fingerprinted,
        err: io::Error,
        epoch: i64,
        outcome: &mut ChunkOutcome,
    ) -> Result<()> {
        warn!("Could not confirm {}: {}", entry.key, err);
        let reason = SkipReason::from_io(&err);
        if reason != SkipReason::NotFound {
            if let Some(previous) = &entry.previous {
                store.touch_seen(previous.id, epoch)?;
            }
        }
        outcome
            .skipped
            .push(SkipEvent::new(entry.file.path.clone(), reason));
        Ok(())
    }
}

/// Detach a changed or reappearing record from any group before it is
/// reconciled again.
fn invalidate(store: &Store, previous: &FileRecord) -> Result<()> {
    match previous.status {
        FileStatus::Duplicate => {
            store.clear_duplicate_link(previous.id)?;
        }
        FileStatus::Present => {
            store.promote_dependents(previous.id)?;
        }
        FileStatus::Missing => {}
    }
    store.clear_hashes(previous.id)
}

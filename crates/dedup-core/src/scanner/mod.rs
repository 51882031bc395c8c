//! Directory traversal producing bounded batches of file descriptors.

mod walk;

pub use walk::Scanner;

use crossbeam_channel::Receiver;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A regular file observed by the scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub size: u64,
    pub modified: i64,
}

/// Why an entry was left out of a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    PermissionDenied,
    NotFound,
    SymlinkLoop,
    Io(String),
}

impl SkipReason {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => SkipReason::PermissionDenied,
            io::ErrorKind::NotFound => SkipReason::NotFound,
            _ => SkipReason::Io(err.to_string()),
        }
    }

    /// Stable short code for logs and event consumers.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::PermissionDenied => "permission_denied",
            SkipReason::NotFound => "not_found",
            SkipReason::SymlinkLoop => "symlink_loop",
            SkipReason::Io(_) => "io_error",
        }
    }
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Io(msg) => write!(f, "{}: {}", self.code(), msg),
            _ => f.write_str(self.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkipEvent {
    pub path: PathBuf,
    pub reason: SkipReason,
}

impl SkipEvent {
    pub fn new(path: impl Into<PathBuf>, reason: SkipReason) -> Self {
        Self {
            path: path.into(),
            reason,
        }
    }
}

/// Up to `chunk_size` files plus the skips met while collecting them.
#[derive(Debug, Default)]
pub struct ScanBatch {
    pub files: Vec<FileDescriptor>,
    pub skipped: Vec<SkipEvent>,
}

impl ScanBatch {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.skipped.is_empty()
    }
}

pub(crate) enum WalkItem {
    File(FileDescriptor),
    Skip(SkipEvent),
}

/// Lazy, finite stream of batches. Dropping it stops the walk.
pub struct ScanBatches {
    receiver: Option<Receiver<WalkItem>>,
    stop: Arc<AtomicBool>,
    producer: Option<JoinHandle<()>>,
    chunk_size: usize,
}

impl ScanBatches {
    pub(crate) fn new(
        receiver: Receiver<WalkItem>,
        stop: Arc<AtomicBool>,
        producer: JoinHandle<()>,
        chunk_size: usize,
    ) -> Self {
        Self {
            receiver: Some(receiver),
            stop,
            producer: Some(producer),
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Iterator for ScanBatches {
    type Item = ScanBatch;

    fn next(&mut self) -> Option<ScanBatch> {
        let receiver = self.receiver.as_ref()?;
        let mut batch = ScanBatch::default();

        while batch.files.len() < self.chunk_size {
            match receiver.recv() {
                Ok(WalkItem::File(file)) => batch.files.push(file),
                Ok(WalkItem::Skip(skip)) => batch.skipped.push(skip),
                Err(_) => {
                    self.receiver = None;
                    break;
                }
            }
        }

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }
}

impl Drop for ScanBatches {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Blocked senders fail once the receiver is gone.
        self.receiver.take();
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }
}

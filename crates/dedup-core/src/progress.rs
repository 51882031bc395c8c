use crate::engine::ScanReport;
use crate::scanner::SkipEvent;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::path::PathBuf;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ScanPhase {
    #[default]
    Idle,
    Scanning,
    Hashing,
    Reconciling,
    Completed,
    Cancelling,
}

impl ScanPhase {
    pub fn label(self) -> &'static str {
        match self {
            ScanPhase::Idle => "idle",
            ScanPhase::Scanning => "scanning",
            ScanPhase::Hashing => "hashing",
            ScanPhase::Reconciling => "reconciling",
            ScanPhase::Completed => "completed",
            ScanPhase::Cancelling => "cancelling",
        }
    }
}

/// Cumulative counters for the running scan. Every counter only grows.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScanProgress {
    pub phase: ScanPhase,
    pub files_seen: u64,
    pub files_hashed: u64,
    pub duplicates_found: u64,
    pub current: Option<PathBuf>,
    pub errors_skipped: u64,
}

/// Trait for reporting scan progress.
///
/// The CLI implements it with indicatif; background scans forward everything
/// to a channel. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_phase(&self, _phase: ScanPhase) {}
    fn on_progress(&self, _progress: &ScanProgress) {}
    fn on_skip(&self, _skip: &SkipEvent) {}
    fn on_finished(&self, _report: &ScanReport) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Events published by a background scan.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Phase(ScanPhase),
    Progress(ScanProgress),
    Skipped(SkipEvent),
    Finished(ScanReport),
}

/// Forwards reporter callbacks as [`ScanEvent`]s. A closed channel is ignored
/// so a scan keeps going when nobody listens.
pub struct ChannelReporter {
    sender: Sender<ScanEvent>,
}

impl ChannelReporter {
    pub fn new(sender: Sender<ScanEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_phase(&self, phase: ScanPhase) {
        let _ = self.sender.send(ScanEvent::Phase(phase));
    }

    fn on_progress(&self, progress: &ScanProgress) {
        let _ = self.sender.send(ScanEvent::Progress(progress.clone()));
    }

    fn on_skip(&self, skip: &SkipEvent) {
        let _ = self.sender.send(ScanEvent::Skipped(skip.clone()));
    }

    fn on_finished(&self, report: &ScanReport) {
        let _ = self.sender.send(ScanEvent::Finished(report.clone()));
    }
}

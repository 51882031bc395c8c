use dedup_core::scanner::SkipEvent;
use dedup_core::{ProgressReporter, ScanOutcome, ScanPhase, ScanProgress, ScanReport};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// CLI progress reporter: one spinner for the whole scan, its message
/// tracking the current phase and counters.
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        let mut guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        let pb = guard.get_or_insert_with(|| {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::with_template("{spinner:.cyan} [{prefix}] {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
            );
            pb.enable_steady_tick(Duration::from_millis(80));
            pb
        });
        f(pb);
    }

    fn finish_bar(&self) {
        let mut guard = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliReporter {
    fn on_phase(&self, phase: ScanPhase) {
        match phase {
            ScanPhase::Scanning | ScanPhase::Hashing | ScanPhase::Reconciling => {
                self.with_bar(|pb| pb.set_prefix(phase.label()));
            }
            ScanPhase::Cancelling => {
                self.with_bar(|pb| pb.set_message("Cancelling after current chunk..."));
            }
            ScanPhase::Completed | ScanPhase::Idle => {}
        }
    }

    fn on_progress(&self, progress: &ScanProgress) {
        self.with_bar(|pb| {
            pb.set_message(format!(
                "{}... {} files seen, {} hashed, {} duplicates, {} skipped",
                progress.phase.label(),
                progress.files_seen,
                progress.files_hashed,
                progress.duplicates_found,
                progress.errors_skipped
            ))
        });
    }

    fn on_skip(&self, skip: &SkipEvent) {
        self.with_bar(|pb| {
            pb.println(format!("  ! skipped {} ({})", skip.path.display(), skip.reason))
        });
    }

    fn on_finished(&self, report: &ScanReport) {
        self.finish_bar();
        let verb = match report.outcome {
            ScanOutcome::Completed => "Scan complete",
            ScanOutcome::Cancelled => "Scan cancelled",
        };
        eprintln!(
            "  \x1b[32m✓\x1b[0m {}: {} files, {} hashed, {} duplicates in {:.2}s",
            verb,
            report.files_seen,
            report.files_hashed,
            report.duplicates_found,
            report.duration.as_secs_f64()
        );
    }
}

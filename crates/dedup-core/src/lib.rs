pub mod config;
pub mod engine;
pub mod error;
pub mod hasher;
pub mod platform;
pub mod progress;
pub mod reconcile;
pub mod scanner;
pub mod schedule;
pub mod storage;
pub mod workspace;

pub use config::EngineConfig;
pub use engine::{CancelToken, ScanEngine, ScanOptions, ScanOutcome, ScanReport};
pub use error::{Error, Result};
pub use progress::{ProgressReporter, ScanEvent, ScanPhase, ScanProgress, SilentReporter};
pub use schedule::CoreCaps;
pub use workspace::{ScanHandle, Workspace};

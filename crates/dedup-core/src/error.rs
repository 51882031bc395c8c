use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Workspace not found: {}", .0.display())]
    WorkspaceNotFound(PathBuf),

    #[error("Workspace already exists: {}", .0.display())]
    WorkspaceExists(PathBuf),

    #[error("Workspace {} is corrupt: {reason}", .path.display())]
    CorruptWorkspace { path: PathBuf, reason: String },

    #[error("Workspace schema version {found} is not supported (expected {expected})")]
    UnsupportedSchema { found: i64, expected: i64 },

    #[error("A scan is already running for this workspace")]
    ScanInProgress,

    #[error("No directories configured for scanning")]
    NoDirectories,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures that mean the workspace file itself cannot be trusted.
    pub fn is_workspace_open_failure(&self) -> bool {
        matches!(
            self,
            Error::WorkspaceNotFound(_)
                | Error::CorruptWorkspace { .. }
                | Error::UnsupportedSchema { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

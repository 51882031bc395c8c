pub mod models;
mod queries;
mod sqlite;

pub use models::{
    DirectoryEntry, DuplicateGroup, DuplicateLink, FileFilter, FileRecord, FileStatus,
    StatsSnapshot, WorkspaceMetadata,
};
pub use sqlite::{Store, SCHEMA_VERSION};

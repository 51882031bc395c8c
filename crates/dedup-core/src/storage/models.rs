use crate::hasher::ConfirmationHash;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of an indexed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Present,
    Missing,
    Duplicate,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FileStatus::Present => "present",
            FileStatus::Missing => "missing",
            FileStatus::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(FileStatus::Present),
            "missing" => Ok(FileStatus::Missing),
            "duplicate" => Ok(FileStatus::Duplicate),
            other => Err(format!("unknown file status '{}'", other)),
        }
    }
}

impl ToSql for FileStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for FileStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One indexed file. `path` is the identity within a workspace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub size: u64,
    pub modified: i64,
    pub fingerprint: Option<u64>,
    pub confirm_primary: Option<String>,
    pub confirm_secondary: Option<String>,
    pub status: FileStatus,
    pub missing_scans: u32,
    pub last_seen_scan: i64,
    pub first_seen: String,
    pub last_updated: String,
}

impl FileRecord {
    /// A record for a freshly discovered file, not yet persisted.
    pub fn new(path: impl Into<String>, size: u64, modified: i64) -> Self {
        Self {
            id: 0,
            path: path.into(),
            size,
            modified,
            fingerprint: None,
            confirm_primary: None,
            confirm_secondary: None,
            status: FileStatus::Present,
            missing_scans: 0,
            last_seen_scan: 0,
            first_seen: String::new(),
            last_updated: String::new(),
        }
    }

    pub fn confirmation(&self) -> Option<ConfirmationHash> {
        match (&self.confirm_primary, &self.confirm_secondary) {
            (Some(primary), Some(secondary)) => Some(ConfirmationHash {
                primary: primary.clone(),
                secondary: secondary.clone(),
            }),
            _ => None,
        }
    }

    pub fn set_confirmation(&mut self, confirmation: Option<&ConfirmationHash>) {
        self.confirm_primary = confirmation.map(|c| c.primary.clone());
        self.confirm_secondary = confirmation.map(|c| c.secondary.clone());
    }

    /// Same path, size and modification time as an earlier observation.
    pub fn is_unchanged(&self, size: u64, modified: i64) -> bool {
        self.size == size && self.modified == modified
    }
}

/// `file_id` duplicates the canonical record `duplicate_of`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DuplicateLink {
    pub file_id: i64,
    pub duplicate_of: i64,
}

/// A root directory of the workspace scan set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectoryEntry {
    pub id: i64,
    pub path: String,
    pub added_at: String,
    pub last_scanned: Option<String>,
}

/// A canonical file and every record linked to it.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub canonical: FileRecord,
    pub duplicates: Vec<FileRecord>,
    pub wasted_bytes: u64,
}

impl DuplicateGroup {
    pub fn file_count(&self) -> usize {
        self.duplicates.len() + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_files: u64,
    pub total_size: u64,
    pub duplicate_groups: u64,
}

/// Row of the single-row `metadata` table.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceMetadata {
    pub workspace_name: String,
    pub created_at: String,
    pub last_scan: Option<String>,
    pub total_files: u64,
    pub total_size: u64,
    pub duplicate_groups: u64,
    pub scan_count: i64,
}

/// Filter for listing files; all conditions are combined with AND.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub status: Option<FileStatus>,
    pub path_contains: Option<String>,
    pub min_size: Option<u64>,
    pub fingerprint: Option<u64>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FileFilter {
    pub fn with_status(status: FileStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

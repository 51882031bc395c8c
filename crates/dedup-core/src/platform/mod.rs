use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Identity of a directory as seen by the filesystem, used for symlink loop detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileId {
    Inode { device: u64, inode: u64 },
    /// Fallback where device/inode numbers are not available.
    RealPath(PathBuf),
}

#[cfg(unix)]
pub fn file_id(_path: &Path, metadata: &Metadata) -> FileId {
    use std::os::unix::fs::MetadataExt;
    FileId::Inode {
        device: metadata.dev(),
        inode: metadata.ino(),
    }
}

#[cfg(not(unix))]
pub fn file_id(path: &Path, _metadata: &Metadata) -> FileId {
    FileId::RealPath(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()))
}

/// Modification time as whole seconds since the epoch; 0 when unavailable.
pub fn modified_secs(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// String form used as the store key for a path.
pub fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

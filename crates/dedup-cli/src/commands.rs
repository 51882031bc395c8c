use clap::{Args, Parser, Subcommand};
use dedup_core::storage::FileStatus;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dedup")]
#[command(about = "Incremental duplicate file finder", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan the workspace directories, creating the workspace if needed
    Scan(ScanArgs),
    /// List duplicate groups, largest waste first
    ListDuplicates {
        workspace: PathBuf,
        /// Emit JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// Show workspace totals
    Stats { workspace: PathBuf },
    /// Add a directory to the scan set
    AddDir { workspace: PathBuf, dir: PathBuf },
    /// Remove a directory from the scan set (indexed files are kept)
    RemoveDir { workspace: PathBuf, dir: PathBuf },
    /// List indexed files
    ListFiles {
        workspace: PathBuf,
        /// Only files with this status: present, missing or duplicate
        #[arg(long)]
        status: Option<FileStatus>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    pub workspace: PathBuf,
    /// Directories to add to the scan set before scanning
    #[arg(long, num_args = 1..)]
    pub dirs: Vec<PathBuf>,
    /// Files per committed chunk
    #[arg(long)]
    pub chunk_size: Option<usize>,
    /// Upper bound on large-file hashing workers
    #[arg(long)]
    pub large_cores: Option<usize>,
    /// Upper bound on small-file hashing workers
    #[arg(long)]
    pub small_cores: Option<usize>,
}

mod commands;
mod logging;
mod progress;

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, ScanArgs};
use dedup_core::storage::{FileFilter, FileStatus};
use dedup_core::{EngineConfig, ScanOptions, ScanOutcome, Workspace};
use dotenv::dotenv;
use progress::CliReporter;
use tracing::{error, info, warn};

fn main() -> ExitCode {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match dedup_core::config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            return ExitCode::from(1);
        }
    };

    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Scan(scan)) => run_scan(config, scan),
        Some(Commands::ListDuplicates { workspace, json }) => {
            run_list_duplicates(&workspace, json)
        }
        Some(Commands::Stats { workspace }) => run_stats(&workspace),
        Some(Commands::AddDir { workspace, dir }) => open(&workspace).and_then(|ws| {
            if ws.add_directory(&dir)? {
                println!("Added {}", dir.display());
            } else {
                println!("{} is already in the scan set", dir.display());
            }
            Ok(())
        }),
        Some(Commands::RemoveDir { workspace, dir }) => open(&workspace).and_then(|ws| {
            if ws.remove_directory(&dir)? {
                println!("Removed {}", dir.display());
            } else {
                println!("{} is not in the scan set", dir.display());
            }
            Ok(())
        }),
        Some(Commands::ListFiles {
            workspace,
            status,
            limit,
        }) => run_list_files(&workspace, status, limit),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
            Ok(())
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Error: {:#}", err);
            exit_code_for(&err)
        }
    }
}

/// 2 when the workspace file itself cannot be used, 1 for everything else.
fn exit_code_for(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<dedup_core::Error>() {
        Some(e) if e.is_workspace_open_failure() => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

fn open(path: &Path) -> anyhow::Result<Workspace> {
    Workspace::open(path).with_context(|| format!("opening workspace {}", path.display()))
}

fn run_scan(mut config: EngineConfig, args: ScanArgs) -> anyhow::Result<()> {
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(large) = args.large_cores {
        config.large_cores = large;
    }
    if let Some(small) = args.small_cores {
        config.small_cores = small;
    }

    let workspace = if args.workspace.exists() {
        open(&args.workspace)?
    } else {
        info!("Creating workspace {}", args.workspace.display());
        Workspace::create(&args.workspace)?
    };
    let workspace = workspace.with_config(config);

    for dir in &args.dirs {
        workspace
            .add_directory(dir)
            .with_context(|| format!("adding directory {}", dir.display()))?;
    }

    let token = workspace.cancel_token();
    if let Err(e) = ctrlc::set_handler(move || token.cancel()) {
        warn!("Could not install Ctrl+C handler: {}", e);
    }

    let options = ScanOptions::from_config(workspace.config());
    let reporter = CliReporter::new();
    let report = workspace.scan(options, &reporter)?;
    let stats = workspace.stats()?;

    println!();
    if report.outcome == ScanOutcome::Cancelled {
        info!(
            "Cancelled after {} chunk(s); committed results were kept",
            report.chunks_committed
        );
    }
    info!(
        "{} files indexed, {} duplicate groups, {} marked missing, {} purged",
        format!("{}", stats.total_files).green(),
        format!("{}", stats.duplicate_groups).red(),
        format!("{}", report.missing_marked).yellow(),
        format!("{}", report.purged).yellow(),
    );
    Ok(())
}

fn run_list_duplicates(path: &Path, json: bool) -> anyhow::Result<()> {
    let workspace = open(path)?;
    let groups = workspace.query_duplicate_groups()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    for group in &groups {
        println!(
            "{} ({} files, {} bytes wasted)",
            group.canonical.path.green(),
            group.file_count(),
            group.wasted_bytes
        );
        for dup in &group.duplicates {
            println!("    {}", dup.path.red());
        }
    }
    let wasted: u64 = groups.iter().map(|g| g.wasted_bytes).sum();
    println!(
        "{} duplicate groups, {} bytes wasted",
        groups.len(),
        format!("{}", wasted).red()
    );
    Ok(())
}

fn run_stats(path: &Path) -> anyhow::Result<()> {
    let workspace = open(path)?;
    let meta = workspace.metadata()?;
    let stats = workspace.stats()?;
    let directories = workspace.directories()?;

    println!("Workspace:        {}", meta.workspace_name.cyan());
    println!("Created:          {}", meta.created_at);
    println!(
        "Last scan:        {}",
        meta.last_scan.as_deref().unwrap_or("never")
    );
    println!("Scans:            {}", meta.scan_count);
    println!("Files:            {}", stats.total_files);
    println!("Total size:       {} bytes", stats.total_size);
    println!("Duplicate groups: {}", format!("{}", stats.duplicate_groups).red());
    println!("Directories:");
    for dir in directories {
        println!(
            "    {} (last scanned {})",
            dir.path,
            dir.last_scanned.as_deref().unwrap_or("never")
        );
    }
    Ok(())
}

fn run_list_files(
    path: &Path,
    status: Option<FileStatus>,
    limit: Option<usize>,
) -> anyhow::Result<()> {
    let workspace = open(path)?;
    let filter = FileFilter {
        status,
        limit,
        ..FileFilter::default()
    };
    for file in workspace.query_files(&filter)? {
        let status = match file.status {
            FileStatus::Present => file.status.as_str().green(),
            FileStatus::Duplicate => file.status.as_str().red(),
            FileStatus::Missing => file.status.as_str().yellow(),
        };
        println!("{:<10} {:>14} {}", status, file.size, file.path);
    }
    Ok(())
}

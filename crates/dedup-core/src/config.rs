use config::{Config, ConfigError, Environment, File as ConfigFile};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Engine tuning knobs.
///
/// Loaded from built-in defaults, then an optional `Dedup.toml` in the working
/// directory, then `DEDUP_*` environment variables. CLI flags override per run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum files per chunk (one transaction each).
    pub chunk_size: usize,
    /// Upper bound on directory traversal threads.
    pub scan_threads: usize,
    pub follow_symlinks: bool,
    pub skip_empty_files: bool,
    pub ignore_patterns: Vec<String>,
    /// Bytes read from the head and the tail of a file for its fingerprint.
    pub fingerprint_sample_bytes: u64,
    pub hash_buffer_bytes: usize,
    pub initial_large_threshold: u64,
    pub min_large_threshold: u64,
    pub max_large_threshold: u64,
    pub target_latency_secs: f64,
    pub ewma_alpha: f64,
    pub threshold_step_down: f64,
    pub threshold_step_up: f64,
    pub large_cores: usize,
    pub small_cores: usize,
    /// Consecutive completed scans a file may stay missing before its row is removed.
    pub missing_scans_before_purge: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            scan_threads: 8,
            follow_symlinks: false,
            skip_empty_files: true,
            ignore_patterns: Vec::new(),
            fingerprint_sample_bytes: 64 * 1024,
            hash_buffer_bytes: MIB as usize,
            initial_large_threshold: 50 * MIB,
            min_large_threshold: MIB,
            max_large_threshold: 4096 * MIB,
            target_latency_secs: 60.0,
            ewma_alpha: 0.3,
            threshold_step_down: 0.75,
            threshold_step_up: 1.25,
            large_cores: 4,
            small_cores: 8,
            missing_scans_before_purge: 3,
        }
    }
}

impl EngineConfig {
    pub fn target_latency(&self) -> Duration {
        Duration::from_secs_f64(self.target_latency_secs.max(0.0))
    }
}

pub fn load_configuration() -> Result<EngineConfig, ConfigError> {
    let builder = Config::builder()
        .add_source(ConfigFile::with_name("Dedup").required(false))
        .add_source(
            Environment::with_prefix("DEDUP")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ignore_patterns"),
        )
        .build()?;
    builder.try_deserialize::<EngineConfig>()
}

/// Remove directories that are subdirectories of other directories in the list.
pub fn non_overlapping_directories(dirs: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut result: Vec<PathBuf> = Vec::new();

    for dir in dirs {
        let dir_path: &Path = &dir;
        if result.iter().any(|kept| dir_path.starts_with(kept)) {
            continue;
        }
        result.retain(|kept| !kept.starts_with(dir_path));
        result.push(dir);
    }

    result
}

//! Hash workers: a cheap sampled fingerprint for every new or changed file and
//! a two-digest confirmation hash for fingerprint collisions.

mod confirm;
mod fingerprint;

pub use confirm::{confirm_hash, ConfirmationHash};
pub use fingerprint::{fast_fingerprint, fingerprint_read_len, reads_whole_file};

use std::time::Duration;

/// Timing of one completed hash job, fed back to the scheduler.
///
/// `bytes` is what the job actually read; `file_size` is the size of the file
/// it belongs to. They differ for sampled fingerprints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashSample {
    pub bytes: u64,
    pub file_size: u64,
    pub elapsed: Duration,
}

impl HashSample {
    /// A job that read the whole file.
    pub fn new(bytes: u64, elapsed: Duration) -> Self {
        Self {
            bytes,
            file_size: bytes,
            elapsed,
        }
    }

    /// A job that read `bytes` out of a `file_size` byte file.
    pub fn partial(bytes: u64, file_size: u64, elapsed: Duration) -> Self {
        Self {
            bytes,
            file_size: file_size.max(bytes),
            elapsed,
        }
    }

    /// Seconds a full read of the file would take at the observed rate.
    pub fn projected_latency(&self) -> f64 {
        if self.bytes == 0 || self.bytes == self.file_size {
            return self.elapsed.as_secs_f64();
        }
        self.file_size as f64 / self.bytes_per_sec()
    }

    /// Throughput in bytes per second. Zero-length timings count as one microsecond.
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64().max(1e-6);
        self.bytes as f64 / secs
    }
}

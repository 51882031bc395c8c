use std::fs::File;
use std::hash::Hasher as _;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use twox_hash::XxHash64;

/// Whether the fingerprint of a file of `size` bytes covers its whole content.
pub fn reads_whole_file(size: u64, sample_bytes: u64) -> bool {
    size <= sample_bytes.saturating_mul(2)
}

/// Number of bytes `fast_fingerprint` reads from a file of `size` bytes.
pub fn fingerprint_read_len(size: u64, sample_bytes: u64) -> u64 {
    if reads_whole_file(size, sample_bytes) {
        size
    } else {
        sample_bytes.saturating_mul(2)
    }
}

/// XxHash64 of a file, seeded with its size.
///
/// Small files are hashed whole. Larger files contribute their first and last
/// `sample_bytes` bytes only, so equal fingerprints are a hint and never proof.
pub fn fast_fingerprint(path: &Path, size: u64, sample_bytes: u64) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut hasher = XxHash64::with_seed(size);

    if reads_whole_file(size, sample_bytes) {
        feed(&mut hasher, &mut file, size)?;
    } else {
        feed(&mut hasher, &mut file, sample_bytes)?;
        file.seek(SeekFrom::End(-(sample_bytes as i64)))?;
        feed(&mut hasher, &mut file, sample_bytes)?;
    }

    Ok(hasher.finish())
}

fn feed(hasher: &mut XxHash64, file: &mut File, limit: u64) -> io::Result<()> {
    let mut buffer = [0u8; 16 * 1024];
    let mut reader = file.take(limit);
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            return Ok(());
        }
        hasher.write(&buffer[..read]);
    }
}

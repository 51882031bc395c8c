use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Strong content identity: BLAKE3 plus SHA-256, both lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConfirmationHash {
    pub primary: String,
    pub secondary: String,
}

/// Hash the whole file with both digests in a single streaming pass.
pub fn confirm_hash(path: &Path, buffer_bytes: usize) -> io::Result<ConfirmationHash> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; buffer_bytes.max(4096)];
    let mut primary = blake3::Hasher::new();
    let mut secondary = Sha256::new();

    loop {
        let read = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        primary.update(&buffer[..read]);
        secondary.update(&buffer[..read]);
    }

    Ok(ConfirmationHash {
        primary: primary.finalize().to_hex().to_string(),
        secondary: format!("{:x}", secondary.finalize()),
    })
}

//! SHA-256 integrity gate for downloaded artifacts

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUFFER: usize = 64 * 1024;

/// Stream a file through SHA-256 and return the lowercase hex digest
pub fn compute_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Canonical form of a digest for comparison: whitespace removed, lowercase,
/// an optional `sha256:` prefix dropped
pub fn canonical_digest(digest: &str) -> String {
    let compact: String = digest.chars().filter(|c| !c.is_whitespace()).collect();
    let lower = compact.to_ascii_lowercase();
    lower
        .strip_prefix("sha256:")
        .map(str::to_string)
        .unwrap_or(lower)
}

/// True when `value` is a 64 character hex string
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

/// Exact match after normalization. An empty or malformed expectation never matches.
pub fn verify(actual: &str, expected: &str) -> bool {
    let expected = canonical_digest(expected);
    if !is_sha256_hex(&expected) {
        return false;
    }
    canonical_digest(actual) == expected
}

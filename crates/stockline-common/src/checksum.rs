//! Checksum utilities for uploads and idempotency fingerprints

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute a SHA-256 checksum for a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute a SHA-256 checksum for any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Incremental hasher for the request fingerprint stored by the idempotency ledger.
///
/// Each part is framed with its name and byte length so that moving bytes
/// between two files of one request changes the hash.
#[derive(Default)]
pub struct RequestHasher {
    inner: Sha256,
}

impl RequestHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one named payload (usually a file name and its raw bytes)
    pub fn update_part(&mut self, name: &str, payload: &[u8]) {
        self.inner.update((name.len() as u64).to_be_bytes());
        self.inner.update(name.as_bytes());
        self.inner.update((payload.len() as u64).to_be_bytes());
        self.inner.update(payload);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Hash a whole request in one call
pub fn compute_request_hash<'a, I>(parts: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut hasher = RequestHasher::new();
    for (name, payload) in parts {
        hasher.update_part(name, payload);
    }
    hasher.finalize()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_compute_checksum_sha256() {
        let data = b"hello world";
        let mut cursor = Cursor::new(data);
        let checksum = compute_checksum(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_compute_file_checksum() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        let checksum = compute_file_checksum(file.path()).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_request_hash_is_stable() {
        let a = compute_request_hash([("customers_1.ndjson", &b"{}\n"[..])]);
        let b = compute_request_hash([("customers_1.ndjson", &b"{}\n"[..])]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_request_hash_frames_parts() {
        let split = compute_request_hash([("a", &b"xy"[..]), ("b", &b"z"[..])]);
        let moved = compute_request_hash([("a", &b"x"[..]), ("b", &b"yz"[..])]);
        assert_ne!(split, moved);
    }
}

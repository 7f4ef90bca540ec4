//! Content fingerprints used for change detection.
//!
//! A fingerprint is the lower-case hex SHA-256 of the file's bytes. It is
//! stored as object metadata on upload and compared on the next run.

use crate::utils::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Hash a file's content in a single streaming pass.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash a file on the blocking pool.
pub async fn fingerprint_file_async(path: PathBuf) -> Result<String> {
    let fingerprint = tokio::task::spawn_blocking(move || fingerprint_file(&path)).await??;
    Ok(fingerprint)
}

/// Hex fingerprints compare case-insensitively.
pub fn fingerprints_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_known_digest() -> io::Result<()> {
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(b"hello")?;
        temp_file.flush()?;

        assert_eq!(fingerprint_file(temp_file.path())?, HELLO_SHA256);
        assert_eq!(fingerprint_bytes(b"hello"), HELLO_SHA256);
        Ok(())
    }

    #[test]
    fn test_multi_chunk_file_matches_buffer_hash() -> io::Result<()> {
        let data: Vec<u8> = (0..(READ_BUFFER_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(&data)?;
        temp_file.flush()?;

        assert_eq!(fingerprint_file(temp_file.path())?, fingerprint_bytes(&data));
        Ok(())
    }

    #[test]
    fn test_empty_file() -> io::Result<()> {
        let temp_file = NamedTempFile::new()?;
        assert_eq!(
            fingerprint_file(temp_file.path())?,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        Ok(())
    }

    #[test]
    fn test_case_insensitive_match() {
        assert!(fingerprints_match(HELLO_SHA256, &HELLO_SHA256.to_uppercase()));
        assert!(!fingerprints_match(HELLO_SHA256, &fingerprint_bytes(b"world")));
    }

    #[tokio::test]
    async fn test_async_missing_file_is_error() {
        let result = fingerprint_file_async(PathBuf::from("/definitely/not/here")).await;
        assert!(result.is_err());
    }
}

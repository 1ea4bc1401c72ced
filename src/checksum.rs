//! CRC-32 over local files
//!
//! The digest is the standard IEEE 802.3 CRC-32 (reflected polynomial
//! `0xEDB88320`, init and final xor `0xFFFFFFFF`), the same value zlib's
//! `crc32` produces on the server side.

use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Read granularity for streaming files through the digest
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ChecksumError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Streaming CRC-32 calculator
pub struct StreamingChecksum {
    hasher: Hasher,
    bytes_processed: u64,
}

impl StreamingChecksum {
    pub fn new() -> Self {
        Self {
            hasher: Hasher::new(),
            bytes_processed: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes_processed += data.len() as u64;
    }

    pub fn finalize(self) -> u32 {
        self.hasher.finalize()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.bytes_processed
    }
}

impl Default for StreamingChecksum {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute the CRC-32 of a file's full contents without loading it whole.
pub async fn calculate(path: &Path) -> Result<u32, ChecksumError> {
    let read_err = |source| ChecksumError::FileRead {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).await.map_err(read_err)?;
    let mut checksum = StreamingChecksum::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buffer).await.map_err(read_err)?;
        if n == 0 {
            break;
        }
        checksum.update(&buffer[..n]);
    }

    let bytes = checksum.bytes_processed();
    let crc = checksum.finalize();
    debug!("CRC-32 of {} ({} bytes): {:08x}", path.display(), bytes, crc);
    Ok(crc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_check_value() {
        let mut checksum = StreamingChecksum::new();
        checksum.update(b"123456789");
        assert_eq!(checksum.finalize(), 0xCBF4_3926);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(StreamingChecksum::new().finalize(), 0);
    }

    #[test]
    fn test_split_updates_match_single_update() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        let mut whole = StreamingChecksum::new();
        whole.update(&data);

        let mut split = StreamingChecksum::new();
        for chunk in data.chunks(37) {
            split.update(chunk);
        }

        assert_eq!(split.bytes_processed(), data.len() as u64);
        assert_eq!(split.finalize(), whole.finalize());
    }

    #[tokio::test]
    async fn test_calculate_file_across_chunks() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 2 + 123)).map(|i| (i * 7) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        let expected = crc32fast::hash(&data);
        assert_eq!(calculate(file.path()).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_calculate_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.bin");

        let err = calculate(&missing).await.unwrap_err();
        assert!(matches!(err, ChecksumError::FileRead { ref path, .. } if path == &missing));
    }
}

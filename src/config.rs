//! Client configuration: the transfer descriptor and session tuning
//!
//! `transfer.info` is three lines:
//!
//! ```text
//! 127.0.0.1:1234
//! alice
//! /path/to/file.bin
//! ```

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::protocol::FixedName;

pub const DEFAULT_TRANSFER_FILE: &str = "transfer.info";

/// Retry budget after the first failed checksum comparison
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Missing line {line} ({what})")]
    MissingLine { line: usize, what: &'static str },

    #[error("Invalid server address {0:?}: expected host:port")]
    InvalidAddress(String),

    #[error("Invalid port {0:?}")]
    InvalidPort(String),

    #[error("Invalid user name: {0}")]
    InvalidUserName(String),
}

/// Contents of `transfer.info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferInfo {
    pub host: String,
    pub port: u16,
    pub user_name: String,
    pub file_path: PathBuf,
}

impl TransferInfo {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let mut lines = contents.lines().map(str::trim);

        let address = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ConfigError::MissingLine { line: 1, what: "host:port" })?;
        let (host, port) = address
            .rsplit_once(':')
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidAddress(address.to_string()))?;
        let port: u16 = port
            .parse()
            .ok()
            .filter(|&p| p != 0)
            .ok_or_else(|| ConfigError::InvalidPort(port.to_string()))?;

        let user_name = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ConfigError::MissingLine { line: 2, what: "user name" })?;
        FixedName::new(user_name).map_err(|e| ConfigError::InvalidUserName(e.to_string()))?;

        let file_path = lines
            .next()
            .filter(|l| !l.is_empty())
            .ok_or(ConfigError::MissingLine { line: 3, what: "file path" })?;

        Ok(Self {
            host: host.to_string(),
            port,
            user_name: user_name.to_string(),
            file_path: PathBuf::from(file_path),
        })
    }

    /// Address in a form `TcpStream::connect` resolves
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Tuning knobs for one client session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Extra upload attempts after a checksum mismatch
    pub max_retries: u32,
    /// Generate a fresh RSA keypair before every key exchange
    pub rotate_keys_on_exchange: bool,
    /// Draw a progress bar while streaming content
    pub show_progress: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            rotate_keys_on_exchange: false,
            show_progress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let info = TransferInfo::parse("127.0.0.1:1234\nalice\n/tmp/data.bin\n").unwrap();
        assert_eq!(info.host, "127.0.0.1");
        assert_eq!(info.port, 1234);
        assert_eq!(info.user_name, "alice");
        assert_eq!(info.file_path, PathBuf::from("/tmp/data.bin"));
        assert_eq!(info.server_addr(), "127.0.0.1:1234");
    }

    #[test]
    fn test_parse_tolerates_crlf() {
        let info = TransferInfo::parse("files.example.com:8080\r\nbob\r\nreport.pdf\r\n").unwrap();
        assert_eq!(info.host, "files.example.com");
        assert_eq!(info.user_name, "bob");
        assert_eq!(info.file_path, PathBuf::from("report.pdf"));
    }

    #[test]
    fn test_parse_failures() {
        assert!(matches!(
            TransferInfo::parse(""),
            Err(ConfigError::MissingLine { line: 1, .. })
        ));
        assert!(matches!(
            TransferInfo::parse("localhost\nalice\nf"),
            Err(ConfigError::InvalidAddress(_))
        ));
        assert!(matches!(
            TransferInfo::parse("localhost:http\nalice\nf"),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            TransferInfo::parse("localhost:70000\nalice\nf"),
            Err(ConfigError::InvalidPort(_))
        ));
        assert!(matches!(
            TransferInfo::parse("localhost:1234\n"),
            Err(ConfigError::MissingLine { line: 2, .. })
        ));
        assert!(matches!(
            TransferInfo::parse("localhost:1234\nalice\n"),
            Err(ConfigError::MissingLine { line: 3, .. })
        ));
        let long_name = format!("localhost:1234\n{}\nf", "x".repeat(300));
        assert!(matches!(
            TransferInfo::parse(&long_name),
            Err(ConfigError::InvalidUserName(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = TransferInfo::from_file(&dir.path().join("transfer.info")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_session_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.max_retries, 3);
        assert!(!config.rotate_keys_on_exchange);
        assert!(!config.show_progress);
    }
}

//! Secure File Upload
//!
//! Client engine for a binary upload protocol with hybrid encryption.
//!
//! ## Features
//! - Fixed-layout little-endian message codec
//! - RSA-1024 (OAEP/SHA-1) wrapped AES-128 session keys
//! - AES-128-CBC streamed file content
//! - CRC-32 verification with a bounded retry loop
//! - A reference server speaking the same protocol
//!
//! ## Usage
//!
//! ```bash
//! # Start server
//! sfu server --bind 127.0.0.1:1234 --storage ./files
//!
//! # Upload the file named in transfer.info
//! sfu upload --transfer transfer.info --identity me.info
//!
//! # Show the stored identity
//! sfu identity
//! ```

pub mod checksum;
pub mod client;
pub mod config;
pub mod identity;
pub mod keys;
pub mod protocol;
pub mod server;
pub mod transfer;

pub use client::{Client, ClientConfig, ClientError, ClientSession, SessionState, TransferReport};
pub use config::{SessionConfig, TransferInfo};
pub use identity::{ClientIdentity, IdentityStore};
pub use server::{Server, ServerConfig};

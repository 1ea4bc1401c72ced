//! Secure File Upload CLI - Main Entry Point
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                 │
//! │           ┌──────────┐      ┌──────────┐      ┌──────────┐              │
//! │           │  upload  │      │  server  │      │ identity │              │
//! │           └──────────┘      └──────────┘      └──────────┘              │
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Session Controller                               ││
//! │  │  - Register / key exchange      - Upload, verify, retry            ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Crypto & Codec                                   ││
//! │  │  - RSA-1024 OAEP key wrap       - AES-128-CBC content              ││
//! │  │  - Fixed-layout messages        - CRC-32 verification              ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Network Layer (tokio)                            ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use secure_file_upload::client::{format_size, Client, ClientConfig};
use secure_file_upload::config::{
    SessionConfig, TransferInfo, DEFAULT_MAX_RETRIES, DEFAULT_TRANSFER_FILE,
};
use secure_file_upload::identity::{IdentityLoad, IdentityStore, DEFAULT_IDENTITY_FILE};
use secure_file_upload::server::{Server, ServerConfig};

/// Secure File Upload CLI
///
/// Registers with an upload server, exchanges keys and sends one file
/// encrypted, verifying it by CRC-32.
#[derive(Parser)]
#[command(name = "sfu")]
#[command(version = "0.1.0")]
#[command(about = "Encrypted file upload with checksum verification", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload the file named in the transfer descriptor
    Upload {
        /// Transfer descriptor (host:port, user name, file path)
        #[arg(short, long, default_value = DEFAULT_TRANSFER_FILE)]
        transfer: PathBuf,

        /// Identity file
        #[arg(short, long, default_value = DEFAULT_IDENTITY_FILE)]
        identity: PathBuf,

        /// Extra attempts after a checksum mismatch
        #[arg(short, long, default_value_t = DEFAULT_MAX_RETRIES)]
        retries: u32,

        /// Generate a fresh RSA keypair before the key exchange
        #[arg(long)]
        rotate_keys: bool,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,

        /// Print the transfer report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Start the reference upload server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value = "0.0.0.0:1234")]
        bind: SocketAddr,

        /// Storage directory for files
        #[arg(short, long, default_value = "./storage")]
        storage: PathBuf,

        /// Maximum file size in MB
        #[arg(long, default_value = "1024")]
        max_size: u64,
    },

    /// Show the stored identity
    Identity {
        /// Identity file
        #[arg(short, long, default_value = DEFAULT_IDENTITY_FILE)]
        identity: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Upload {
            transfer,
            identity,
            retries,
            rotate_keys,
            progress,
            json,
        } => {
            let session = SessionConfig {
                max_retries: retries,
                rotate_keys_on_exchange: rotate_keys,
                show_progress: progress,
            };
            run_upload(&transfer, identity, session, json).await
        }
        Commands::Server {
            bind,
            storage,
            max_size,
        } => run_server(bind, storage, megabytes(max_size)?).await,
        Commands::Identity { identity } => show_identity(identity).await,
    }
}

fn megabytes(count: u64) -> Result<u64> {
    match count.checked_mul(1024 * 1024) {
        Some(bytes) => Ok(bytes),
        None => bail!("--max-size {} MB does not fit in 64 bits", count),
    }
}

async fn run_upload(
    transfer: &PathBuf,
    identity: PathBuf,
    session: SessionConfig,
    json: bool,
) -> Result<()> {
    let info = TransferInfo::from_file(transfer)
        .with_context(|| format!("Invalid transfer descriptor {:?}", transfer))?;

    let config = ClientConfig {
        server_addr: info.server_addr(),
        identity: IdentityStore::new(identity),
        session,
    };

    let client = Client::new(config);
    let mut session = client.connect().await?;

    let report = session
        .run(&info.user_name, &info.file_path)
        .await
        .with_context(|| format!("Upload of {:?} failed", info.file_path))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            "📄 {}: {} plaintext, {} bytes on the wire, CRC-32 {:08x}",
            report.file_name,
            format_size(report.plain_size),
            report.content_size,
            report.local_crc32
        );
    }

    if !report.verified {
        bail!(
            "Server checksum never matched after {} attempt(s)",
            report.attempts.len()
        );
    }
    Ok(())
}

async fn run_server(bind: SocketAddr, storage: PathBuf, max_file_size: u64) -> Result<()> {
    info!("🚀 Starting upload server...");

    let config = ServerConfig {
        bind_addr: bind,
        storage_dir: storage,
        max_file_size,
    };

    let server = Server::bind(config).await?;
    server.run().await
}

async fn show_identity(path: PathBuf) -> Result<()> {
    let store = IdentityStore::new(path);

    match store.load().await? {
        IdentityLoad::Found(identity) => {
            info!("🪪 Identity at {:?}", store.path());
            info!("   User name: {}", identity.user_name);
            info!("   User id:   {}", identity.user_id_hex());
            info!("   Key:       {} bytes (PKCS#8)", identity.rsa_private_key.len());
            Ok(())
        }
        IdentityLoad::NotFound => {
            info!("No identity at {:?}; the next upload registers", store.path());
            Ok(())
        }
        IdentityLoad::Corrupt(reason) => bail!("Identity at {:?} is corrupt: {}", store.path(), reason),
    }
}

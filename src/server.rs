//! Reference Upload Server Module
//!
//! This module implements the server side of the upload protocol:
//! - Registers users and hands out random 16-byte ids
//! - Wraps a fresh AES-128 session key under each client's RSA public key
//! - Decrypts uploaded content into per-user storage and reports its CRC-32
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   TcpListener                            │
//! │      one task per connection, bounded by a semaphore     │
//! │                         │                                │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │            Connection Handler                       ││
//! │  │  - Header version check                             ││
//! │  │  - Request dispatch                                 ││
//! │  │  - Any failure: ServerError, then close             ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                                │
//! │  ┌──────────────────────┐  ┌───────────────────────────┐│
//! │  │  Registry (Mutex)    │  │  storage/<user id>/<file> ││
//! │  │  names, keys         │  │  owner-only permissions   ││
//! │  └──────────────────────┘  └───────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{anyhow, bail, Context, Result};
use rand::{rngs::OsRng, RngCore};
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};

use crate::checksum::{StreamingChecksum, CHUNK_SIZE};
use crate::keys::{encrypt_for, SessionKey};
use crate::protocol::{
    validate_filename, ChecksumStatusPayload, FileUploaded, KeyExchangePayload,
    MessageFramer, ProtocolError, RegisterPayload, RequestCode, RequestHeader, ResponseCode,
    UploadFilePayload, UserId, WireFormat, UNREGISTERED_ID,
};
use crate::transfer::{CbcStreamDecryptor, BLOCK_SIZE};

/// Maximum concurrent connections
const MAX_CONNECTIONS: usize = 100;

/// Default upload limit (1 GB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 1024 * 1024 * 1024;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory to store files
    pub storage_dir: PathBuf,
    /// Maximum ciphertext size accepted per upload
    pub max_file_size: u64,
}

struct UserRecord {
    name: String,
    session_key: Option<SessionKey>,
    last_seen: SystemTime,
    files: HashMap<String, FileRecord>,
}

/// A stored upload and whether the client confirmed its checksum
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileRecord {
    path: PathBuf,
    verified: bool,
}

#[derive(Default)]
struct Registry {
    users: HashMap<UserId, UserRecord>,
}

impl Registry {
    fn register(&mut self, name: &str) -> Result<UserId> {
        if self.users.values().any(|user| user.name == name) {
            bail!("User name already registered: {}", name);
        }

        let mut user_id = UNREGISTERED_ID;
        while user_id == UNREGISTERED_ID || self.users.contains_key(&user_id) {
            OsRng.fill_bytes(&mut user_id);
        }

        self.users.insert(
            user_id,
            UserRecord {
                name: name.to_string(),
                session_key: None,
                last_seen: SystemTime::now(),
                files: HashMap::new(),
            },
        );
        Ok(user_id)
    }

    fn user_mut(&mut self, user_id: &UserId) -> Result<&mut UserRecord> {
        self.users
            .get_mut(user_id)
            .ok_or_else(|| anyhow!("Unknown user id {}", hex::encode(user_id)))
    }

    /// Check that a user exists and refresh its last-seen time
    fn touch(&mut self, user_id: &UserId) -> Result<()> {
        let user = self.user_mut(user_id)?;
        let now = SystemTime::now();
        if let Ok(idle) = now.duration_since(user.last_seen) {
            debug!("{} back after {:?}", user.name, idle);
        }
        user.last_seen = now;
        Ok(())
    }

    /// Record a freshly written upload. A re-upload resets verification.
    fn record_upload(&mut self, user_id: &UserId, file_name: &str, path: PathBuf) -> Result<()> {
        let user = self.user_mut(user_id)?;
        let previous = user.files.insert(
            file_name.to_string(),
            FileRecord {
                path,
                verified: false,
            },
        );
        if previous.is_some_and(|record| record.verified) {
            debug!("Replacing verified upload {:?}", file_name);
        }
        Ok(())
    }

    fn mark_verified(&mut self, user_id: &UserId, file_name: &str) -> Result<()> {
        let record = self
            .user_mut(user_id)?
            .files
            .get_mut(file_name)
            .ok_or_else(|| anyhow!("No upload named {:?}", file_name))?;
        record.verified = true;
        Ok(())
    }

    fn remove_file(&mut self, user_id: &UserId, file_name: &str) -> Result<Option<FileRecord>> {
        Ok(self.user_mut(user_id)?.files.remove(file_name))
    }
}

/// State shared by all connection tasks
struct ServerContext {
    storage_dir: PathBuf,
    max_file_size: u64,
    registry: Mutex<Registry>,
}

/// Upload server
pub struct Server {
    listener: TcpListener,
    context: Arc<ServerContext>,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Prepare storage and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        setup_storage_directory(&config.storage_dir).await?;

        let listener = TcpListener::bind(&config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

        Ok(Self {
            listener,
            context: Arc::new(ServerContext {
                storage_dir: config.storage_dir,
                max_file_size: config.max_file_size,
                registry: Mutex::new(Registry::default()),
            }),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<()> {
        info!("📡 Upload server listening on {}", self.local_addr()?);
        info!("📁 Storage directory: {:?}", self.context.storage_dir);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            // Acquire connection permit
            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    continue;
                }
            };

            let context = Arc::clone(&self.context);
            tokio::spawn(async move {
                let _permit = permit;

                match handle_connection(stream, peer_addr, context).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {:#}", peer_addr, e),
                }
            });
        }
    }
}

/// Create the storage directory with owner-only permissions
async fn setup_storage_directory(storage_dir: &Path) -> Result<()> {
    if !storage_dir.exists() {
        fs::create_dir_all(storage_dir)
            .await
            .with_context(|| format!("Failed to create storage directory: {:?}", storage_dir))?;
        info!("Created storage directory: {:?}", storage_dir);
    }

    // Set directory permissions (Unix only)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(storage_dir).await?.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(storage_dir, permissions).await?;
    }

    Ok(())
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    context: Arc<ServerContext>,
) -> Result<()> {
    info!("📥 New connection from {}", peer_addr);
    stream.set_nodelay(true)?;

    loop {
        let header: RequestHeader = match MessageFramer::receive_fixed(&mut stream).await {
            Ok(header) => header,
            Err(ProtocolError::ConnectionClosed) => {
                info!("Client {} disconnected", peer_addr);
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read request header"),
        };

        debug!(
            "Request {} from {} ({} bytes)",
            header.code, peer_addr, header.payload_size
        );

        if let Err(e) = process_request(&mut stream, &header, &context).await {
            // Best effort: the peer may already be gone
            let _ =
                MessageFramer::send_response(&mut stream, ResponseCode::ServerError, &[]).await;
            // Unread input would turn the close into a reset and lose the reply
            let _ = stream.shutdown().await;
            let _ = tokio::io::copy(&mut stream, &mut tokio::io::sink()).await;
            return Err(e);
        }
    }
}

async fn process_request<S>(
    stream: &mut S,
    header: &RequestHeader,
    context: &ServerContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    header.check_version()?;

    let code = header.request_code()?;
    if code != RequestCode::Register {
        context.registry.lock().await.touch(&header.user_id)?;
    }

    match code {
        RequestCode::Register => {
            let payload: RegisterPayload = read_payload(stream, header).await?;
            handle_register(stream, payload, context).await
        }
        RequestCode::KeyExchange => {
            let payload: KeyExchangePayload = read_payload(stream, header).await?;
            handle_key_exchange(stream, header.user_id, payload, context).await
        }
        RequestCode::UploadFile => {
            let payload: UploadFilePayload = read_payload(stream, header).await?;
            handle_upload(stream, header.user_id, payload, context).await
        }
        code @ (RequestCode::ValidChecksum
        | RequestCode::InvalidChecksumRetry
        | RequestCode::InvalidChecksumAbort) => {
            let payload: ChecksumStatusPayload = read_payload(stream, header).await?;
            handle_status(stream, header.user_id, code, payload, context).await
        }
    }
}

async fn read_payload<R, P>(reader: &mut R, header: &RequestHeader) -> Result<P>
where
    R: AsyncRead + Unpin,
    P: WireFormat,
{
    if header.payload_size as usize != P::SIZE {
        return Err(ProtocolError::InconsistentSize {
            what: "request payload",
            expected: P::SIZE as u64,
            actual: header.payload_size as u64,
        }
        .into());
    }
    Ok(MessageFramer::receive_fixed(reader).await?)
}

async fn handle_register<W>(
    writer: &mut W,
    payload: RegisterPayload,
    context: &ServerContext,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let name = payload.user_name.as_str();
    let user_id = context.registry.lock().await.register(name)?;

    info!("📝 Registered {} as {}", name, hex::encode(user_id));
    MessageFramer::send_response(writer, ResponseCode::RegisterSuccess, &user_id).await?;
    Ok(())
}

async fn handle_key_exchange<W>(
    writer: &mut W,
    user_id: UserId,
    payload: KeyExchangePayload,
    context: &ServerContext,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let session_key = SessionKey::generate();
    let wrapped = encrypt_for(&payload.public_key, session_key.as_bytes())
        .context("Failed to wrap session key")?;

    {
        let mut registry = context.registry.lock().await;
        let user = registry.user_mut(&user_id)?;
        if user.name != payload.user_name.as_str() {
            bail!(
                "Key exchange name {:?} does not match registered name {:?}",
                payload.user_name.as_str(),
                user.name
            );
        }
        user.session_key = Some(session_key);
    }

    let mut response = Vec::with_capacity(user_id.len() + wrapped.len());
    response.extend_from_slice(&user_id);
    response.extend_from_slice(&wrapped);

    info!("🔑 Sent session key to {}", hex::encode(user_id));
    MessageFramer::send_response(writer, ResponseCode::ExchangeAes, &response).await?;
    Ok(())
}

async fn handle_upload<S>(
    stream: &mut S,
    user_id: UserId,
    payload: UploadFilePayload,
    context: &ServerContext,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if payload.client_id != user_id {
        bail!("Upload client id does not match header user id");
    }

    let session_key = {
        let mut registry = context.registry.lock().await;
        registry
            .user_mut(&user_id)?
            .session_key
            .clone()
            .ok_or_else(|| anyhow!("No session key for {}", hex::encode(user_id)))?
    };

    let content_size = payload.content_size as u64;
    if content_size == 0 || content_size % BLOCK_SIZE as u64 != 0 {
        bail!("Content size {} is not a whole number of blocks", content_size);
    }
    if content_size > context.max_file_size {
        bail!(
            "File too large: {} bytes (max: {})",
            content_size,
            context.max_file_size
        );
    }

    let safe_filename = validate_filename(payload.file_name.as_str())?;
    let user_dir = context.storage_dir.join(hex::encode(user_id));
    fs::create_dir_all(&user_dir)
        .await
        .with_context(|| format!("Failed to create directory: {:?}", user_dir))?;
    let file_path = user_dir.join(safe_filename);

    info!("📤 Receiving file: {} ({} bytes)", safe_filename, content_size);

    let checksum = match receive_content(stream, &file_path, &session_key, content_size).await {
        Ok(checksum) => checksum,
        Err(e) => {
            // Clean up partial file
            let _ = fs::remove_file(&file_path).await;
            return Err(e);
        }
    };

    info!("📦 Stored {} (CRC-32 {:08x})", safe_filename, checksum);
    context
        .registry
        .lock()
        .await
        .record_upload(&user_id, safe_filename, file_path)?;

    let reply = FileUploaded {
        client_id: user_id,
        content_size: payload.content_size,
        file_name: payload.file_name,
        checksum,
    };
    MessageFramer::send_response(stream, ResponseCode::FileUploaded, &reply.to_bytes()).await?;
    Ok(())
}

/// Read exactly `content_size` ciphertext bytes, decrypt them to disk and
/// return the CRC-32 of the plaintext
async fn receive_content<R>(
    reader: &mut R,
    file_path: &Path,
    session_key: &SessionKey,
    content_size: u64,
) -> Result<u32>
where
    R: AsyncRead + Unpin,
{
    let file = File::create(file_path)
        .await
        .with_context(|| format!("Failed to create file: {:?}", file_path))?;
    let mut file_writer = BufWriter::new(file);

    let mut decryptor = CbcStreamDecryptor::new(session_key);
    let mut checksum = StreamingChecksum::new();
    let mut plain = Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE);
    let mut remaining = content_size;

    while remaining > 0 {
        let chunk_len = remaining.min(CHUNK_SIZE as u64) as usize;
        let chunk = MessageFramer::receive_variable(reader, chunk_len)
            .await
            .context("Failed to receive data")?;
        remaining -= chunk_len as u64;

        plain.clear();
        decryptor.update(&chunk, &mut plain);
        checksum.update(&plain);
        file_writer.write_all(&plain).await?;
    }

    plain.clear();
    decryptor.finalize(&mut plain)?;
    checksum.update(&plain);
    file_writer.write_all(&plain).await?;
    file_writer.flush().await?;

    debug!("Decrypted {} plaintext bytes", checksum.bytes_processed());
    Ok(checksum.finalize())
}

async fn handle_status<W>(
    writer: &mut W,
    user_id: UserId,
    code: RequestCode,
    payload: ChecksumStatusPayload,
    context: &ServerContext,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let file_name = payload.file_name.as_str();
    let mut registry = context.registry.lock().await;

    match code {
        RequestCode::ValidChecksum => {
            registry.mark_verified(&user_id, file_name)?;
            info!("✅ {} verified", file_name);
        }
        RequestCode::InvalidChecksumRetry => {
            warn!("🔁 {} failed verification, client retrying", file_name)
        }
        _ => {
            warn!("❌ {} failed verification, client aborted", file_name);
            match registry.remove_file(&user_id, file_name)? {
                Some(record) => {
                    if let Err(e) = fs::remove_file(&record.path).await {
                        warn!("Failed to remove {:?}: {}", record.path, e);
                    }
                }
                None => debug!("No stored upload named {:?}", file_name),
            }
        }
    }
    drop(registry);

    MessageFramer::send_response(writer, ResponseCode::MessageOk, &user_id).await?;
    Ok(())
}

//! Upload Client Module
//!
//! This module drives one client session over an established stream:
//! - Registers the user and persists the returned identity
//! - Exchanges an RSA public key for a wrapped AES session key
//! - Uploads an encrypted file and verifies it by CRC-32, retrying on mismatch
//!
//! ## Session States
//!
//! ```text
//!  Unregistered --register--> Registered --exchange_keys--> KeysExchanged
//!                                  ^                            |
//!                                  |                        send_file
//!                                  |                            v
//!                      exchange_keys (again) <-------- Verified | Aborted
//! ```
//!
//! Any failure after bytes have been exchanged leaves the stream in an
//! unknown position, so the session moves to `Aborted` and refuses further
//! operations.
//!
//! ## Upload Verification
//!
//! ```text
//! Client                                        Server
//!   |-- UploadFile + ciphertext ------------------->|
//!   |<------------------- FileUploaded(crc32) ------|
//!   |   crc32 == local?                             |
//!   |     yes: ValidChecksum                        |
//!   |     no, retries left: InvalidChecksumRetry    |
//!   |     no, exhausted:    InvalidChecksumAbort    |
//!   |-- status -------------------------------------->|
//!   |<---------------------------- MessageOk --------|
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::checksum::{self, ChecksumError};
use crate::config::SessionConfig;
use crate::identity::{ClientIdentity, IdentityLoad, IdentityStore};
use crate::keys::{CryptoError, RsaKeyManager, SessionKey};
use crate::protocol::{
    ChecksumStatusPayload, FileUploaded, FixedName, KeyExchangePayload, KeyExchangeSuccess,
    MessageFramer, ProtocolError, RegisterPayload, RegisterSuccess, Request, RequestCode,
    ResponseCode, UploadFilePayload, UserId, MAX_ACK_PAYLOAD, MAX_ENCRYPTED_KEY_SIZE,
    PUBLIC_KEY_SIZE, UNREGISTERED_ID, USER_ID_SIZE,
};
use crate::transfer::{encrypted_size, EncryptedFileSender, TransferError};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unregistered,
    Registered,
    KeysExchanged,
    Verified,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coarse error classes, for callers that only need to pick an exit path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Protocol,
    Crypto,
    Io,
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Identity store error: {0}")]
    Identity(#[source] io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Validation(_) | ClientError::InvalidState { .. } => ErrorKind::Validation,
            ClientError::Protocol(_) => ErrorKind::Protocol,
            ClientError::Crypto(_) => ErrorKind::Crypto,
            ClientError::Transfer(TransferError::Transport(_)) => ErrorKind::Protocol,
            ClientError::Transfer(TransferError::Cipher(_)) => ErrorKind::Crypto,
            ClientError::Transfer(_)
            | ClientError::Io(_)
            | ClientError::Connect { .. }
            | ClientError::FileRead { .. }
            | ClientError::Identity(_) => ErrorKind::Io,
        }
    }
}

impl From<ChecksumError> for ClientError {
    fn from(err: ChecksumError) -> Self {
        match err {
            ChecksumError::FileRead { path, source } => ClientError::FileRead { path, source },
        }
    }
}

/// Result of comparing one upload's checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Verified,
    MismatchRetry,
    MismatchAbort,
}

impl AttemptOutcome {
    fn status_code(self) -> RequestCode {
        match self {
            AttemptOutcome::Verified => RequestCode::ValidChecksum,
            AttemptOutcome::MismatchRetry => RequestCode::InvalidChecksumRetry,
            AttemptOutcome::MismatchAbort => RequestCode::InvalidChecksumAbort,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferAttempt {
    /// 1-based
    pub attempt_index: u32,
    pub local_crc32: u32,
    pub server_crc32: u32,
    pub outcome: AttemptOutcome,
}

/// Summary of a `send_file` call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub file_name: String,
    pub plain_size: u64,
    pub content_size: u32,
    pub local_crc32: u32,
    pub attempts: Vec<TransferAttempt>,
    pub verified: bool,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address to connect to (`host:port`)
    pub server_addr: String,
    pub identity: IdentityStore,
    pub session: SessionConfig,
}

/// Upload client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and open a session on the new stream
    pub async fn connect(&self) -> Result<ClientSession<TcpStream>, ClientError> {
        let addr = &self.config.server_addr;
        info!("🔗 Connecting to {}...", addr);

        let stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(|source| ClientError::Connect {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        debug!("TCP connection established");

        ClientSession::new(
            stream,
            self.config.identity.clone(),
            self.config.session.clone(),
        )
        .await
    }
}

/// One protocol session over a connected stream
pub struct ClientSession<S> {
    stream: S,
    store: IdentityStore,
    config: SessionConfig,
    state: SessionState,
    identity: Option<ClientIdentity>,
    keys: RsaKeyManager,
    session_key: Option<SessionKey>,
}

impl<S> ClientSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Open a session, reading the identity file once
    ///
    /// A missing or unusable identity starts the session `Unregistered`.
    pub async fn new(
        stream: S,
        store: IdentityStore,
        config: SessionConfig,
    ) -> Result<Self, ClientError> {
        let mut keys = RsaKeyManager::new();
        let mut identity = None;

        match store.load().await.map_err(ClientError::Identity)? {
            IdentityLoad::Found(found) => match keys.load_key(&found.rsa_private_key) {
                Ok(()) => {
                    info!(
                        "🪪 Loaded identity for {} ({})",
                        found.user_name,
                        found.user_id_hex()
                    );
                    identity = Some(found);
                }
                Err(e) => warn!(
                    "⚠️  Identity file {} has an unusable key ({}); registering again",
                    store.path().display(),
                    e
                ),
            },
            IdentityLoad::NotFound => {
                debug!("No identity file at {}", store.path().display());
            }
            IdentityLoad::Corrupt(reason) => warn!(
                "⚠️  Identity file {} is corrupt ({}); registering again",
                store.path().display(),
                reason
            ),
        }

        let state = if identity.is_some() {
            SessionState::Registered
        } else {
            SessionState::Unregistered
        };

        Ok(Self {
            stream,
            store,
            config,
            state,
            identity,
            keys,
            session_key: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    /// Give the stream back, positioned after the last complete exchange
    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Register `user_name` with the server and persist the new identity
    pub async fn register(&mut self, user_name: &str) -> Result<UserId, ClientError> {
        self.require("register", &[SessionState::Unregistered])?;
        let name = FixedName::new(user_name)
            .map_err(|e| ClientError::Validation(format!("user name: {}", e)))?;

        info!("📝 Registering as {}...", user_name);
        let result = self.register_exchange(name).await;
        let user_id = self.settle(result)?;

        info!("✅ Registered with id {}", hex::encode(user_id));
        Ok(user_id)
    }

    async fn register_exchange(&mut self, name: FixedName) -> Result<UserId, ClientError> {
        let user_name = name.as_str().to_string();
        let request = Request::new(
            UNREGISTERED_ID,
            RequestCode::Register,
            RegisterPayload { user_name: name },
        );
        MessageFramer::send_fixed(&mut self.stream, &request).await?;

        let header =
            MessageFramer::receive_response(&mut self.stream, ResponseCode::RegisterSuccess)
                .await?;
        header.expect_payload::<RegisterSuccess>("RegisterSuccess payload")?;
        let reply: RegisterSuccess = MessageFramer::receive_fixed(&mut self.stream).await?;

        if reply.user_id == UNREGISTERED_ID {
            return Err(ProtocolError::InvalidFormat("Server assigned an all-zero id".to_string()).into());
        }

        self.keys.gen_key()?;
        let identity = ClientIdentity {
            user_name,
            user_id: reply.user_id,
            rsa_private_key: self.keys.private_key_der()?,
        };
        self.store
            .save(&identity)
            .await
            .map_err(ClientError::Identity)?;

        self.identity = Some(identity);
        self.state = SessionState::Registered;
        Ok(reply.user_id)
    }

    /// Obtain a fresh AES session key from the server
    pub async fn exchange_keys(&mut self) -> Result<(), ClientError> {
        self.require(
            "exchange keys",
            &[
                SessionState::Registered,
                SessionState::KeysExchanged,
                SessionState::Verified,
            ],
        )?;

        if self.config.rotate_keys_on_exchange {
            debug!("Rotating RSA keypair before exchange");
            self.keys.gen_key()?;
        }
        let public_key = self.keys.public_key()?;

        info!("🔑 Exchanging keys...");
        let result = self.key_exchange(public_key).await;
        self.settle(result)?;

        info!("🔐 Session key established");
        Ok(())
    }

    async fn key_exchange(
        &mut self,
        public_key: [u8; PUBLIC_KEY_SIZE],
    ) -> Result<(), ClientError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or(ClientError::InvalidState {
                operation: "exchange keys",
                state: self.state,
            })?;
        let user_id = identity.user_id;
        let user_name = FixedName::new(&identity.user_name)
            .map_err(|e| ClientError::Validation(format!("user name: {}", e)))?;

        let request = Request::new(
            user_id,
            RequestCode::KeyExchange,
            KeyExchangePayload {
                user_name,
                public_key,
            },
        );
        MessageFramer::send_fixed(&mut self.stream, &request).await?;

        let header =
            MessageFramer::receive_response(&mut self.stream, ResponseCode::ExchangeAes).await?;
        let key_len = (header.payload_size as usize)
            .checked_sub(USER_ID_SIZE)
            .filter(|len| (1..=MAX_ENCRYPTED_KEY_SIZE).contains(len))
            .ok_or(ProtocolError::InconsistentSize {
                what: "ExchangeAes payload",
                expected: (USER_ID_SIZE + MAX_ENCRYPTED_KEY_SIZE) as u64,
                actual: header.payload_size as u64,
            })?;

        let prefix: KeyExchangeSuccess = MessageFramer::receive_fixed(&mut self.stream).await?;
        let wrapped_key = MessageFramer::receive_variable(&mut self.stream, key_len).await?;
        check_client_id(&prefix.client_id, &user_id)?;

        let session_key = self.keys.decrypt_session_key(&wrapped_key)?;
        debug!("Unwrapped {}-byte session key", session_key.as_bytes().len());

        if self.config.rotate_keys_on_exchange {
            if let Some(identity) = self.identity.as_mut() {
                identity.rsa_private_key = self.keys.private_key_der()?;
                self.store
                    .save(identity)
                    .await
                    .map_err(ClientError::Identity)?;
            }
        }

        self.session_key = Some(session_key);
        self.state = SessionState::KeysExchanged;
        Ok(())
    }

    /// Upload `path` and verify it, retrying on checksum mismatch
    ///
    /// A mismatch that exhausts the retry budget is not an error: it returns a
    /// report with `verified == false` and leaves the session `Aborted`.
    pub async fn send_file(&mut self, path: &Path) -> Result<TransferReport, ClientError> {
        self.require("send a file", &[SessionState::KeysExchanged])?;
        let plan = UploadPlan::prepare(path).await?;

        info!(
            "📊 {} ({}), CRC-32 {:08x}",
            plan.file_name.as_str(),
            format_size(plan.plain_size),
            plan.local_crc32
        );

        let result = self.upload_with_retries(path, &plan).await;
        let report = self.settle(result)?;

        if report.verified {
            info!(
                "✅ Upload verified after {} attempt(s)",
                report.attempts.len()
            );
        } else {
            warn!(
                "❌ Upload not verified after {} attempt(s), aborted",
                report.attempts.len()
            );
        }
        Ok(report)
    }

    async fn upload_with_retries(
        &mut self,
        path: &Path,
        plan: &UploadPlan,
    ) -> Result<TransferReport, ClientError> {
        let user_id = self
            .identity
            .as_ref()
            .map(|identity| identity.user_id)
            .ok_or(ClientError::InvalidState {
                operation: "send a file",
                state: self.state,
            })?;
        let session_key = self.session_key.as_ref().ok_or(ClientError::InvalidState {
            operation: "send a file",
            state: self.state,
        })?;

        let max_attempts = self.config.max_retries.saturating_add(1);
        let mut attempts = Vec::new();

        for attempt_index in 1..=max_attempts {
            info!("📤 Upload attempt {}/{}", attempt_index, max_attempts);

            let request = Request::new(
                user_id,
                RequestCode::UploadFile,
                UploadFilePayload {
                    client_id: user_id,
                    content_size: plan.content_size,
                    file_name: plan.file_name.clone(),
                },
            );
            MessageFramer::send_fixed(&mut self.stream, &request).await?;

            let progress = if self.config.show_progress {
                create_progress_bar(plan.plain_size)
            } else {
                ProgressBar::hidden()
            };
            let sender = EncryptedFileSender::new(path, session_key, plan.plain_size);
            sender.send(&mut self.stream, &progress).await?;
            progress.finish_and_clear();

            let header =
                MessageFramer::receive_response(&mut self.stream, ResponseCode::FileUploaded)
                    .await?;
            header.expect_payload::<FileUploaded>("FileUploaded payload")?;
            let reply: FileUploaded = MessageFramer::receive_fixed(&mut self.stream).await?;

            check_client_id(&reply.client_id, &user_id)?;
            if reply.content_size != plan.content_size {
                return Err(ProtocolError::InconsistentSize {
                    what: "FileUploaded content_size",
                    expected: plan.content_size as u64,
                    actual: reply.content_size as u64,
                }
                .into());
            }

            let outcome = if reply.checksum == plan.local_crc32 {
                AttemptOutcome::Verified
            } else if attempt_index < max_attempts {
                AttemptOutcome::MismatchRetry
            } else {
                AttemptOutcome::MismatchAbort
            };
            if outcome != AttemptOutcome::Verified {
                warn!(
                    "⚠️  Checksum mismatch: local {:08x}, server {:08x}",
                    plan.local_crc32, reply.checksum
                );
            }

            let status = Request::new(
                user_id,
                outcome.status_code(),
                ChecksumStatusPayload {
                    file_name: plan.file_name.clone(),
                },
            );
            MessageFramer::send_fixed(&mut self.stream, &status).await?;

            let ack =
                MessageFramer::receive_response(&mut self.stream, ResponseCode::MessageOk).await?;
            if ack.payload_size > MAX_ACK_PAYLOAD {
                return Err(ProtocolError::InconsistentSize {
                    what: "MessageOk payload",
                    expected: MAX_ACK_PAYLOAD as u64,
                    actual: ack.payload_size as u64,
                }
                .into());
            }
            MessageFramer::receive_variable(&mut self.stream, ack.payload_size as usize).await?;

            attempts.push(TransferAttempt {
                attempt_index,
                local_crc32: plan.local_crc32,
                server_crc32: reply.checksum,
                outcome,
            });

            if outcome != AttemptOutcome::MismatchRetry {
                break;
            }
        }

        let verified = attempts
            .last()
            .map_or(false, |a| a.outcome == AttemptOutcome::Verified);
        self.state = if verified {
            SessionState::Verified
        } else {
            SessionState::Aborted
        };

        Ok(TransferReport {
            file_name: plan.file_name.as_str().to_string(),
            plain_size: plan.plain_size,
            content_size: plan.content_size,
            local_crc32: plan.local_crc32,
            attempts,
            verified,
        })
    }

    /// Register if needed, exchange keys and upload `path`
    pub async fn run(&mut self, user_name: &str, path: &Path) -> Result<TransferReport, ClientError> {
        match self.identity.as_ref().map(|identity| identity.user_name.clone()) {
            None => {
                self.register(user_name).await?;
            }
            Some(stored) if stored != user_name => warn!(
                "⚠️  Using stored identity {} instead of {}",
                stored, user_name
            ),
            Some(_) => {}
        }

        self.exchange_keys().await?;
        self.send_file(path).await
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<(), ClientError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ClientError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Abort the session if an exchange failed midway
    fn settle<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            warn!("Session aborted: {}", e);
            self.state = SessionState::Aborted;
            self.session_key = None;
        }
        result
    }
}

/// Everything about the local file that is fixed before the first byte is sent
struct UploadPlan {
    file_name: FixedName,
    plain_size: u64,
    content_size: u32,
    local_crc32: u32,
}

impl UploadPlan {
    async fn prepare(path: &Path) -> Result<Self, ClientError> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ClientError::Validation(format!(
                    "{} does not exist",
                    path.display()
                )))
            }
            Err(source) => {
                return Err(ClientError::FileRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if !metadata.is_file() {
            return Err(ClientError::Validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let base_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                ClientError::Validation(format!("{} has no UTF-8 file name", path.display()))
            })?;
        let file_name = FixedName::new(base_name)
            .map_err(|e| ClientError::Validation(format!("file name: {}", e)))?;

        let plain_size = metadata.len();
        let content_size = u32::try_from(encrypted_size(plain_size)).map_err(|_| {
            ClientError::Validation(format!(
                "{} is too large to upload ({})",
                path.display(),
                format_size(plain_size)
            ))
        })?;

        let local_crc32 = checksum::calculate(path).await?;

        Ok(Self {
            file_name,
            plain_size,
            content_size,
            local_crc32,
        })
    }
}

fn check_client_id(received: &UserId, expected: &UserId) -> Result<(), ProtocolError> {
    if received != expected {
        return Err(ProtocolError::ClientIdMismatch(hex::encode(received)));
    }
    Ok(())
}

/// Create progress bar for transfers
fn create_progress_bar(total_size: u64) -> ProgressBar {
    let pb = ProgressBar::new(total_size);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

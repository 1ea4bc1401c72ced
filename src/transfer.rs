//! Encrypted file content streaming
//!
//! File content is encrypted with AES-128-CBC and PKCS#7 padding, then written
//! unframed right after the `UploadFile` request. The IV is all zeros: the
//! server decrypts with a zero IV and there is no field to carry one, so every
//! upload under the same session key leaks equality of leading blocks.

use std::path::{Path, PathBuf};

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use indicatif::ProgressBar;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

use crate::checksum::CHUNK_SIZE;
use crate::keys::SessionKey;
use crate::protocol::{MessageFramer, ProtocolError};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const BLOCK_SIZE: usize = 16;
pub const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] ProtocolError),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("File size changed during upload: announced {expected} bytes, read {actual}")]
    SizeChanged { expected: u64, actual: u64 },
}

/// Ciphertext length for `plain_size` bytes: always at least one padding byte
pub fn encrypted_size(plain_size: u64) -> u64 {
    (plain_size / BLOCK_SIZE as u64 + 1) * BLOCK_SIZE as u64
}

/// Incremental AES-128-CBC encryptor
///
/// Complete blocks are emitted as soon as they are available; the tail is
/// padded in [`finalize`](Self::finalize).
pub struct CbcStreamEncryptor {
    cipher: Aes128CbcEnc,
    pending: Vec<u8>,
}

impl CbcStreamEncryptor {
    pub fn new(key: &SessionKey) -> Self {
        let cipher = Aes128CbcEnc::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&ZERO_IV),
        );
        Self {
            cipher,
            pending: Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE),
        }
    }

    /// Encrypt as many whole blocks as `data` completes and append them to `out`
    pub fn update(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(data);
        let ready = self.pending.len() - self.pending.len() % BLOCK_SIZE;

        for block in self.pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..ready]);
        self.pending.drain(..ready);
    }

    /// Pad and encrypt the remaining tail; always appends exactly one block
    pub fn finalize(self, out: &mut Vec<u8>) -> Result<(), TransferError> {
        let tail = self.pending.len();
        let mut block = [0u8; BLOCK_SIZE];
        block[..tail].copy_from_slice(&self.pending);

        let encrypted = self
            .cipher
            .encrypt_padded_mut::<Pkcs7>(&mut block, tail)
            .map_err(|_| TransferError::Cipher("padding failed".to_string()))?;
        out.extend_from_slice(encrypted);
        Ok(())
    }
}

/// Incremental AES-128-CBC decryptor
///
/// The last complete block is held back until [`finalize`](Self::finalize)
/// because it carries the padding.
pub struct CbcStreamDecryptor {
    cipher: Aes128CbcDec,
    pending: Vec<u8>,
}

impl CbcStreamDecryptor {
    pub fn new(key: &SessionKey) -> Self {
        let cipher = Aes128CbcDec::new(
            GenericArray::from_slice(key.as_bytes()),
            GenericArray::from_slice(&ZERO_IV),
        );
        Self {
            cipher,
            pending: Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE),
        }
    }

    pub fn update(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(data);
        if self.pending.len() <= BLOCK_SIZE {
            return;
        }
        let ready = (self.pending.len() - 1) / BLOCK_SIZE * BLOCK_SIZE;

        for block in self.pending[..ready].chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out.extend_from_slice(&self.pending[..ready]);
        self.pending.drain(..ready);
    }

    /// Decrypt the final block and strip its padding
    pub fn finalize(mut self, out: &mut Vec<u8>) -> Result<(), TransferError> {
        if self.pending.len() != BLOCK_SIZE {
            return Err(TransferError::Cipher(format!(
                "ciphertext is not block aligned ({} trailing bytes)",
                self.pending.len()
            )));
        }

        let plain = self
            .cipher
            .decrypt_padded_mut::<Pkcs7>(&mut self.pending)
            .map_err(|_| TransferError::Cipher("invalid padding".to_string()))?;
        out.extend_from_slice(plain);
        Ok(())
    }
}

/// Streams one local file, encrypted, into the transport
pub struct EncryptedFileSender<'a> {
    path: &'a Path,
    key: &'a SessionKey,
    plain_size: u64,
}

impl<'a> EncryptedFileSender<'a> {
    /// `plain_size` is the size announced in the upload request
    pub fn new(path: &'a Path, key: &'a SessionKey, plain_size: u64) -> Self {
        Self {
            path,
            key,
            plain_size,
        }
    }

    pub fn content_size(&self) -> u64 {
        encrypted_size(self.plain_size)
    }

    /// Encrypt and write the file; returns the number of ciphertext bytes written
    ///
    /// Never writes more than [`content_size`](Self::content_size) bytes. The
    /// stream is flushed but left open.
    pub async fn send<W>(&self, writer: &mut W, progress: &ProgressBar) -> Result<u64, TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        let file = File::open(self.path).await.map_err(|e| self.read_error(e))?;
        let mut file = file.take(self.plain_size);

        let mut encryptor = CbcStreamEncryptor::new(self.key);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut ciphertext = Vec::with_capacity(CHUNK_SIZE + BLOCK_SIZE);
        let mut bytes_read: u64 = 0;
        let mut bytes_sent: u64 = 0;

        loop {
            let n = file.read(&mut buffer).await.map_err(|e| self.read_error(e))?;
            if n == 0 {
                break;
            }
            bytes_read += n as u64;

            ciphertext.clear();
            encryptor.update(&buffer[..n], &mut ciphertext);
            MessageFramer::send_raw(writer, &ciphertext).await?;
            bytes_sent += ciphertext.len() as u64;
            progress.set_position(bytes_read);
        }

        let grew = self.has_more(file.into_inner()).await?;
        if bytes_read != self.plain_size || grew {
            return Err(TransferError::SizeChanged {
                expected: self.plain_size,
                actual: if grew { bytes_read + 1 } else { bytes_read },
            });
        }

        ciphertext.clear();
        encryptor.finalize(&mut ciphertext)?;
        MessageFramer::send_raw(writer, &ciphertext).await?;
        MessageFramer::flush(writer).await?;
        bytes_sent += ciphertext.len() as u64;

        debug!(
            "Sent {} ciphertext bytes for {} plaintext bytes",
            bytes_sent, bytes_read
        );
        Ok(bytes_sent)
    }

    async fn has_more<R: AsyncRead + Unpin>(&self, mut reader: R) -> Result<bool, TransferError> {
        let mut probe = [0u8; 1];
        let n = reader.read(&mut probe).await.map_err(|e| self.read_error(e))?;
        Ok(n > 0)
    }

    fn read_error(&self, source: std::io::Error) -> TransferError {
        TransferError::FileRead {
            path: self.path.to_path_buf(),
            source,
        }
    }
}

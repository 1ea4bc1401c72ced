//! Protocol Definition Module
//!
//! This module defines the encrypted upload protocol including:
//! - Request and response codes
//! - Fixed-layout binary encoding of every header and payload
//! - Exact-length framing helpers over any async duplex stream
//!
//! ## Protocol Overview
//!
//! The protocol is half-duplex request/response, one exchange in flight:
//!
//! ```text
//! Client                                       Server
//!   |                                            |
//!   |-- Register(user_name) -------------------->|
//!   |<-------------------- RegisterSuccess(id) --|
//!   |                                            |
//!   |-- KeyExchange(user_name, public_key) ----->|
//!   |<------------ ExchangeAes(id, rsa(aes)) ----|
//!   |                                            |
//!   |-- UploadFile(id, size, name) + content --->|
//!   |<------------- FileUploaded(..., crc32) ----|
//!   |-- ValidChecksum | Retry | Abort ---------->|
//!   |<------------------------------ MessageOk --|
//! ```
//!
//! ## Wire Format
//!
//! All integers are little-endian and no structure carries padding. Nothing
//! here depends on in-memory struct layout: every type implements
//! [`WireFormat`] with an explicit field-by-field serializer.
//!
//! ```text
//! Request header (23 bytes)
//! +-------------+---------+---------+----------------+
//! | user_id(16) | ver(1)  | code(2) | payload_size(4)|
//! +-------------+---------+---------+----------------+
//!
//! Response header (7 bytes)
//! +---------+---------+----------------+
//! | ver(1)  | code(2) | payload_size(4)|
//! +---------+---------+----------------+
//! ```

use std::fmt;
use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The single protocol version both peers speak
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the server-assigned user identifier
pub const USER_ID_SIZE: usize = 16;

/// Width of the `user_name` and `file_name` wire fields
pub const NAME_FIELD_SIZE: usize = 255;

/// Longest name that still leaves room for the NUL terminator
pub const MAX_NAME_LEN: usize = NAME_FIELD_SIZE - 1;

/// Width of the exported RSA public key field
pub const PUBLIC_KEY_SIZE: usize = 160;

/// Upper bound for the RSA-wrapped session key in an `ExchangeAes` response
pub const MAX_ENCRYPTED_KEY_SIZE: usize = 512;

/// Upper bound for the ignored payload of a `MessageOk` acknowledgment
pub const MAX_ACK_PAYLOAD: u32 = 255;

pub const REQUEST_HEADER_SIZE: usize = USER_ID_SIZE + 1 + 2 + 4;
pub const RESPONSE_HEADER_SIZE: usize = 1 + 2 + 4;

/// 16-byte opaque user identifier, all-zero until registration succeeds
pub type UserId = [u8; USER_ID_SIZE];

/// The identifier sent before registration
pub const UNREGISTERED_ID: UserId = [0u8; USER_ID_SIZE];

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Unsupported protocol version: {0} (expected {PROTOCOL_VERSION})")]
    VersionMismatch(u8),

    #[error("Unknown request code: {0}")]
    UnknownRequestCode(u16),

    #[error("Unknown response code: {0}")]
    UnknownResponseCode(u16),

    #[error("Unexpected response: expected {expected:?}, got {actual:?}")]
    UnexpectedResponse {
        expected: ResponseCode,
        actual: ResponseCode,
    },

    #[error("Server reported an error")]
    ServerError,

    #[error("Inconsistent size for {what}: expected {expected}, got {actual}")]
    InconsistentSize {
        what: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("Response addressed to another client: {0}")]
    ClientIdMismatch(String),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),
}

/// Client-to-server request codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestCode {
    Register = 1100,
    KeyExchange = 1101,
    UploadFile = 1103,
    ValidChecksum = 1104,
    InvalidChecksumRetry = 1105,
    InvalidChecksumAbort = 1106,
}

impl TryFrom<u16> for RequestCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1100 => Ok(RequestCode::Register),
            1101 => Ok(RequestCode::KeyExchange),
            1103 => Ok(RequestCode::UploadFile),
            1104 => Ok(RequestCode::ValidChecksum),
            1105 => Ok(RequestCode::InvalidChecksumRetry),
            1106 => Ok(RequestCode::InvalidChecksumAbort),
            other => Err(ProtocolError::UnknownRequestCode(other)),
        }
    }
}

/// Server-to-client response codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseCode {
    RegisterSuccess = 2100,
    ExchangeAes = 2102,
    FileUploaded = 2103,
    MessageOk = 2104,
    ServerError = 0,
}

impl TryFrom<u16> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            2100 => Ok(ResponseCode::RegisterSuccess),
            2102 => Ok(ResponseCode::ExchangeAes),
            2103 => Ok(ResponseCode::FileUploaded),
            2104 => Ok(ResponseCode::MessageOk),
            0 => Ok(ResponseCode::ServerError),
            other => Err(ProtocolError::UnknownResponseCode(other)),
        }
    }
}

/// Explicit fixed-width serialization for everything that crosses the wire
pub trait WireFormat: Sized {
    /// Exact encoded length in bytes
    const SIZE: usize;

    /// Append the encoded form, exactly `SIZE` bytes
    fn write_to(&self, out: &mut Vec<u8>);

    /// Decode from a reader positioned at the start of the structure
    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut out);
        debug_assert_eq!(out.len(), Self::SIZE);
        out
    }

    fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InconsistentSize {
                what: std::any::type_name::<Self>(),
                expected: Self::SIZE as u64,
                actual: data.len() as u64,
            });
        }
        let mut reader = FieldReader::new(data);
        Self::read_from(&mut reader)
    }
}

/// Sequential little-endian field reader over a fully received buffer
pub struct FieldReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bytes<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let end = self.pos + N;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            ProtocolError::InvalidFormat(format!(
                "Truncated field: need {} bytes at offset {}, have {}",
                N,
                self.pos,
                self.data.len()
            ))
        })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.bytes::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_le_bytes(self.bytes::<2>()?))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.bytes::<4>()?))
    }
}

/// A NUL-padded 255-byte text field holding at most 254 bytes of UTF-8
#[derive(Clone, PartialEq, Eq)]
pub struct FixedName([u8; NAME_FIELD_SIZE]);

impl FixedName {
    /// Validate and pack a name. Nothing is sent for names that fail here.
    pub fn new(value: &str) -> Result<Self, NameError> {
        if value.is_empty() {
            return Err(NameError::Empty);
        }
        if value.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong(value.len()));
        }
        if value.bytes().any(|b| b == 0 || b == b'\n' || b == b'\r') {
            return Err(NameError::InvalidCharacter);
        }

        let mut field = [0u8; NAME_FIELD_SIZE];
        field[..value.len()].copy_from_slice(value.as_bytes());
        Ok(Self(field))
    }

    /// The text up to the first NUL
    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_SIZE);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl fmt::Debug for FixedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl WireFormat for FixedName {
    const SIZE: usize = NAME_FIELD_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        let field = reader.bytes::<NAME_FIELD_SIZE>()?;
        let end = field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_SIZE);
        if std::str::from_utf8(&field[..end]).is_err() {
            return Err(ProtocolError::InvalidFormat(
                "Name field is not valid UTF-8".to_string(),
            ));
        }
        Ok(Self(field))
    }
}

/// Reasons a name cannot be packed into a wire field
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NameError {
    #[error("name is empty")]
    Empty,

    #[error("name is {0} bytes long (max: {MAX_NAME_LEN})")]
    TooLong(usize),

    #[error("name contains NUL or line-break characters")]
    InvalidCharacter,
}

/// Header prefixing every client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub user_id: UserId,
    pub version: u8,
    pub code: u16,
    /// Length of the fixed payload that follows, header excluded
    pub payload_size: u32,
}

impl RequestHeader {
    /// Decoded request code, if it is one we know
    pub fn request_code(&self) -> Result<RequestCode, ProtocolError> {
        RequestCode::try_from(self.code)
    }

    pub fn check_version(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(self.version));
        }
        Ok(())
    }
}

impl WireFormat for RequestHeader {
    const SIZE: usize = REQUEST_HEADER_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.user_id);
        out.push(self.version);
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.payload_size.to_le_bytes());
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_id: reader.bytes::<USER_ID_SIZE>()?,
            version: reader.u8()?,
            code: reader.u16()?,
            payload_size: reader.u32()?,
        })
    }
}

/// Header prefixing every server response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: u16,
    pub payload_size: u32,
}

impl ResponseHeader {
    pub fn new(code: ResponseCode, payload_size: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            code: code as u16,
            payload_size,
        }
    }

    /// Check version and code against what the current step expects
    pub fn expect(&self, expected: ResponseCode) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(self.version));
        }
        let actual = ResponseCode::try_from(self.code)?;
        if actual == ResponseCode::ServerError && expected != ResponseCode::ServerError {
            return Err(ProtocolError::ServerError);
        }
        if actual != expected {
            return Err(ProtocolError::UnexpectedResponse { expected, actual });
        }
        Ok(())
    }

    /// Require the announced payload to be exactly one `T`
    pub fn expect_payload<T: WireFormat>(&self, what: &'static str) -> Result<(), ProtocolError> {
        if self.payload_size as usize != T::SIZE {
            return Err(ProtocolError::InconsistentSize {
                what,
                expected: T::SIZE as u64,
                actual: self.payload_size as u64,
            });
        }
        Ok(())
    }
}

impl WireFormat for ResponseHeader {
    const SIZE: usize = RESPONSE_HEADER_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.extend_from_slice(&self.code.to_le_bytes());
        out.extend_from_slice(&self.payload_size.to_le_bytes());
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            version: reader.u8()?,
            code: reader.u16()?,
            payload_size: reader.u32()?,
        })
    }
}

/// A complete request: header first, then its fixed payload
///
/// Every concrete request is built through [`Request::new`], which is the
/// only place `version` and `payload_size` are filled in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<P> {
    pub header: RequestHeader,
    pub payload: P,
}

impl<P: WireFormat> Request<P> {
    pub fn new(user_id: UserId, code: RequestCode, payload: P) -> Self {
        Self {
            header: RequestHeader {
                user_id,
                version: PROTOCOL_VERSION,
                code: code as u16,
                payload_size: P::SIZE as u32,
            },
            payload,
        }
    }
}

impl<P: WireFormat> WireFormat for Request<P> {
    const SIZE: usize = REQUEST_HEADER_SIZE + P::SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.header.write_to(out);
        self.payload.write_to(out);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        let header = RequestHeader::read_from(reader)?;
        if header.payload_size as usize != P::SIZE {
            return Err(ProtocolError::InconsistentSize {
                what: "request payload",
                expected: P::SIZE as u64,
                actual: header.payload_size as u64,
            });
        }
        let payload = P::read_from(reader)?;
        Ok(Self { header, payload })
    }
}

/// Payload of a `Register` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterPayload {
    pub user_name: FixedName,
}

impl WireFormat for RegisterPayload {
    const SIZE: usize = NAME_FIELD_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.user_name.write_to(out);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_name: FixedName::read_from(reader)?,
        })
    }
}

/// Payload of a `KeyExchange` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangePayload {
    pub user_name: FixedName,
    pub public_key: [u8; PUBLIC_KEY_SIZE],
}

impl WireFormat for KeyExchangePayload {
    const SIZE: usize = NAME_FIELD_SIZE + PUBLIC_KEY_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.user_name.write_to(out);
        out.extend_from_slice(&self.public_key);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_name: FixedName::read_from(reader)?,
            public_key: reader.bytes::<PUBLIC_KEY_SIZE>()?,
        })
    }
}

/// Payload of an `UploadFile` request; `content_size` ciphertext bytes follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFilePayload {
    pub client_id: UserId,
    pub content_size: u32,
    pub file_name: FixedName,
}

impl WireFormat for UploadFilePayload {
    const SIZE: usize = USER_ID_SIZE + 4 + NAME_FIELD_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client_id);
        out.extend_from_slice(&self.content_size.to_le_bytes());
        self.file_name.write_to(out);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id: reader.bytes::<USER_ID_SIZE>()?,
            content_size: reader.u32()?,
            file_name: FixedName::read_from(reader)?,
        })
    }
}

/// Payload of the three checksum status reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumStatusPayload {
    pub file_name: FixedName,
}

impl WireFormat for ChecksumStatusPayload {
    const SIZE: usize = NAME_FIELD_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        self.file_name.write_to(out);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            file_name: FixedName::read_from(reader)?,
        })
    }
}

/// Payload of a `RegisterSuccess` response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterSuccess {
    pub user_id: UserId,
}

impl WireFormat for RegisterSuccess {
    const SIZE: usize = USER_ID_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.user_id);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_id: reader.bytes::<USER_ID_SIZE>()?,
        })
    }
}

/// Fixed prefix of an `ExchangeAes` response; the wrapped key follows it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyExchangeSuccess {
    pub client_id: UserId,
}

impl WireFormat for KeyExchangeSuccess {
    const SIZE: usize = USER_ID_SIZE;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client_id);
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id: reader.bytes::<USER_ID_SIZE>()?,
        })
    }
}

/// Payload of a `FileUploaded` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUploaded {
    pub client_id: UserId,
    pub content_size: u32,
    pub file_name: FixedName,
    pub checksum: u32,
}

impl WireFormat for FileUploaded {
    const SIZE: usize = USER_ID_SIZE + 4 + NAME_FIELD_SIZE + 4;

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.client_id);
        out.extend_from_slice(&self.content_size.to_le_bytes());
        self.file_name.write_to(out);
        out.extend_from_slice(&self.checksum.to_le_bytes());
    }

    fn read_from(reader: &mut FieldReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            client_id: reader.bytes::<USER_ID_SIZE>()?,
            content_size: reader.u32()?,
            file_name: FixedName::read_from(reader)?,
            checksum: reader.u32()?,
        })
    }
}

/// Exact-length message I/O
///
/// Every read either fills the whole structure or fails; a stream that
/// closes mid-message yields [`ProtocolError::ConnectionClosed`].
pub struct MessageFramer;

impl MessageFramer {
    /// Write one fixed structure and flush
    pub async fn send_fixed<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
        T: WireFormat,
    {
        let bytes = message.to_bytes();
        writer.write_all(&bytes).await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)?;
        Ok(())
    }

    /// Read exactly one fixed structure
    pub async fn receive_fixed<R, T>(reader: &mut R) -> Result<T, ProtocolError>
    where
        R: AsyncRead + Unpin,
        T: WireFormat,
    {
        let buffer = Self::receive_variable(reader, T::SIZE).await?;
        T::from_bytes(&buffer)
    }

    /// Read exactly `len` bytes
    pub async fn receive_variable<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = vec![0u8; len];
        reader.read_exact(&mut buffer).await.map_err(map_io)?;
        Ok(buffer)
    }

    /// Write unframed content bytes (no flush)
    pub async fn send_raw<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(data).await.map_err(map_io)
    }

    pub async fn flush<W>(writer: &mut W) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.flush().await.map_err(map_io)
    }

    /// Read a response header and check it against the expected code
    pub async fn receive_response<R>(
        reader: &mut R,
        expected: ResponseCode,
    ) -> Result<ResponseHeader, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header: ResponseHeader = Self::receive_fixed(reader).await?;
        header.expect(expected)?;
        Ok(header)
    }

    /// Write a response header followed by its payload bytes
    pub async fn send_response<W>(
        writer: &mut W,
        code: ResponseCode,
        payload: &[u8],
    ) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let header = ResponseHeader::new(code, payload.len() as u32);
        writer.write_all(&header.to_bytes()).await.map_err(map_io)?;
        writer.write_all(payload).await.map_err(map_io)?;
        writer.flush().await.map_err(map_io)?;
        Ok(())
    }
}

fn map_io(err: io::Error) -> ProtocolError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::WriteZero
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => ProtocolError::ConnectionClosed,
        _ => ProtocolError::Io(err),
    }
}

/// Validate a stored file name to prevent directory traversal
///
/// # Security
/// The server joins this name onto its storage directory, so anything that
/// could escape it is rejected.
pub fn validate_filename(filename: &str) -> Result<&str, ProtocolError> {
    if filename.is_empty() {
        return Err(ProtocolError::InvalidFormat("Empty filename".to_string()));
    }

    if filename.contains("..") {
        return Err(ProtocolError::InvalidFormat(
            "Path traversal detected".to_string(),
        ));
    }

    if filename.contains('/') || filename.contains('\\') {
        return Err(ProtocolError::InvalidFormat(
            "Path separators not allowed".to_string(),
        ));
    }

    if filename.starts_with('.') {
        return Err(ProtocolError::InvalidFormat(
            "Hidden files not allowed".to_string(),
        ));
    }

    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_layout() {
        let header = RequestHeader {
            user_id: [0xAB; USER_ID_SIZE],
            version: PROTOCOL_VERSION,
            code: RequestCode::UploadFile as u16,
            payload_size: 0x0102_0304,
        };
        let bytes = header.to_bytes();

        assert_eq!(bytes.len(), 23);
        assert_eq!(&bytes[..16], &[0xAB; 16]);
        assert_eq!(bytes[16], 1);
        // 1103 = 0x044F, little-endian
        assert_eq!(&bytes[17..19], &[0x4F, 0x04]);
        assert_eq!(&bytes[19..23], &[0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_response_header_decode() {
        let bytes = [1u8, 0x34, 0x08, 7, 0, 0, 0];
        let header = ResponseHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.version, 1);
        assert_eq!(header.code, 2100);
        assert_eq!(header.payload_size, 7);
        assert!(header.expect(ResponseCode::RegisterSuccess).is_ok());
    }

    #[test]
    fn test_header_decode_is_lossless() {
        for code in [1100u16, 1101, 1103, 1104, 1105, 1106] {
            for payload_size in [0u32, 1, 255, 275, u32::MAX] {
                let header = RequestHeader {
                    user_id: [code as u8; USER_ID_SIZE],
                    version: PROTOCOL_VERSION,
                    code,
                    payload_size,
                };
                assert_eq!(RequestHeader::from_bytes(&header.to_bytes()).unwrap(), header);
            }
        }
        for code in [2100u16, 2102, 2103, 2104, 0] {
            let header = ResponseHeader {
                version: PROTOCOL_VERSION,
                code,
                payload_size: 279,
            };
            assert_eq!(ResponseHeader::from_bytes(&header.to_bytes()).unwrap(), header);
        }
    }

    #[test]
    fn test_request_sizes() {
        assert_eq!(Request::<RegisterPayload>::SIZE, 23 + 255);
        assert_eq!(Request::<KeyExchangePayload>::SIZE, 23 + 255 + 160);
        assert_eq!(Request::<UploadFilePayload>::SIZE, 23 + 275);
        assert_eq!(Request::<ChecksumStatusPayload>::SIZE, 23 + 255);
        assert_eq!(FileUploaded::SIZE, 279);
    }

    #[test]
    fn test_request_new_fills_header() {
        let payload = RegisterPayload {
            user_name: FixedName::new("alice").unwrap(),
        };
        let request = Request::new(UNREGISTERED_ID, RequestCode::Register, payload);

        assert_eq!(request.header.version, PROTOCOL_VERSION);
        assert_eq!(request.header.code, 1100);
        assert_eq!(request.header.payload_size, 255);

        let bytes = request.to_bytes();
        assert_eq!(bytes.len(), Request::<RegisterPayload>::SIZE);
        assert_eq!(&bytes[23..28], b"alice");
        assert!(bytes[28..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fixed_name_limits() {
        assert!(FixedName::new(&"a".repeat(MAX_NAME_LEN)).is_ok());
        assert_eq!(
            FixedName::new(&"a".repeat(MAX_NAME_LEN + 1)),
            Err(NameError::TooLong(255))
        );
        assert_eq!(FixedName::new(""), Err(NameError::Empty));
        assert_eq!(FixedName::new("a\nb"), Err(NameError::InvalidCharacter));
        assert_eq!(FixedName::new("a\0b"), Err(NameError::InvalidCharacter));
    }

    #[test]
    fn test_fixed_name_multibyte_length_is_bytes() {
        // 127 two-byte characters = 254 bytes
        assert!(FixedName::new(&"é".repeat(127)).is_ok());
        assert!(FixedName::new(&"é".repeat(128)).is_err());
    }

    #[test]
    fn test_file_uploaded_decode() {
        let original = FileUploaded {
            client_id: [7; USER_ID_SIZE],
            content_size: 32,
            file_name: FixedName::new("report.pdf").unwrap(),
            checksum: 0xCBF4_3926,
        };
        let decoded = FileUploaded::from_bytes(&original.to_bytes()).unwrap();

        assert_eq!(decoded.file_name.as_str(), "report.pdf");
        assert_eq!(decoded.checksum, 0xCBF4_3926);
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_expect_rejects_wrong_version_and_code() {
        let header = ResponseHeader {
            version: 2,
            code: 2104,
            payload_size: 0,
        };
        assert!(matches!(
            header.expect(ResponseCode::MessageOk),
            Err(ProtocolError::VersionMismatch(2))
        ));

        let header = ResponseHeader::new(ResponseCode::MessageOk, 0);
        assert!(matches!(
            header.expect(ResponseCode::FileUploaded),
            Err(ProtocolError::UnexpectedResponse { .. })
        ));

        let header = ResponseHeader::new(ResponseCode::ServerError, 0);
        assert!(matches!(
            header.expect(ResponseCode::RegisterSuccess),
            Err(ProtocolError::ServerError)
        ));

        let header = ResponseHeader {
            version: PROTOCOL_VERSION,
            code: 9999,
            payload_size: 0,
        };
        assert!(matches!(
            header.expect(ResponseCode::MessageOk),
            Err(ProtocolError::UnknownResponseCode(9999))
        ));
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(matches!(
            ResponseHeader::from_bytes(&[1, 2, 3]),
            Err(ProtocolError::InconsistentSize { .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_fixed_short_read_is_connection_closed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        server.write_all(&[1, 0x34]).await.unwrap();
        drop(server);

        let result: Result<ResponseHeader, _> = MessageFramer::receive_fixed(&mut client).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_send_and_receive_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let request = Request::new(
            [3; USER_ID_SIZE],
            RequestCode::ValidChecksum,
            ChecksumStatusPayload {
                file_name: FixedName::new("a.txt").unwrap(),
            },
        );

        MessageFramer::send_fixed(&mut client, &request).await.unwrap();
        let received: Request<ChecksumStatusPayload> =
            MessageFramer::receive_fixed(&mut server).await.unwrap();

        assert_eq!(received, request);
        assert_eq!(
            received.header.request_code().unwrap(),
            RequestCode::ValidChecksum
        );
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("test.txt").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("a/b.txt").is_err());
        assert!(validate_filename("a\\b.txt").is_err());
        assert!(validate_filename(".hidden").is_err());
        assert!(validate_filename("").is_err());
    }
}

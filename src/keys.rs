//! RSA key lifecycle and hybrid key unwrapping
//!
//! The client owns one RSA-1024 keypair (public exponent 17). Its public
//! half travels as a 160-byte SubjectPublicKeyInfo; the server answers with a
//! fresh AES-128 session key wrapped under RSAES-OAEP/SHA-1.
//!
//! ## Security Considerations
//!
//! - Session keys are zeroized on drop and never printed
//! - 1024-bit RSA and SHA-1 OAEP are fixed by the wire format

use std::fmt;

use rand::{rngs::OsRng, RngCore};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use thiserror::Error;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::PUBLIC_KEY_SIZE;

pub const RSA_KEY_BITS: usize = 1024;
pub const RSA_PUBLIC_EXPONENT: u32 = 17;

/// AES-128 key length
pub const SESSION_KEY_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Failed to load private key: {0}")]
    KeyLoad(String),

    #[error("No RSA key has been generated or loaded")]
    NoKey,

    #[error("Exported public key is {0} bytes (field width: {PUBLIC_KEY_SIZE})")]
    PublicKeyWidth(usize),

    #[error("Key export failed: {0}")]
    Export(String),

    #[error("RSA decryption failed: {0}")]
    Decryption(String),

    #[error("RSA encryption failed: {0}")]
    Encryption(String),

    #[error("Session key is {0} bytes (expected {SESSION_KEY_SIZE})")]
    SessionKeyLength(usize),
}

/// Where the current keypair came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Uninitialized,
    Generated,
    Loaded,
}

/// Symmetric key for one key exchange; lives in memory only
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fresh random key from the OS generator
    pub fn generate() -> Self {
        let mut bytes = [0u8; SESSION_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey([REDACTED])")
    }
}

/// Holds the client's RSA keypair
pub struct RsaKeyManager {
    private_key: Option<RsaPrivateKey>,
    state: KeyState,
}

impl RsaKeyManager {
    pub fn new() -> Self {
        Self {
            private_key: None,
            state: KeyState::Uninitialized,
        }
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    /// Generate a fresh keypair, replacing any previous one
    pub fn gen_key(&mut self) -> Result<(), CryptoError> {
        let exponent = BigUint::from(RSA_PUBLIC_EXPONENT);
        let private_key = RsaPrivateKey::new_with_exp(&mut OsRng, RSA_KEY_BITS, &exponent)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        debug!("Generated {}-bit RSA keypair", RSA_KEY_BITS);
        self.private_key = Some(private_key);
        self.state = KeyState::Generated;
        Ok(())
    }

    /// Restore a keypair from its PKCS#8 DER private key
    pub fn load_key(&mut self, der: &[u8]) -> Result<(), CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::KeyLoad(e.to_string()))?;

        self.private_key = Some(private_key);
        self.state = KeyState::Loaded;
        Ok(())
    }

    fn key(&self) -> Result<&RsaPrivateKey, CryptoError> {
        self.private_key.as_ref().ok_or(CryptoError::NoKey)
    }

    /// Public key exactly as it goes on the wire
    pub fn public_key(&self) -> Result<[u8; PUBLIC_KEY_SIZE], CryptoError> {
        let document = self
            .key()?
            .to_public_key()
            .to_public_key_der()
            .map_err(|e| CryptoError::Export(e.to_string()))?;

        let bytes = document.as_bytes();
        <[u8; PUBLIC_KEY_SIZE]>::try_from(bytes).map_err(|_| CryptoError::PublicKeyWidth(bytes.len()))
    }

    /// PKCS#8 DER encoding of the private key, for the identity file
    pub fn private_key_der(&self) -> Result<Vec<u8>, CryptoError> {
        let document = self
            .key()?
            .to_pkcs8_der()
            .map_err(|e| CryptoError::Export(e.to_string()))?;
        Ok(document.as_bytes().to_vec())
    }

    /// RSAES-OAEP (SHA-1) decryption
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.key()?
            .decrypt(Oaep::new::<Sha1>(), ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))
    }

    /// Unwrap the server's AES key; anything but 16 bytes is rejected
    pub fn decrypt_session_key(&self, ciphertext: &[u8]) -> Result<SessionKey, CryptoError> {
        let mut plain = self.decrypt(ciphertext)?;
        let result = <[u8; SESSION_KEY_SIZE]>::try_from(plain.as_slice())
            .map(SessionKey::from_bytes)
            .map_err(|_| CryptoError::SessionKeyLength(plain.len()));
        plain.zeroize();
        result
    }
}

impl Default for RsaKeyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap `plaintext` for the holder of `public_key_der` (server side)
pub fn encrypt_for(public_key_der: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let public_key = RsaPublicKey::from_public_key_der(public_key_der)
        .map_err(|e| CryptoError::KeyLoad(e.to_string()))?;

    public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha1>(), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generated() -> RsaKeyManager {
        let mut keys = RsaKeyManager::new();
        keys.gen_key().unwrap();
        keys
    }

    #[test]
    fn test_public_key_fits_wire_field() {
        let keys = generated();
        assert_eq!(keys.state(), KeyState::Generated);

        let public = keys.public_key().unwrap();
        assert_eq!(public.len(), PUBLIC_KEY_SIZE);
        // SEQUENCE tag of the SubjectPublicKeyInfo
        assert_eq!(public[0], 0x30);
    }

    #[test]
    fn test_uninitialized_has_no_key() {
        let keys = RsaKeyManager::new();
        assert_eq!(keys.state(), KeyState::Uninitialized);
        assert!(matches!(keys.public_key(), Err(CryptoError::NoKey)));
        assert!(matches!(keys.decrypt(&[0u8; 128]), Err(CryptoError::NoKey)));
    }

    #[test]
    fn test_session_key_unwrap() {
        let keys = generated();
        let session_key = SessionKey::generate();

        let wrapped = encrypt_for(&keys.public_key().unwrap(), session_key.as_bytes()).unwrap();
        assert_eq!(wrapped.len(), RSA_KEY_BITS / 8);

        let unwrapped = keys.decrypt_session_key(&wrapped).unwrap();
        assert_eq!(unwrapped, session_key);
    }

    #[test]
    fn test_wrong_length_session_key_rejected() {
        let keys = generated();
        let wrapped = encrypt_for(&keys.public_key().unwrap(), &[9u8; 24]).unwrap();

        assert!(matches!(
            keys.decrypt_session_key(&wrapped),
            Err(CryptoError::SessionKeyLength(24))
        ));
    }

    #[test]
    fn test_garbage_ciphertext_fails() {
        let keys = generated();
        assert!(matches!(
            keys.decrypt(&[0x5Au8; 128]),
            Err(CryptoError::Decryption(_))
        ));
    }

    #[test]
    fn test_persisted_key_reloads() {
        let original = generated();
        let der = original.private_key_der().unwrap();

        let mut restored = RsaKeyManager::new();
        restored.load_key(&der).unwrap();

        assert_eq!(restored.state(), KeyState::Loaded);
        assert_eq!(restored.public_key().unwrap(), original.public_key().unwrap());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let mut keys = RsaKeyManager::new();
        assert!(matches!(
            keys.load_key(b"not a key"),
            Err(CryptoError::KeyLoad(_))
        ));
        assert_eq!(keys.state(), KeyState::Uninitialized);
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([0xAA; SESSION_KEY_SIZE]);
        let printed = format!("{:?}", key);
        assert!(!printed.contains("170"));
        assert!(!printed.to_lowercase().contains("aa"));
    }
}

//! Persisted client identity (`me.info`)
//!
//! ```text
//! alice                                       <- user name
//! 3f2a...e1                                   <- user id, 32 lowercase hex chars
//! MIICdQIBADANBgkqhkiG9w0BAQEFAASCAl8w...     <- PKCS#8 DER private key, base64
//! ```

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use tokio::fs;
use tracing::debug;

use crate::protocol::{FixedName, UserId, USER_ID_SIZE};

pub const DEFAULT_IDENTITY_FILE: &str = "me.info";

/// A registered user: name, server-assigned id and RSA private key
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_name: String,
    pub user_id: UserId,
    /// PKCS#8 DER
    pub rsa_private_key: Vec<u8>,
}

impl ClientIdentity {
    pub fn user_id_hex(&self) -> String {
        hex::encode(self.user_id)
    }

    fn to_file_contents(&self) -> String {
        format!(
            "{}\n{}\n{}\n",
            self.user_name,
            self.user_id_hex(),
            general_purpose::STANDARD.encode(&self.rsa_private_key)
        )
    }

    fn parse(contents: &str) -> Result<Self, String> {
        // `lines` drops "\n" and "\r\n"; the name is kept byte for byte
        let mut lines = contents.lines();

        let user_name = lines.next().ok_or("missing user name line")?;
        FixedName::new(user_name).map_err(|e| format!("invalid user name: {}", e))?;

        let id_line = lines.next().ok_or("missing user id line")?.trim_end();
        let id_bytes = hex::decode(id_line).map_err(|e| format!("invalid user id: {}", e))?;
        let user_id: UserId = id_bytes.try_into().map_err(|bytes: Vec<u8>| {
            format!(
                "user id is {} bytes (expected {})",
                bytes.len(),
                USER_ID_SIZE
            )
        })?;
        if user_id == [0u8; USER_ID_SIZE] {
            return Err("user id is all zeros".to_string());
        }

        let key_line = lines.next().ok_or("missing private key line")?.trim_end();
        let rsa_private_key = general_purpose::STANDARD
            .decode(key_line)
            .map_err(|e| format!("invalid private key encoding: {}", e))?;
        if rsa_private_key.is_empty() {
            return Err("empty private key".to_string());
        }

        Ok(Self {
            user_name: user_name.to_string(),
            user_id,
            rsa_private_key,
        })
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("user_name", &self.user_name)
            .field("user_id", &self.user_id_hex())
            .field("rsa_private_key", &"[REDACTED]")
            .finish()
    }
}

/// Outcome of reading the identity file
#[derive(Debug)]
pub enum IdentityLoad {
    Found(ClientIdentity),
    NotFound,
    /// The file exists but cannot be used; registering again overwrites it
    Corrupt(String),
}

/// File-backed identity persistence
#[derive(Debug, Clone)]
pub struct IdentityStore {
    path: PathBuf,
}

impl IdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the identity. Only unexpected I/O failures are errors.
    pub async fn load(&self) -> io::Result<IdentityLoad> {
        let contents = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(IdentityLoad::NotFound),
            Err(e) => return Err(e),
        };

        let loaded = match String::from_utf8(contents) {
            Ok(text) => match ClientIdentity::parse(&text) {
                Ok(identity) => IdentityLoad::Found(identity),
                Err(reason) => IdentityLoad::Corrupt(reason),
            },
            Err(_) => IdentityLoad::Corrupt("file is not valid UTF-8".to_string()),
        };
        Ok(loaded)
    }

    /// Write the identity, replacing any previous file
    pub async fn save(&self, identity: &ClientIdentity) -> io::Result<()> {
        fs::write(&self.path, identity.to_file_contents()).await?;

        // Restrict permissions (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, perms).await?;
        }

        debug!("Saved identity to {}", self.path.display());
        Ok(())
    }
}

impl Default for IdentityStore {
    fn default() -> Self {
        Self::new(DEFAULT_IDENTITY_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientIdentity {
        ClientIdentity {
            user_name: "alice".to_string(),
            user_id: [0x3C; USER_ID_SIZE],
            rsa_private_key: vec![0x30, 0x82, 0x01, 0x02, 0xFF],
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join(DEFAULT_IDENTITY_FILE));

        store.save(&sample()).await.unwrap();
        match store.load().await.unwrap() {
            IdentityLoad::Found(identity) => assert_eq!(identity, sample()),
            other => panic!("unexpected load result: {:?}", other),
        }

        let text = std::fs::read_to_string(store.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "alice");
        assert_eq!(lines[1], "3c".repeat(16));
    }

    #[tokio::test]
    async fn test_name_whitespace_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join(DEFAULT_IDENTITY_FILE));
        let identity = ClientIdentity {
            user_name: " alice  ".to_string(),
            ..sample()
        };

        store.save(&identity).await.unwrap();
        match store.load().await.unwrap() {
            IdentityLoad::Found(loaded) => assert_eq!(loaded.user_name, " alice  "),
            other => panic!("unexpected load result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_crlf_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join(DEFAULT_IDENTITY_FILE));
        std::fs::write(
            store.path(),
            "alice\r\n3c3c3c3c3c3c3c3c3c3c3c3c3c3c3c3c\r\nMIIBAg==\r\n",
        )
        .unwrap();

        match store.load().await.unwrap() {
            IdentityLoad::Found(loaded) => {
                assert_eq!(loaded.user_name, "alice");
                assert_eq!(loaded.user_id, [0x3C; USER_ID_SIZE]);
            }
            other => panic!("unexpected load result: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("me.info"));
        store.save(&sample()).await.unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("absent.info"));
        assert!(matches!(store.load().await.unwrap(), IdentityLoad::NotFound));
    }

    #[tokio::test]
    async fn test_corrupt_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path().join("me.info"));

        let cases = [
            "",
            "alice\n",
            "alice\nnot-hex\nAAAA\n",
            "alice\n0011\nAAAA\n",
            "alice\n00000000000000000000000000000000\nAAAA\n",
            "alice\n3c3c3c3c3c3c3c3c3c3c3c3c3c3c3c3c\n***\n",
        ];
        for contents in cases {
            std::fs::write(store.path(), contents).unwrap();
            assert!(
                matches!(store.load().await.unwrap(), IdentityLoad::Corrupt(_)),
                "accepted {:?}",
                contents
            );
        }
    }

    #[test]
    fn test_debug_hides_private_key() {
        let printed = format!("{:?}", sample());
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("255"));
    }
}

//! Authorized-keys store and the public-key authorization check.

use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Algorithm prefixes that mark the key-type field of a record.
const KEY_TYPE_PREFIXES: &[&str] = &["ssh-", "ecdsa-sha2-", "sk-"];

#[derive(Debug, Error)]
pub enum KeyLoadError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} contains no keys", .path.display())]
    Empty { path: PathBuf },
    #[error("{}:{line}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// True iff `credential` matches some trusted key on algorithm and key bytes.
pub fn authorize(credential: &PublicKey, trusted: &[PublicKey]) -> bool {
    let name = credential.name();
    let bytes = credential.public_key_bytes();
    trusted
        .iter()
        .any(|key| key.name() == name && key.public_key_bytes() == bytes)
}

/// Trusted public keys, loaded once at startup.
///
/// An empty set means authorization is disabled and every client is let in.
#[derive(Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<PublicKey>,
}

impl AuthorizedKeys {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: Vec<PublicKey>) -> Self {
        Self { keys }
    }

    /// Load an OpenSSH authorized_keys file.
    ///
    /// A missing file yields a disabled set. A file without keys, or with any
    /// unparseable record, is an error and nothing is loaded.
    pub fn load(path: &Path) -> Result<Self, KeyLoadError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No authorized keys at {:?}", path);
                return Ok(Self::disabled());
            }
            Err(source) => {
                return Err(KeyLoadError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut keys = Vec::new();
        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let key = parse_record(line).map_err(|reason| KeyLoadError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                reason,
            })?;
            keys.push(key);
        }

        if keys.is_empty() {
            return Err(KeyLoadError::Empty {
                path: path.to_path_buf(),
            });
        }

        tracing::info!("Loaded {} authorized keys from {:?}", keys.len(), path);
        Ok(Self { keys })
    }

    pub fn is_disabled(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PublicKey> {
        self.keys.iter()
    }

    /// Check a presented key, logging the caller on denial.
    pub fn authorize(&self, credential: &PublicKey, remote: Option<SocketAddr>) -> bool {
        let allowed = authorize(credential, &self.keys);
        if !allowed {
            let peer = remote.map_or_else(|| "unknown peer".to_string(), |addr| addr.to_string());
            tracing::warn!(
                target: "audit",
                "Rejected public key ({}) from {}",
                credential.name(),
                peer
            );
        }
        allowed
    }
}

impl fmt::Debug for AuthorizedKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedKeys")
            .field("len", &self.keys.len())
            .finish()
    }
}

/// Parse one `[options] keytype base64 [comment]` record.
fn parse_record(line: &str) -> Result<PublicKey, String> {
    let mut fields = line.split_whitespace();
    // Options come first when present; skip to the key type.
    let key_type = fields
        .by_ref()
        .find(|field| KEY_TYPE_PREFIXES.iter().any(|p| field.starts_with(p)))
        .ok_or_else(|| "no key type found".to_string())?;
    let blob = fields
        .next()
        .ok_or_else(|| format!("missing key data after {key_type}"))?;

    let key = russh_keys::parse_public_key_base64(blob).map_err(|e| e.to_string())?;
    if key.name() != key_type {
        return Err(format!(
            "key type {key_type} does not match key data ({})",
            key.name()
        ));
    }
    Ok(key)
}

// ── Password encryption at rest ──
//
// The manager account password is stored as `hex(nonce || ciphertext)`
// under AES-256-GCM. The key lives in its own file, created with 0600
// permissions on first start.

use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use secrecy::SecretString;

use crate::error::CoreError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Reversible protection of stored secrets.
pub trait PasswordCipher: Send + Sync {
    fn encrypt(&self, plain: &str) -> Result<String, CoreError>;
    fn decrypt(&self, stored: &str) -> Result<SecretString, CoreError>;
}

pub struct AesGcmCipher {
    aead: Aes256Gcm,
}

impl std::fmt::Debug for AesGcmCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCipher").finish_non_exhaustive()
    }
}

impl AesGcmCipher {
    pub fn new(key: &[u8]) -> Result<Self, CoreError> {
        if key.len() != KEY_LEN {
            return Err(CoreError::Crypto {
                message: format!("key must be {KEY_LEN} bytes, got {}", key.len()),
            });
        }
        let aead = Aes256Gcm::new_from_slice(key).map_err(|e| CoreError::Crypto {
            message: format!("invalid key: {e}"),
        })?;
        Ok(Self { aead })
    }

    /// Load the key at `path`, generating one when the file is missing.
    pub fn load_or_create(path: &Path) -> Result<Self, CoreError> {
        match fs::read(path) {
            Ok(raw) => {
                let key = hex::decode(String::from_utf8_lossy(&raw).trim()).map_err(|e| {
                    CoreError::Crypto {
                        message: format!("{}: {e}", path.display()),
                    }
                })?;
                Self::new(&key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Aes256Gcm::generate_key(OsRng);
                write_key(path, &hex::encode(key))?;
                tracing::info!(path = %path.display(), "generated password encryption key");
                Self::new(&key)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl PasswordCipher for AesGcmCipher {
    fn encrypt(&self, plain: &str) -> Result<String, CoreError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .aead
            .encrypt(&nonce, plain.as_bytes())
            .map_err(|e| CoreError::Crypto {
                message: format!("encrypt: {e}"),
            })?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(hex::encode(out))
    }

    fn decrypt(&self, stored: &str) -> Result<SecretString, CoreError> {
        let raw = hex::decode(stored).map_err(|e| CoreError::Crypto {
            message: format!("stored password is not hex: {e}"),
        })?;
        if raw.len() <= NONCE_LEN {
            return Err(CoreError::Crypto {
                message: "stored password is truncated".into(),
            });
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .aead
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|e| CoreError::Crypto {
                message: format!("decrypt: {e}"),
            })?;
        let plain = String::from_utf8(plain).map_err(|e| CoreError::Crypto {
            message: format!("decrypted password is not UTF-8: {e}"),
        })?;
        Ok(SecretString::from(plain))
    }
}

fn write_key(path: &Path, key_hex: &str) -> Result<(), CoreError> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(key_hex.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

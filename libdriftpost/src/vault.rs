//! Encrypted secret storage
//!
//! Platform credentials and the cached session token live in separate
//! age-encrypted files, locked with the passphrase from
//! `DRIFTPOST_VAULT_KEY`. Plaintext never touches disk; decrypted buffers
//! are zeroed on drop. Files are written with mode 0600 and refused if
//! they turn out to be symlinks.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::error::VaultError;

pub const VAULT_KEY_ENV: &str = "DRIFTPOST_VAULT_KEY";

const MIN_KEY_LEN: usize = 8;

/// The vault passphrase plus the age encrypt/decrypt mechanics. Cloned
/// freely; the inner key is zeroed on final drop.
#[derive(Clone)]
pub struct VaultKey {
    key: SecretString,
}

impl VaultKey {
    pub fn new(key: String) -> Result<Self, VaultError> {
        if key.len() < MIN_KEY_LEN {
            return Err(VaultError::WeakKey);
        }
        Ok(Self {
            key: SecretString::from(key),
        })
    }

    /// Key from `DRIFTPOST_VAULT_KEY`.
    pub fn from_env() -> Result<Self, VaultError> {
        let key = std::env::var(VAULT_KEY_ENV).map_err(|_| VaultError::MissingKey)?;
        Self::new(key)
    }

    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.key.expose_secret().to_string(),
        ));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        writer
            .finish()
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    /// A wrong passphrase or a mangled blob is always `VaultError::Decrypt`;
    /// the two are indistinguishable by design of the format.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, VaultError> {
        let decryptor = match age::Decryptor::new(data) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => return Err(VaultError::Decrypt),
            Err(_) => return Err(VaultError::Decrypt),
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(
                &age::secrecy::Secret::new(self.key.expose_secret().to_string()),
                None,
            )
            .map_err(|_| VaultError::Decrypt)?;
        reader
            .read_to_end(&mut decrypted)
            .map_err(|_| VaultError::Decrypt)?;

        Ok(decrypted)
    }
}

/// Platform login material. The password is only reachable through
/// [`Credentials::password`] and is zeroed when dropped.
pub struct Credentials {
    pub username: String,
    password: SecretString,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password: SecretString::from(password),
        }
    }

    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// On-disk plaintext layout, before encryption.
#[derive(Serialize, Deserialize)]
struct CredentialFile {
    username: String,
    password: String,
}

impl Drop for CredentialFile {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

pub struct CredentialVault {
    path: PathBuf,
    key: VaultKey,
}

impl CredentialVault {
    pub fn new(path: PathBuf, key: VaultKey) -> Self {
        Self { path, key }
    }

    /// Vault keyed from `DRIFTPOST_VAULT_KEY`.
    pub fn from_env(path: PathBuf) -> Result<Self, VaultError> {
        Ok(Self::new(path, VaultKey::from_env()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &VaultKey {
        &self.key
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Encrypt and write the credentials, creating parent directories as
    /// needed. On Unix the file is chmodded to 0600.
    pub fn store(&self, credentials: &Credentials) -> Result<(), VaultError> {
        let mut plaintext = serde_json::to_string(&CredentialFile {
            username: credentials.username.clone(),
            password: credentials.password().to_string(),
        })
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let encrypted = self.key.encrypt(plaintext.as_bytes());
        plaintext.zeroize();

        write_secret_file(&self.path, &encrypted?)?;
        tracing::debug!(path = %self.path.display(), "credentials stored");
        Ok(())
    }

    /// Read and decrypt the credentials. A wrong key or a corrupted blob is
    /// `VaultError::Decrypt`, which halts startup.
    pub fn load(&self) -> Result<Credentials, VaultError> {
        refuse_symlink(&self.path)?;

        let encrypted = std::fs::read(&self.path).map_err(VaultError::Io)?;
        let mut plaintext = self.key.decrypt(&encrypted)?;

        let parsed: Result<CredentialFile, _> = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        let file = parsed.map_err(|_| VaultError::Decrypt)?;

        Ok(Credentials::new(
            file.username.clone(),
            file.password.clone(),
        ))
    }
}

/// Write a secret file: symlink check, parent creation, 0600 on Unix.
pub(crate) fn write_secret_file(path: &Path, data: &[u8]) -> Result<(), VaultError> {
    refuse_symlink(path)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(VaultError::Io)?;
    }
    std::fs::write(path, data).map_err(VaultError::Io)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms).map_err(VaultError::Io)?;
    }

    Ok(())
}

pub(crate) fn refuse_symlink(path: &Path) -> Result<(), VaultError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            Err(VaultError::Symlink(path.display().to_string()))
        }
        _ => Ok(()),
    }
}

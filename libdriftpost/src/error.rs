//! Error types for Driftpost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriftError>;

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DriftError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            DriftError::InvalidInput(_) => 3,
            DriftError::Session(SessionError::AuthRejected(_)) => 2,
            DriftError::Upload(UploadError::Auth(_)) => 2,
            DriftError::Session(_) => 1,
            DriftError::Upload(_) => 1,
            DriftError::Config(_) => 1,
            DriftError::State(_) => 1,
            DriftError::Vault(_) => 1,
            DriftError::Io(_) => 1,
        }
    }

    /// True for errors that must halt startup rather than run in a
    /// corrupted mode (unreadable state, bad key material).
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(
            self,
            DriftError::State(StateError::Corrupt { .. }) | DriftError::Vault(_)
        )
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StateError {
    /// The persisted state cannot be parsed. Startup must halt loudly;
    /// silently discarding the file would lose queue and pacing progress.
    #[error("Persisted state at '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Decryption failed (wrong key or corrupted blob)")]
    Decrypt,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Vault key not set (export DRIFTPOST_VAULT_KEY)")]
    MissingKey,

    #[error("Vault key too short (minimum 8 characters)")]
    WeakKey,

    #[error("Credential file '{0}' is a symbolic link; refusing to use it")]
    Symlink(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum SessionError {
    /// The platform rejected the credentials. Never auto-retried in a tight
    /// loop; an escalating cooldown gates the next attempt.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Authentication cooling down until {until}")]
    CoolingDown { until: i64 },

    #[error("Session storage error: {0}")]
    Storage(String),
}

/// Upload adapter outcome classification. Transient errors retry with
/// backoff; terminal errors count straight against the attempt cap.
#[derive(Error, Debug, Clone)]
pub enum UploadError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Terminal failure: {0}")]
    Terminal(String),
}

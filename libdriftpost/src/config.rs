//! Configuration management for Driftpost

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub library: LibraryConfig,
    pub state: StateConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub vault: VaultConfig,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Where media files are discovered and where they go after upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub media_dir: String,
    pub uploaded_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory holding state.json and history.jsonl
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Success cooldown window, uniform random draw (seconds)
    pub min_success_delay_secs: u64,
    pub max_success_delay_secs: u64,
    /// Base for exponential failure backoff (seconds)
    pub base_retry_delay_secs: u64,
    pub max_backoff_level: u32,
    /// Attempts before an item is terminally failed
    pub max_attempts: u32,
    /// When true, a due schedule entry preempts the success cooldown but
    /// still honors failure backoff. When false it waits its turn like
    /// backlog items.
    pub scheduled_bypass_pacing: bool,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_success_delay_secs: 300,
            max_success_delay_secs: 900,
            base_retry_delay_secs: 60,
            max_backoff_level: 6,
            max_attempts: 5,
            scheduled_bypass_pacing: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub file: String,
    /// Age beyond which a cached session is re-authenticated (seconds)
    pub max_age_secs: u64,
    /// Base cooldown after a rejected login; doubles per consecutive
    /// failure up to the cap (lockout protection)
    pub auth_cooldown_secs: u64,
    pub auth_cooldown_cap_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            file: "~/.config/driftpost/session.age".to_string(),
            max_age_secs: 12 * 3600,
            auth_cooldown_secs: 60,
            auth_cooldown_cap_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    pub credentials_file: String,
}

/// Which upload adapter to run. With no command configured the daemon runs
/// against the built-in mock adapter (a dry run).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// External upload command (exec adapter). The command is invoked with
    /// an `auth`, `resume` or `publish` subcommand and classified by exit
    /// code: 0 success, 2 authentication rejected, 3 terminal, anything
    /// else transient.
    pub command: Option<String>,
    /// Extra arguments inserted before the subcommand
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Upper bound on idle sleep between iterations (seconds)
    pub poll_interval_secs: u64,
    /// Command inbox capacity; oldest commands are dropped when full
    pub command_capacity: usize,
    /// How many trailing history records a snapshot carries
    pub history_tail: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            command_capacity: 64,
            history_tail: 50,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            library: LibraryConfig {
                media_dir: "~/Pictures/driftpost".to_string(),
                uploaded_dir: "~/Pictures/driftpost/uploaded".to_string(),
            },
            state: StateConfig {
                dir: "~/.local/share/driftpost".to_string(),
            },
            pacing: PacingConfig::default(),
            session: SessionConfig::default(),
            vault: VaultConfig {
                credentials_file: "~/.config/driftpost/credentials.age".to_string(),
            },
            uploader: UploaderConfig::default(),
            worker: WorkerConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pacing.min_success_delay_secs > self.pacing.max_success_delay_secs {
            return Err(ConfigError::InvalidValue {
                field: "pacing.min_success_delay_secs".to_string(),
                reason: "minimum must not exceed maximum".to_string(),
            }
            .into());
        }
        if self.pacing.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "pacing.max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.worker.command_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker.command_capacity".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn media_dir(&self) -> PathBuf {
        expand(&self.library.media_dir)
    }

    pub fn uploaded_dir(&self) -> PathBuf {
        expand(&self.library.uploaded_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        expand(&self.state.dir)
    }

    pub fn session_file(&self) -> PathBuf {
        expand(&self.session.file)
    }

    pub fn credentials_file(&self) -> PathBuf {
        expand(&self.vault.credentials_file)
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("DRIFTPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("driftpost").join("config.toml"))
}

//! Driftpost - paced media publication daemon
//!
//! This library provides the durable state engine and scheduling core for
//! drip-feeding a directory of media files to a social platform: crash-safe
//! queue and schedule persistence, human-like pacing between posts, and a
//! pluggable upload adapter boundary.

pub mod commands;
pub mod config;
pub mod content;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod types;
pub mod uploader;
pub mod vault;
pub mod worker;

// Re-export commonly used types
pub use commands::{Command, CommandInbox};
pub use config::Config;
pub use error::{DriftError, Result};
pub use scheduler::{Decision, Scheduler};
pub use store::StateStore;
pub use types::{MediaItem, MediaStatus, Snapshot, State};
pub use uploader::Uploader;
pub use vault::{CredentialVault, Credentials, VaultKey};
pub use worker::UploadWorker;

//! Upload adapter abstraction
//!
//! The worker talks to the platform through the [`Uploader`] trait:
//! authenticate with vault credentials, optionally resume a persisted
//! session token, and publish one media item at a time. Every failure is
//! classified as [`UploadError::Auth`], [`UploadError::Transient`] or
//! [`UploadError::Terminal`]; the classification drives retry and backoff,
//! so an adapter that cannot tell must err on the side of Transient.

use async_trait::async_trait;

use crate::error::UploadError;
use crate::types::MediaItem;
use crate::vault::Credentials;

pub mod exec;
// Mock uploader is available for all builds (not just tests) to support
// integration tests and dry runs.
pub mod mock;

pub use exec::ExecUploader;
pub use mock::MockUploader;

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Lowercase adapter identifier (e.g. "exec", "mock").
    fn name(&self) -> &str;

    /// Establish a fresh session, returning an opaque token suitable for
    /// persisting and later passing to [`Uploader::resume`].
    ///
    /// # Errors
    ///
    /// `UploadError::Auth` when the platform rejects the credentials;
    /// `UploadError::Transient` for network-shaped failures worth retrying.
    async fn authenticate(&mut self, credentials: &Credentials) -> Result<String, UploadError>;

    /// Resume a previously persisted session token.
    ///
    /// # Errors
    ///
    /// `UploadError::Auth` when the platform no longer accepts the token;
    /// the caller falls back to a fresh [`Uploader::authenticate`].
    async fn resume(&mut self, token: &str) -> Result<(), UploadError>;

    /// Publish one media item, returning the platform's post id.
    ///
    /// # Errors
    ///
    /// - `UploadError::Auth` — session invalid or expired mid-flight
    /// - `UploadError::Transient` — worth retrying with backoff
    /// - `UploadError::Terminal` — the platform rejected this media; the
    ///   item counts straight against its attempt cap
    async fn publish(&self, item: &MediaItem) -> Result<String, UploadError>;
}

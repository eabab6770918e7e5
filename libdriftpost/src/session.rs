//! Platform session lifecycle
//!
//! A successful login yields an opaque session token that is persisted
//! (age-encrypted with the vault key) so a restart does not re-authenticate.
//! Sessions age out after a configured maximum; an unreadable or
//! undecryptable session file is simply treated as absent, since a session
//! is always re-derivable from the vault credentials.
//!
//! Repeated authentication rejections trip an escalating cooldown (base
//! doubling per consecutive failure, capped) so a bad password or a
//! platform challenge never turns into a login hammer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::vault::{write_secret_file, VaultKey};

/// Persisted session material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub username: String,
    pub token: String,
    pub established_at: i64,
}

pub struct SessionManager {
    path: PathBuf,
    /// None (dry runs) disables persistence; sessions then live only in
    /// the adapter for the process lifetime.
    key: Option<VaultKey>,
    max_age: i64,
    cooldown_base: i64,
    cooldown_cap: i64,
    consecutive_failures: u32,
    cooldown_until: i64,
}

impl SessionManager {
    pub fn new(path: PathBuf, config: &SessionConfig, key: Option<VaultKey>) -> Self {
        Self {
            path,
            key,
            max_age: config.max_age_secs as i64,
            cooldown_base: config.auth_cooldown_secs as i64,
            cooldown_cap: config.auth_cooldown_cap_secs as i64,
            consecutive_failures: 0,
            cooldown_until: 0,
        }
    }

    /// Load the persisted session if it exists, decrypts, belongs to
    /// `username` and has not aged out. Anything else (missing, stale,
    /// unreadable, wrong account) is None.
    pub fn load_valid(&self, now: i64, username: &str) -> Option<SessionRecord> {
        let key = self.key.as_ref()?;
        let encrypted = std::fs::read(&self.path).ok()?;

        let plaintext = match key.decrypt(&encrypted) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "discarding undecryptable session file"
                );
                return None;
            }
        };
        let record: SessionRecord = match serde_json::from_slice(&plaintext) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "discarding unreadable session file"
                );
                return None;
            }
        };

        if record.username != username {
            tracing::info!(
                stored = %record.username,
                wanted = %username,
                "session belongs to a different account; ignoring"
            );
            return None;
        }
        if now - record.established_at > self.max_age {
            tracing::info!(age_secs = now - record.established_at, "session aged out");
            return None;
        }

        Some(record)
    }

    /// Persist a fresh session, encrypted, 0600 on Unix.
    pub fn store(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let Some(key) = self.key.as_ref() else {
            tracing::debug!("no vault key; session not persisted");
            return Ok(());
        };

        let json =
            serde_json::to_vec(record).map_err(|e| SessionError::Storage(e.to_string()))?;
        let encrypted = key
            .encrypt(&json)
            .map_err(|e| SessionError::Storage(e.to_string()))?;
        write_secret_file(&self.path, &encrypted)
            .map_err(|e| SessionError::Storage(e.to_string()))?;

        Ok(())
    }

    /// Remove the persisted session (e.g. after the platform invalidated
    /// the token). A missing file is not an error.
    pub fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Storage(e.to_string())),
        }
    }

    /// Gate a login attempt on the failure cooldown.
    pub fn check_cooldown(&self, now: i64) -> Result<(), SessionError> {
        if now < self.cooldown_until {
            return Err(SessionError::CoolingDown {
                until: self.cooldown_until,
            });
        }
        Ok(())
    }

    /// Register an authentication rejection: the next attempt is pushed out
    /// by base * 2^(failures-1), capped.
    pub fn record_auth_failure(&mut self, now: i64) {
        self.consecutive_failures += 1;
        let exponent = (self.consecutive_failures - 1).min(30);
        let delay = self
            .cooldown_base
            .saturating_mul(1i64 << exponent)
            .min(self.cooldown_cap);
        self.cooldown_until = now + delay;
        tracing::warn!(
            failures = self.consecutive_failures,
            retry_in_secs = delay,
            "authentication rejected; cooling down"
        );
    }

    pub fn record_auth_success(&mut self) {
        self.consecutive_failures = 0;
        self.cooldown_until = 0;
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> SessionConfig {
        SessionConfig {
            file: "~/.config/driftpost/session.age".to_string(),
            max_age_secs: 1000,
            auth_cooldown_secs: 60,
            auth_cooldown_cap_secs: 3600,
        }
    }

    fn key() -> VaultKey {
        VaultKey::new("session-test-key".to_string()).unwrap()
    }

    fn manager(dir: &TempDir) -> SessionManager {
        SessionManager::new(dir.path().join("session.age"), &config(), Some(key()))
    }

    fn record(username: &str, at: i64) -> SessionRecord {
        SessionRecord {
            username: username.to_string(),
            token: "tok-1".to_string(),
            established_at: at,
        }
    }

    #[test]
    fn test_store_and_load_valid() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.store(&record("poster", 1000)).unwrap();

        let loaded = m.load_valid(1500, "poster").expect("session is fresh");
        assert_eq!(loaded.token, "tok-1");
    }

    #[test]
    fn test_session_file_is_encrypted() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.store(&record("poster", 1000)).unwrap();

        let on_disk = std::fs::read(m.path()).unwrap();
        let as_text = String::from_utf8_lossy(&on_disk);
        assert!(!as_text.contains("tok-1"));
        assert!(!as_text.contains("poster"));
    }

    #[test]
    fn test_wrong_key_is_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        manager(&dir).store(&record("poster", 1000)).unwrap();

        let other = SessionManager::new(
            dir.path().join("session.age"),
            &config(),
            Some(VaultKey::new("a-different-key".to_string()).unwrap()),
        );
        // Disposable, so a key mismatch is a re-login, not a crash
        assert!(other.load_valid(1100, "poster").is_none());
    }

    #[test]
    fn test_no_key_disables_persistence() {
        let dir = TempDir::new().unwrap();
        let m = SessionManager::new(dir.path().join("session.age"), &config(), None);

        m.store(&record("poster", 1000)).unwrap();
        assert!(!m.path().exists());
        assert!(m.load_valid(1100, "poster").is_none());
    }

    #[test]
    fn test_aged_out_session_is_none() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.store(&record("poster", 1000)).unwrap();

        assert!(m.load_valid(2001, "poster").is_none());
    }

    #[test]
    fn test_wrong_account_is_none() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.store(&record("someone-else", 1000)).unwrap();

        assert!(m.load_valid(1100, "poster").is_none());
    }

    #[test]
    fn test_garbage_session_is_none_not_error() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        std::fs::write(m.path(), "definitely not an age blob").unwrap();

        assert!(m.load_valid(1000, "poster").is_none());
    }

    #[test]
    fn test_missing_session_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(manager(&dir).load_valid(1000, "poster").is_none());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.store(&record("poster", 1000)).unwrap();
        m.clear().unwrap();
        m.clear().unwrap();
        assert!(m.load_valid(1001, "poster").is_none());
    }

    #[test]
    fn test_cooldown_escalates_and_caps() {
        let dir = TempDir::new().unwrap();
        let mut m = manager(&dir);
        let now = 10_000;

        assert!(m.check_cooldown(now).is_ok());

        m.record_auth_failure(now);
        match m.check_cooldown(now) {
            Err(SessionError::CoolingDown { until }) => assert_eq!(until, now + 60),
            other => panic!("expected cooldown, got {:?}", other.err()),
        }

        m.record_auth_failure(now);
        match m.check_cooldown(now) {
            Err(SessionError::CoolingDown { until }) => assert_eq!(until, now + 120),
            other => panic!("expected cooldown, got {:?}", other.err()),
        }

        for _ in 0..10 {
            m.record_auth_failure(now);
        }
        match m.check_cooldown(now) {
            Err(SessionError::CoolingDown { until }) => {
                assert_eq!(until, now + 3600, "cooldown must cap");
            }
            other => panic!("expected cooldown, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_success_resets_cooldown() {
        let dir = TempDir::new().unwrap();
        let mut m = manager(&dir);
        m.record_auth_failure(1000);
        m.record_auth_success();
        assert!(m.check_cooldown(1001).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_session_file_mode_is_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.store(&record("poster", 1000)).unwrap();

        let mode = std::fs::metadata(m.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

//! External-command upload adapter
//!
//! Wraps a user-provided CLI that does the actual platform talking. The
//! command is invoked once per operation with a subcommand:
//!
//! ```text
//! <command> [args..] auth --user <username>     # password on stdin
//! <command> [args..] resume                     # token in DRIFTPOST_SESSION_TOKEN
//! <command> [args..] publish <path>             # token in DRIFTPOST_SESSION_TOKEN
//! ```
//!
//! stdout (trimmed) carries the result: the session token for `auth`, the
//! remote post id for `publish`. The exit code classifies failures:
//! 0 success, 2 authentication rejected, 3 terminal, anything else
//! transient. The password never appears in argv or the environment.

use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::UploaderConfig;
use crate::error::UploadError;
use crate::types::MediaItem;
use crate::uploader::Uploader;
use crate::vault::Credentials;

const TOKEN_ENV: &str = "DRIFTPOST_SESSION_TOKEN";

pub struct ExecUploader {
    program: String,
    base_args: Vec<String>,
    token: Option<String>,
}

impl ExecUploader {
    pub fn new(program: String, base_args: Vec<String>) -> Self {
        Self {
            program,
            base_args,
            token: None,
        }
    }

    /// None when no command is configured (the caller falls back to the
    /// mock adapter).
    pub fn from_config(config: &UploaderConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|command| Self::new(command.clone(), config.args.clone()))
    }

    async fn run(
        &self,
        subcommand: &[&str],
        stdin_data: Option<&[u8]>,
        token: Option<&str>,
    ) -> Result<String, UploadError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .args(subcommand)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = token {
            command.env(TOKEN_ENV, token);
        }

        let mut child = command
            .spawn()
            .map_err(|e| UploadError::Transient(format!("failed to spawn {}: {}", self.program, e)))?;

        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(data)
                    .await
                    .map_err(|e| UploadError::Transient(format!("stdin write failed: {}", e)))?;
                // Close stdin so the child sees EOF
                drop(stdin);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| UploadError::Transient(format!("wait failed: {}", e)))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let detail = {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let trimmed = stderr.trim();
            if trimmed.is_empty() {
                "no diagnostic output".to_string()
            } else {
                trimmed.to_string()
            }
        };

        Err(match output.status.code() {
            Some(2) => UploadError::Auth(detail),
            Some(3) => UploadError::Terminal(detail),
            Some(code) => UploadError::Transient(format!("exit code {}: {}", code, detail)),
            None => UploadError::Transient(format!("terminated by signal: {}", detail)),
        })
    }
}

#[async_trait]
impl Uploader for ExecUploader {
    fn name(&self) -> &str {
        "exec"
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<String, UploadError> {
        let token = self
            .run(
                &["auth", "--user", &credentials.username],
                Some(credentials.password().as_bytes()),
                None,
            )
            .await?;
        if token.is_empty() {
            return Err(UploadError::Transient(
                "auth produced no session token".to_string(),
            ));
        }
        tracing::info!(adapter = self.name(), "session established");
        self.token = Some(token.clone());
        Ok(token)
    }

    async fn resume(&mut self, token: &str) -> Result<(), UploadError> {
        self.run(&["resume"], None, Some(token)).await?;
        self.token = Some(token.to_string());
        Ok(())
    }

    async fn publish(&self, item: &MediaItem) -> Result<String, UploadError> {
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| UploadError::Auth("no active session".to_string()))?;

        let path = item.path.display().to_string();
        let remote_id = self.run(&["publish", &path], None, Some(token)).await?;
        if remote_id.is_empty() {
            return Err(UploadError::Transient(
                "publish produced no post id".to_string(),
            ));
        }
        Ok(remote_id)
    }
}

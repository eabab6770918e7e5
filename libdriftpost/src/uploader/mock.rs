//! Mock uploader for testing and dry runs
//!
//! Publish outcomes can be scripted per call to drive retry, backoff and
//! terminal-failure paths in integration tests without any network access.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::UploadError;
use crate::types::MediaItem;
use crate::uploader::Uploader;
use crate::vault::Credentials;

#[derive(Default)]
struct MockRecorder {
    auth_calls: usize,
    resume_calls: usize,
    publish_calls: usize,
    published: Vec<String>,
}

pub struct MockUploader {
    name: String,
    auth_succeeds: bool,
    resume_succeeds: bool,
    /// Scripted publish outcomes, consumed front to back; when exhausted
    /// every publish succeeds with a generated id.
    script: Mutex<VecDeque<Result<String, UploadError>>>,
    recorder: Arc<Mutex<MockRecorder>>,
    authenticated: bool,
}

impl MockUploader {
    /// An uploader where everything succeeds.
    pub fn success() -> Self {
        Self {
            name: "mock".to_string(),
            auth_succeeds: true,
            resume_succeeds: true,
            script: Mutex::new(VecDeque::new()),
            recorder: Arc::new(Mutex::new(MockRecorder::default())),
            authenticated: false,
        }
    }

    /// An uploader whose credentials are always rejected.
    pub fn auth_failure() -> Self {
        Self {
            auth_succeeds: false,
            ..Self::success()
        }
    }

    /// An uploader that rejects persisted tokens but accepts fresh logins.
    pub fn stale_session() -> Self {
        Self {
            resume_succeeds: false,
            ..Self::success()
        }
    }

    /// Queue an outcome for the next unscripted publish call.
    pub fn push_outcome(&self, outcome: Result<String, UploadError>) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
    }

    pub fn auth_calls(&self) -> usize {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner()).auth_calls
    }

    pub fn resume_calls(&self) -> usize {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner()).resume_calls
    }

    pub fn publish_calls(&self) -> usize {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner()).publish_calls
    }

    /// Item ids published so far, in order.
    pub fn published(&self) -> Vec<String> {
        self.recorder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .published
            .clone()
    }

    /// Handle for inspecting calls after the uploader has been moved into
    /// the worker.
    pub fn recorder_handle(&self) -> MockRecorderHandle {
        MockRecorderHandle {
            inner: Arc::clone(&self.recorder),
        }
    }
}

/// Cloneable view over a [`MockUploader`]'s call record.
#[derive(Clone)]
pub struct MockRecorderHandle {
    inner: Arc<Mutex<MockRecorder>>,
}

impl MockRecorderHandle {
    pub fn publish_calls(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).publish_calls
    }

    pub fn published(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .published
            .clone()
    }
}

#[async_trait]
impl Uploader for MockUploader {
    fn name(&self) -> &str {
        &self.name
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> Result<String, UploadError> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner()).auth_calls += 1;

        if self.auth_succeeds {
            self.authenticated = true;
            Ok(format!("mock-session-{}", credentials.username))
        } else {
            Err(UploadError::Auth("mock credentials rejected".to_string()))
        }
    }

    async fn resume(&mut self, _token: &str) -> Result<(), UploadError> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner()).resume_calls += 1;

        if self.resume_succeeds {
            self.authenticated = true;
            Ok(())
        } else {
            Err(UploadError::Auth("mock session expired".to_string()))
        }
    }

    async fn publish(&self, item: &MediaItem) -> Result<String, UploadError> {
        self.recorder.lock().unwrap_or_else(|e| e.into_inner()).publish_calls += 1;

        if !self.authenticated {
            return Err(UploadError::Auth("not authenticated".to_string()));
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let outcome = match scripted {
            Some(outcome) => outcome,
            None => Ok(format!("mock:post-{}", uuid::Uuid::new_v4())),
        };

        if outcome.is_ok() {
            self.recorder
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .published
                .push(item.id.clone());
        }
        outcome
    }
}

//! The upload worker
//!
//! A single task owns the durable state and everything that mutates it:
//! discovery scans, schedule edits, dispatch decisions, upload attempts and
//! history appends. Observers get point-in-time [`Snapshot`]s over a watch
//! channel; control planes push [`Command`]s into the inbox. Nothing else
//! ever touches the state files.
//!
//! Write ordering on a successful upload is load-bearing: the media file is
//! moved out of the library first, then the Success record is appended to
//! history, then the state (item removed, pacing advanced) is committed. A
//! crash between the append and the commit leaves the item `Uploading` in
//! the state file with a Success already in history; recovery sees the
//! record and drops the item instead of posting it twice.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::commands::{Command, CommandInbox};
use crate::config::Config;
use crate::content;
use crate::error::{Result, SessionError, UploadError};
use crate::scheduler::{Decision, Dispatch, PacingPolicy, Scheduler};
use crate::session::{SessionManager, SessionRecord};
use crate::store::{successful_ids, terminal_ids, StateStore};
use crate::types::{HistoryRecord, MediaItem, MediaStatus, ScheduleEntry, Snapshot, State};
use crate::uploader::Uploader;
use crate::vault::{Credentials, VaultKey};

/// What one worker step did, for callers that drive stepping themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// An upload attempt ran (successfully or not).
    Dispatched,
    /// Nothing was due; `wake_at` hints when something might be.
    Idle { wake_at: Option<i64> },
    /// A shutdown command was drained.
    Shutdown,
}

pub struct UploadWorker {
    config: Config,
    store: StateStore,
    scheduler: Scheduler,
    uploader: Box<dyn Uploader>,
    session: SessionManager,
    credentials: Credentials,
    inbox: Arc<CommandInbox>,
    snapshot_tx: watch::Sender<Snapshot>,
    state: State,
    history: Vec<HistoryRecord>,
    paused: bool,
    session_ready: bool,
    next_scan_at: i64,
}

impl UploadWorker {
    pub fn new(
        config: Config,
        uploader: Box<dyn Uploader>,
        credentials: Credentials,
        session_key: Option<VaultKey>,
    ) -> Result<Self> {
        let store = StateStore::open(&config.state_dir())?;
        let state = store.load()?;
        let history = store.load_history()?;

        std::fs::create_dir_all(config.media_dir())?;

        let scheduler = Scheduler::new(PacingPolicy::from_config(&config.pacing));
        let session = SessionManager::new(config.session_file(), &config.session, session_key);
        let inbox = CommandInbox::new(config.worker.command_capacity);
        let (snapshot_tx, _) = watch::channel(Snapshot::default());

        Ok(Self {
            config,
            store,
            scheduler,
            uploader,
            session,
            credentials,
            inbox,
            snapshot_tx,
            state,
            history,
            paused: false,
            session_ready: false,
            next_scan_at: 0,
        })
    }

    /// Handle for pushing commands from other tasks.
    pub fn inbox(&self) -> Arc<CommandInbox> {
        Arc::clone(&self.inbox)
    }

    /// Subscribe to state snapshots.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Recovery and the initial scan, run once before stepping.
    pub fn startup(&mut self, now: i64) -> Result<()> {
        let successes = successful_ids(&self.history);
        let recovered = self.scheduler.recover(&mut self.state, &successes);
        if recovered > 0 {
            tracing::info!(recovered, "requeued interrupted uploads");
        }
        // Persist recovery results even when nothing was requeued, so a
        // dropped completed item does not resurrect on the next start.
        self.store.commit(&mut self.state)?;

        self.scan(now)?;
        self.next_scan_at = now + self.config.worker.poll_interval_secs as i64;
        self.publish_snapshot();
        Ok(())
    }

    /// Run until a shutdown command or signal-initiated shutdown.
    pub async fn run(mut self) -> Result<()> {
        tracing::info!(
            adapter = self.uploader.name(),
            media_dir = %self.config.media_dir().display(),
            "worker starting"
        );
        self.startup(timestamp())?;

        loop {
            let now = timestamp();
            match self.step(now).await? {
                StepOutcome::Shutdown => break,
                StepOutcome::Dispatched => continue,
                StepOutcome::Idle { wake_at } => {
                    let mut until = now + self.config.worker.poll_interval_secs as i64;
                    until = until.min(self.next_scan_at.max(now + 1));
                    if let Some(wake) = wake_at {
                        until = until.min(wake.max(now + 1));
                    }
                    let sleep = Duration::from_secs((until - now).max(1) as u64);
                    tokio::select! {
                        _ = self.inbox.notified() => {}
                        _ = tokio::time::sleep(sleep) => {}
                    }
                }
            }
        }

        tracing::info!("worker stopped");
        Ok(())
    }

    /// One iteration at time `now`: drain commands, scan if due, then make
    /// and execute at most one dispatch decision.
    pub async fn step(&mut self, now: i64) -> Result<StepOutcome> {
        if self.handle_commands(now)? {
            return Ok(StepOutcome::Shutdown);
        }

        if now >= self.next_scan_at {
            self.scan(now)?;
            self.next_scan_at = now + self.config.worker.poll_interval_secs as i64;
        }

        if self.paused {
            return Ok(StepOutcome::Idle { wake_at: None });
        }

        match self.scheduler.next_action(now, &mut self.state) {
            Decision::Dispatch(dispatch) => {
                self.attempt(now, &dispatch).await?;
                Ok(StepOutcome::Dispatched)
            }
            Decision::Idle { wake_at } => Ok(StepOutcome::Idle { wake_at }),
        }
    }

    /// Drain and apply queued commands. Returns true on shutdown.
    fn handle_commands(&mut self, now: i64) -> Result<bool> {
        let commands = self.inbox.drain();
        if commands.is_empty() {
            return Ok(false);
        }

        let mut dirty = false;
        let mut shutdown = false;
        for command in commands {
            match command {
                Command::Rescan => {
                    self.scan(now)?;
                    self.next_scan_at = now + self.config.worker.poll_interval_secs as i64;
                }
                Command::Pause => {
                    if !self.paused {
                        tracing::info!("dispatch paused");
                        self.paused = true;
                    }
                }
                Command::Resume => {
                    if self.paused {
                        tracing::info!("dispatch resumed");
                        self.paused = false;
                    }
                }
                Command::ScheduleAt {
                    path,
                    target_at,
                    one_shot,
                } => {
                    dirty |= self.schedule_at(now, &path, target_at, one_shot);
                }
                Command::CancelSchedule { entry_id } => {
                    dirty |= self.cancel_schedule(&entry_id);
                }
                Command::ExportHistory { dest } => self.export_history(&dest),
                Command::Shutdown => shutdown = true,
            }
        }

        if dirty {
            self.store.commit(&mut self.state)?;
        }
        self.publish_snapshot();
        Ok(shutdown)
    }

    /// Pin a file to a wall-clock time. An item already in the backlog
    /// migrates to the schedule table; an unknown file is hashed and
    /// admitted directly.
    fn schedule_at(&mut self, now: i64, path: &Path, target_at: i64, one_shot: bool) -> bool {
        let id = match content::content_id(path) {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot schedule unreadable file");
                return false;
            }
        };

        if terminal_ids(&self.history).contains(&id) {
            tracing::warn!(path = %path.display(), "refusing to schedule: already has a final outcome");
            return false;
        }
        if self.state.scheduled.iter().any(|e| e.item.id == id) {
            tracing::warn!(path = %path.display(), "already scheduled");
            return false;
        }

        let mut item = match self.state.backlog.iter().position(|i| i.id == id) {
            Some(pos) => match self.state.backlog.remove(pos) {
                Some(item) => item,
                None => return false,
            },
            None => MediaItem::new(id, path.to_path_buf()),
        };
        if item.status == MediaStatus::Uploading {
            // In flight right now; its outcome will land first
            self.state.backlog.push_front(item);
            tracing::warn!(path = %path.display(), "cannot schedule an item mid-upload");
            return false;
        }
        item.status = MediaStatus::Scheduled;

        let mut entry = ScheduleEntry::new(item, target_at);
        entry.one_shot = one_shot;
        tracing::info!(
            entry = %entry.id,
            target_at,
            in_secs = target_at - now,
            filename = %entry.item.filename,
            "scheduled"
        );
        self.state.scheduled.push(entry);
        true
    }

    /// Remove a schedule entry; its item rejoins the backlog.
    fn cancel_schedule(&mut self, entry_id: &str) -> bool {
        let Some(pos) = self.state.scheduled.iter().position(|e| e.id == entry_id) else {
            tracing::warn!(entry_id, "cancel: no such schedule entry");
            return false;
        };
        let entry = self.state.scheduled.remove(pos);
        if entry.item.status == MediaStatus::Uploading {
            tracing::warn!(entry_id, "cancel: entry is mid-upload");
            self.state.scheduled.insert(pos, entry);
            return false;
        }

        let mut item = entry.item;
        item.status = MediaStatus::Pending;
        tracing::info!(entry_id, filename = %item.filename, "schedule cancelled; item back in backlog");
        self.state.backlog.push_back(item);
        true
    }

    /// Copy the history file somewhere the operator can reach it. A
    /// best-effort operation; failures are logged, never fatal.
    fn export_history(&self, dest: &Path) {
        let src = self.store.history_path();
        if !src.exists() {
            tracing::warn!("export: no history yet");
            return;
        }
        match std::fs::copy(src, dest) {
            Ok(bytes) => {
                tracing::info!(dest = %dest.display(), bytes, "history exported");
            }
            Err(e) => {
                tracing::warn!(dest = %dest.display(), error = %e, "history export failed");
            }
        }
    }

    /// Discover new media files and append them to the backlog.
    fn scan(&mut self, _now: i64) -> Result<()> {
        let excluded = terminal_ids(&self.history);
        let found = content::scan(&self.config.media_dir(), &excluded, &self.state)?;
        if found.is_empty() {
            return Ok(());
        }

        tracing::info!(count = found.len(), "discovered new media");
        for item in found {
            tracing::debug!(filename = %item.filename, id = %item.id, "enqueued");
            self.state.backlog.push_back(item);
        }
        self.store.commit(&mut self.state)?;
        self.publish_snapshot();
        Ok(())
    }

    /// Execute one dispatched upload attempt end to end.
    async fn attempt(&mut self, now: i64, dispatch: &Dispatch) -> Result<()> {
        // The Uploading mark must hit disk before the attempt, so a crash
        // mid-upload is distinguishable from never having started.
        self.store.commit(&mut self.state)?;
        self.publish_snapshot();

        tracing::info!(
            filename = %dispatch.item.filename,
            attempt = dispatch.item.attempts,
            "uploading"
        );

        if let Err(error) = self.ensure_session(now).await {
            // The platform never saw this attempt, so it must not count
            // against the item's cap. Back off and put the item back.
            if matches!(error, UploadError::Auth(_)) {
                self.session_ready = false;
                if let Err(e) = self.session.clear() {
                    tracing::warn!(error = %e, "could not clear session file");
                }
            }
            self.scheduler
                .record_session_failure(now, &mut self.state, dispatch);
            tracing::warn!(
                filename = %dispatch.item.filename,
                error = %error,
                next_allowed_at = self.state.pacing.next_allowed_at,
                "no session; attempt not charged to the item"
            );
            self.store.commit(&mut self.state)?;
            self.publish_snapshot();
            return Ok(());
        }

        match self.uploader.publish(&dispatch.item).await {
            Ok(remote_id) => {
                if let Err(e) = self.move_to_uploaded(&dispatch.item) {
                    // The post exists remotely; losing the move must not
                    // lose the record
                    tracing::warn!(
                        filename = %dispatch.item.filename,
                        error = %e,
                        "uploaded but could not move file out of library"
                    );
                }

                let record =
                    self.scheduler
                        .record_success(now, &mut self.state, dispatch, &remote_id);
                self.store.append_history(&record)?;
                self.history.push(record);
                self.store.commit(&mut self.state)?;

                tracing::info!(
                    filename = %dispatch.item.filename,
                    remote_id = %remote_id,
                    next_allowed_at = self.state.pacing.next_allowed_at,
                    "upload succeeded"
                );
            }
            Err(error) => {
                if matches!(error, UploadError::Auth(_)) {
                    self.session_ready = false;
                    if let Err(e) = self.session.clear() {
                        tracing::warn!(error = %e, "could not clear session file");
                    }
                }

                let terminal = matches!(error, UploadError::Terminal(_));
                let record = self.scheduler.record_failure(
                    now,
                    &mut self.state,
                    dispatch,
                    &error.to_string(),
                    terminal,
                );
                if let Some(record) = record {
                    tracing::error!(
                        filename = %dispatch.item.filename,
                        attempts = record.attempts,
                        error = %error,
                        "upload failed terminally"
                    );
                    self.store.append_history(&record)?;
                    self.history.push(record);
                } else {
                    tracing::warn!(
                        filename = %dispatch.item.filename,
                        error = %error,
                        backoff_level = self.state.pacing.backoff_level,
                        next_allowed_at = self.state.pacing.next_allowed_at,
                        "upload failed; will retry"
                    );
                }
                self.store.commit(&mut self.state)?;
            }
        }

        self.publish_snapshot();
        Ok(())
    }

    /// Make sure the adapter holds a live session: resume the persisted one
    /// if still valid, otherwise log in fresh (gated by the auth cooldown).
    async fn ensure_session(&mut self, now: i64) -> std::result::Result<(), UploadError> {
        if self.session_ready {
            return Ok(());
        }

        if let Some(record) = self.session.load_valid(now, &self.credentials.username) {
            match self.uploader.resume(&record.token).await {
                Ok(()) => {
                    tracing::debug!("resumed persisted session");
                    self.session_ready = true;
                    return Ok(());
                }
                Err(UploadError::Auth(reason)) => {
                    tracing::info!(%reason, "persisted session rejected; logging in fresh");
                    if let Err(e) = self.session.clear() {
                        tracing::warn!(error = %e, "could not clear session file");
                    }
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(SessionError::CoolingDown { until }) = self.session.check_cooldown(now) {
            return Err(UploadError::Transient(format!(
                "authentication cooling down until {}",
                until
            )));
        }

        match self.uploader.authenticate(&self.credentials).await {
            Ok(token) => {
                self.session.record_auth_success();
                let record = SessionRecord {
                    username: self.credentials.username.clone(),
                    token,
                    established_at: now,
                };
                if let Err(e) = self.session.store(&record) {
                    tracing::warn!(error = %e, "session established but not persisted");
                }
                self.session_ready = true;
                Ok(())
            }
            Err(UploadError::Auth(reason)) => {
                self.session.record_auth_failure(now);
                Err(UploadError::Auth(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Move an uploaded file out of the library so rescans never see it
    /// again even if history were lost.
    fn move_to_uploaded(&self, item: &MediaItem) -> std::io::Result<PathBuf> {
        let dir = self.config.uploaded_dir();
        std::fs::create_dir_all(&dir)?;

        let mut dest = dir.join(&item.filename);
        if dest.exists() {
            // Same filename uploaded before; disambiguate with the id prefix
            let prefix: String = item.id.chars().take(12).collect();
            dest = dir.join(format!("{}-{}", prefix, item.filename));
        }

        match std::fs::rename(&item.path, &dest) {
            Ok(()) => Ok(dest),
            Err(_) => {
                // Cross-device move: copy then delete
                std::fs::copy(&item.path, &dest)?;
                std::fs::remove_file(&item.path)?;
                Ok(dest)
            }
        }
    }

    fn publish_snapshot(&self) {
        let tail_start = self
            .history
            .len()
            .saturating_sub(self.config.worker.history_tail);
        let snapshot = Snapshot {
            revision: self.state.revision,
            backlog: self.state.backlog.iter().cloned().collect(),
            scheduled: self.state.scheduled.clone(),
            pacing: self.state.pacing.clone(),
            recent_history: self.history[tail_start..].to_vec(),
            paused: self.paused,
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

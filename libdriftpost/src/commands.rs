//! Control commands for the running worker
//!
//! Producers (CLI handlers, signal handlers) push commands into a bounded
//! inbox without ever blocking; the worker drains it between upload
//! attempts. When the inbox is full the oldest command is dropped, on the
//! grounds that a stale control request is worth less than a fresh one.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scan the media directory for new items now.
    Rescan,
    /// Stop dispatching uploads; discovery and commands keep running.
    Pause,
    Resume,
    /// Pin a file to a wall-clock publication time.
    ScheduleAt {
        path: PathBuf,
        target_at: i64,
        one_shot: bool,
    },
    /// Remove a schedule entry; its item returns to the backlog.
    CancelSchedule { entry_id: String },
    /// Copy the history file to a destination path.
    ExportHistory { dest: PathBuf },
    Shutdown,
}

pub struct CommandInbox {
    queue: Mutex<VecDeque<Command>>,
    notify: Notify,
    capacity: usize,
}

impl CommandInbox {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
        })
    }

    /// Push a command without blocking. Returns false when the inbox was
    /// full and the oldest command was dropped to make room.
    pub fn push(&self, command: Command) -> bool {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let mut fit = true;
        if queue.len() >= self.capacity {
            let dropped = queue.pop_front();
            tracing::warn!(?dropped, "command inbox full; dropping oldest");
            fit = false;
        }
        queue.push_back(command);
        drop(queue);

        self.notify.notify_one();
        fit
    }

    /// Take everything currently queued, in arrival order.
    pub fn drain(&self) -> Vec<Command> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.drain(..).collect()
    }

    /// Wait until at least one command has been pushed since the last
    /// drain. Used by the worker alongside its poll timer.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

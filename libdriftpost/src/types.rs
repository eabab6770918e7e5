//! Core types for Driftpost

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle of a media item while it is queued or scheduled.
///
/// An item lives in exactly one of the backlog or the schedule table;
/// terminal outcomes (uploaded, failed for good) are not statuses but
/// [`HistoryRecord`]s — the item leaves its table in the same commit that
/// appends the record. `Uploading` marks the single in-flight item; it
/// keeps its slot in its owning table until the attempt resolves.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediaStatus {
    Pending,
    Scheduled,
    Uploading,
}

impl std::fmt::Display for MediaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Uploading => write!(f, "uploading"),
        }
    }
}

/// A discovered media file awaiting publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    /// Hex SHA-256 of the file content. Stable across rename, which keeps
    /// deduplication working when uploaded files are moved out of the
    /// library directory and later rediscovered.
    pub id: String,
    pub path: PathBuf,
    pub filename: String,
    pub discovered_at: i64,
    pub status: MediaStatus,
    /// Number of upload attempts started for this item.
    pub attempts: u32,
}

impl MediaItem {
    pub fn new(id: String, path: PathBuf) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            id,
            path,
            filename,
            discovered_at: chrono::Utc::now().timestamp(),
            status: MediaStatus::Pending,
            attempts: 0,
        }
    }
}

/// A media item pinned to a wall-clock publication time.
///
/// The target timestamp is immutable once an upload attempt has started,
/// and at most one entry references a given item id at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub item: MediaItem,
    pub target_at: i64,
    pub one_shot: bool,
}

impl ScheduleEntry {
    pub fn new(item: MediaItem, target_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item,
            target_at,
            one_shot: true,
        }
    }
}

/// Outcome recorded in the append-only history file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Success { remote_id: String },
    Failure { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success { .. })
    }
}

/// One line of the history file. Append-only, never mutated after write;
/// doubles as the deduplication source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub item_id: String,
    pub filename: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub recorded_at: i64,
    pub attempts: u32,
}

/// Pacing singleton, persisted with every state commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PacingState {
    pub last_success_at: Option<i64>,
    /// Consecutive-failure level feeding the exponential backoff. Capped.
    pub backoff_level: u32,
    /// Earliest wall-clock second at which the next dispatch is allowed.
    /// Non-decreasing except when a success recomputes the window.
    pub next_allowed_at: i64,
}

impl Default for PacingState {
    fn default() -> Self {
        Self {
            last_success_at: None,
            backoff_level: 0,
            next_allowed_at: 0,
        }
    }
}

/// The complete durable state: backlog queue, schedule table, pacing record
/// and the monotonic revision counter bumped on every commit.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct State {
    pub revision: u64,
    pub backlog: VecDeque<MediaItem>,
    pub scheduled: Vec<ScheduleEntry>,
    pub pacing: PacingState,
}

impl State {
    /// True if any table already holds an item with this content id.
    pub fn contains_item(&self, item_id: &str) -> bool {
        self.backlog.iter().any(|i| i.id == item_id)
            || self.scheduled.iter().any(|e| e.item.id == item_id)
    }
}

/// Read-only point-in-time copy handed to observers (the dashboard).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub revision: u64,
    pub backlog: Vec<MediaItem>,
    pub scheduled: Vec<ScheduleEntry>,
    pub pacing: PacingState,
    pub recent_history: Vec<HistoryRecord>,
    pub paused: bool,
}

/// Image formats accepted by the content scanner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
    WebP,
}

impl ImageKind {
    /// Detect the image kind from a file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
        }
    }
}

impl std::fmt::Display for ImageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Crash-safe persistence for the posting state
//!
//! Two files live in the state directory:
//!
//! - `state.json` — backlog, schedule table, pacing record and revision
//!   counter, replaced atomically (write-to-temp-then-rename) on every
//!   commit;
//! - `history.jsonl` — append-only outcome log, one JSON object per line,
//!   never rewritten.
//!
//! A crash mid-commit leaves either the old state or the new state on disk,
//! never a mix. A crash mid-append can leave one torn trailing line, which
//! `load_history` drops; the matching item is still marked `Uploading` in
//! the state file and is recovered as retryable.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Result, StateError};
use crate::types::{HistoryRecord, State};

const STATE_FILE: &str = "state.json";
const HISTORY_FILE: &str = "history.jsonl";

pub struct StateStore {
    state_path: PathBuf,
    history_path: PathBuf,
}

impl StateStore {
    /// Open (and create if needed) the state directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(StateError::Io)?;
        Ok(Self {
            state_path: dir.join(STATE_FILE),
            history_path: dir.join(HISTORY_FILE),
        })
    }

    /// Load the persisted state. A missing file yields a fresh default
    /// state; an unparseable file is `StateError::Corrupt` and must halt
    /// startup rather than silently discard queue progress.
    pub fn load(&self) -> Result<State> {
        if !self.state_path.exists() {
            return Ok(State::default());
        }

        let content = std::fs::read_to_string(&self.state_path).map_err(StateError::Io)?;
        let state: State = serde_json::from_str(&content).map_err(|e| StateError::Corrupt {
            path: self.state_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(state)
    }

    /// Atomically persist the state, bumping the revision counter.
    ///
    /// The new state is written to a temp file, fsynced, then renamed over
    /// the previous one, so readers never observe a half-written file.
    pub fn commit(&self, state: &mut State) -> Result<()> {
        state.revision += 1;

        let tmp_path = self.state_path.with_extension("json.tmp");
        let json =
            serde_json::to_string_pretty(state).map_err(|e| StateError::Corrupt {
                path: tmp_path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mut file = File::create(&tmp_path).map_err(StateError::Io)?;
        file.write_all(json.as_bytes()).map_err(StateError::Io)?;
        file.sync_all().map_err(StateError::Io)?;
        drop(file);

        std::fs::rename(&tmp_path, &self.state_path).map_err(StateError::Io)?;

        tracing::debug!(revision = state.revision, "state committed");
        Ok(())
    }

    /// Append one record to the history file without rewriting it.
    pub fn append_history(&self, record: &HistoryRecord) -> Result<()> {
        let line = serde_json::to_string(record).map_err(|e| StateError::Corrupt {
            path: self.history_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.history_path)
            .map_err(StateError::Io)?;
        file.write_all(line.as_bytes()).map_err(StateError::Io)?;
        file.write_all(b"\n").map_err(StateError::Io)?;
        file.sync_all().map_err(StateError::Io)?;

        Ok(())
    }

    /// Load the full history. Tolerates exactly one torn trailing line
    /// without a newline terminator (a crash mid-append); anything else
    /// unparseable is corruption.
    pub fn load_history(&self) -> Result<Vec<HistoryRecord>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(&self.history_path).map_err(StateError::Io)?;
        let mut records = Vec::new();
        let terminated = content.ends_with('\n');
        let lines: Vec<&str> = content.lines().collect();

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    let is_torn_tail = idx == lines.len() - 1 && !terminated;
                    if is_torn_tail {
                        tracing::warn!(
                            path = %self.history_path.display(),
                            "dropping torn trailing history line (interrupted append)"
                        );
                        continue;
                    }
                    return Err(StateError::Corrupt {
                        path: self.history_path.display().to_string(),
                        reason: format!("line {}: {}", idx + 1, e),
                    }
                    .into());
                }
            }
        }

        Ok(records)
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }
}

/// Item ids with a terminal history record. An id in this set must never be
/// enqueued again.
pub fn terminal_ids(records: &[HistoryRecord]) -> HashSet<String> {
    records.iter().map(|r| r.item_id.clone()).collect()
}

/// Item ids with a Success record, used when recovering items left in
/// `Uploading` status: a Success that landed before the crash means the
/// attempt completed and the item must not be retried.
pub fn successful_ids(records: &[HistoryRecord]) -> HashSet<String> {
    records
        .iter()
        .filter(|r| r.outcome.is_success())
        .map(|r| r.item_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaItem, Outcome};
    use tempfile::TempDir;

    fn record(item_id: &str, success: bool) -> HistoryRecord {
        HistoryRecord {
            item_id: item_id.to_string(),
            filename: format!("{}.png", item_id),
            outcome: if success {
                Outcome::Success {
                    remote_id: "remote-1".to_string(),
                }
            } else {
                Outcome::Failure {
                    reason: "rejected".to_string(),
                }
            },
            recorded_at: 1_700_000_000,
            attempts: 1,
        }
    }

    #[test]
    fn test_load_fresh_state() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.revision, 0);
        assert!(state.backlog.is_empty());
        assert!(state.scheduled.is_empty());
    }

    #[test]
    fn test_commit_and_reload() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut state = State::default();
        state
            .backlog
            .push_back(MediaItem::new("a".to_string(), dir.path().join("a.png")));
        store.commit(&mut state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.backlog.len(), 1);
        assert_eq!(loaded.backlog[0].id, "a");
    }

    #[test]
    fn test_revision_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut state = State::default();
        for expected in 1..=5 {
            store.commit(&mut state).unwrap();
            assert_eq!(state.revision, expected);
        }
        assert_eq!(store.load().unwrap().revision, 5);
    }

    #[test]
    fn test_corrupt_state_is_loud() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        std::fs::write(store.state_path(), "{ not json").unwrap();

        let result = store.load();
        assert!(matches!(
            result,
            Err(crate::DriftError::State(StateError::Corrupt { .. }))
        ));
    }

    #[test]
    fn test_interrupted_commit_leaves_previous_state() {
        // Simulate a crash after the temp file was written but before the
        // rename: the store must still load the last committed state.
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        let mut state = State::default();
        state
            .backlog
            .push_back(MediaItem::new("a".to_string(), dir.path().join("a.png")));
        store.commit(&mut state).unwrap();

        let tmp = store.state_path().with_extension("json.tmp");
        std::fs::write(&tmp, "garbage from a half-finished write").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.revision, 1);
        assert_eq!(loaded.backlog.len(), 1);
    }

    #[test]
    fn test_history_append_and_load() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        store.append_history(&record("a", true)).unwrap();
        store.append_history(&record("b", false)).unwrap();

        let history = store.load_history().unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].outcome.is_success());
        assert!(!history[1].outcome.is_success());
    }

    #[test]
    fn test_history_append_does_not_rewrite() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        store.append_history(&record("a", true)).unwrap();
        let first = std::fs::read_to_string(store.history_path()).unwrap();
        store.append_history(&record("b", true)).unwrap();
        let second = std::fs::read_to_string(store.history_path()).unwrap();

        assert!(second.starts_with(&first));
    }

    #[test]
    fn test_torn_trailing_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        store.append_history(&record("a", true)).unwrap();
        // Crash mid-append: partial JSON, no trailing newline
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.history_path())
            .unwrap();
        file.write_all(b"{\"item_id\":\"b\",\"file").unwrap();
        drop(file);

        let history = store.load_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].item_id, "a");
    }

    #[test]
    fn test_corrupt_middle_line_is_loud() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();

        store.append_history(&record("a", true)).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(store.history_path())
            .unwrap();
        file.write_all(b"not json at all\n").unwrap();
        drop(file);
        store.append_history(&record("c", true)).unwrap();

        let result = store.load_history();
        assert!(matches!(
            result,
            Err(crate::DriftError::State(StateError::Corrupt { .. }))
        ));
    }

    #[test]
    fn test_terminal_and_successful_ids() {
        let records = vec![record("a", true), record("b", false)];

        let terminal = terminal_ids(&records);
        assert!(terminal.contains("a"));
        assert!(terminal.contains("b"));

        let successes = successful_ids(&records);
        assert!(successes.contains("a"));
        assert!(!successes.contains("b"));
    }

    #[test]
    fn test_missing_history_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        assert!(store.load_history().unwrap().is_empty());
    }
}

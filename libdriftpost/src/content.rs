//! Content source: discovers eligible media files
//!
//! A scan is a pure read of the filesystem plus the history index: it lists
//! candidate files, filters by image extension, derives each file's content
//! hash and excludes anything already uploaded (terminal history record) or
//! already tracked in the backlog or schedule table. Calling scan twice
//! without filesystem changes yields the same set, in the same order.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;

use crate::error::Result;
use crate::types::{ImageKind, MediaItem, State};

/// Scan the media directory for new items.
///
/// `excluded` is the set of item ids with a terminal history record; items
/// already present in `state` are also skipped. Results are sorted by
/// filename so insertion order is deterministic.
pub fn scan(dir: &Path, excluded: &HashSet<String>, state: &State) -> Result<Vec<MediaItem>> {
    let mut candidates = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let kind = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(ImageKind::from_extension);
        if kind.is_none() {
            continue;
        }
        candidates.push(path);
    }

    candidates.sort();

    let mut items = Vec::new();
    for path in candidates {
        let id = match content_id(&path) {
            Ok(id) => id,
            Err(e) => {
                // File vanished or became unreadable between listing and
                // hashing; it will be picked up by a later scan if it comes
                // back.
                tracing::warn!(path = %path.display(), error = %e, "skipping unreadable file");
                continue;
            }
        };

        if excluded.contains(&id) {
            tracing::debug!(path = %path.display(), id, "skipping: terminal history record");
            continue;
        }
        if state.contains_item(&id) {
            continue;
        }
        if items.iter().any(|i: &MediaItem| i.id == id) {
            // Two copies of the same content in the directory
            continue;
        }

        items.push(MediaItem::new(id, path));
    }

    Ok(items)
}

/// Stable content identifier: hex SHA-256 of the file bytes.
pub fn content_id(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScheduleEntry;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_scan_filters_by_extension() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.png", b"aaa");
        touch(&dir, "b.jpg", b"bbb");
        touch(&dir, "notes.txt", b"not an image");
        touch(&dir, "noext", b"nothing");

        let items = scan(dir.path(), &HashSet::new(), &State::default()).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].filename, "a.png");
        assert_eq!(items[1].filename, "b.jpg");
    }

    #[test]
    fn test_scan_is_idempotent() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.png", b"aaa");
        touch(&dir, "b.png", b"bbb");

        let first = scan(dir.path(), &HashSet::new(), &State::default()).unwrap();
        let second = scan(dir.path(), &HashSet::new(), &State::default()).unwrap();

        let ids1: Vec<_> = first.iter().map(|i| i.id.clone()).collect();
        let ids2: Vec<_> = second.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn test_scan_excludes_history_terminal_items() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "a.png", b"aaa");
        touch(&dir, "b.png", b"bbb");

        let uploaded_id = content_id(&path).unwrap();
        let excluded: HashSet<String> = [uploaded_id].into_iter().collect();

        let items = scan(dir.path(), &excluded, &State::default()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].filename, "b.png");
    }

    #[test]
    fn test_scan_excludes_items_already_tracked() {
        let dir = TempDir::new().unwrap();
        let a = touch(&dir, "a.png", b"aaa");
        let b = touch(&dir, "b.png", b"bbb");
        touch(&dir, "c.png", b"ccc");

        let mut state = State::default();
        let item_a = MediaItem::new(content_id(&a).unwrap(), a);
        state.backlog.push_back(item_a);
        let item_b = MediaItem::new(content_id(&b).unwrap(), b);
        state.scheduled.push(ScheduleEntry::new(item_b, 1000));

        let items = scan(dir.path(), &HashSet::new(), &state).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].filename, "c.png");
    }

    #[test]
    fn test_dedup_by_content_not_name() {
        // The same image under a different filename must not be enqueued
        // twice.
        let dir = TempDir::new().unwrap();
        touch(&dir, "a.png", b"same-bytes");
        touch(&dir, "copy-of-a.png", b"same-bytes");

        let items = scan(dir.path(), &HashSet::new(), &State::default()).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_content_id_is_stable_across_rename() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "a.png", b"pixels");
        let id_before = content_id(&path).unwrap();

        let renamed = dir.path().join("uploaded.png");
        std::fs::rename(&path, &renamed).unwrap();
        let id_after = content_id(&renamed).unwrap();

        assert_eq!(id_before, id_after);
    }

    #[test]
    fn test_scan_missing_directory_errors() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(scan(&missing, &HashSet::new(), &State::default()).is_err());
    }
}

//! Per-root registration state.
//!
//! Maps registered directories to their native keys, turns raw entry events
//! into [`Change`]s, backfills newly created subtrees and releases handles
//! when directories disappear. Callers hold the tree behind a mutex and
//! dispatch the returned changes after releasing it.
//!
//! A removed directory is reported once, as the highest registered directory
//! that is gone from disk. Events from inside it are folded into that one
//! delete and suppressed afterwards by a tombstone until the path is created
//! again. Removal of the base directory itself is not reported.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backend::{WatchBackend, WatchKey};
use super::events::{Change, RawEvent, RawEventKind};
use super::scanner::{self, ErrorPolicy};
use crate::Result;

/// Upper bound on remembered removed directories.
const MAX_TOMBSTONES: usize = 1024;

pub(crate) struct WatchTree {
    base: PathBuf,
    backend: Arc<dyn WatchBackend>,
    handles: HashMap<PathBuf, WatchKey>,
    paths: HashMap<WatchKey, PathBuf>,
    tombstones: HashSet<PathBuf>,
}

impl WatchTree {
    pub fn new(base: PathBuf, backend: Arc<dyn WatchBackend>) -> Self {
        Self {
            base,
            backend,
            handles: HashMap::new(),
            paths: HashMap::new(),
            tombstones: HashSet::new(),
        }
    }

    /// Register every directory under the base path.
    ///
    /// Subtrees that cannot be registered are skipped with a warning.
    /// Returns the number of directories registered.
    pub fn initialize(&mut self) -> usize {
        let base = self.base.clone();
        let mut walker = scanner::walk(&base, ErrorPolicy::SkipSubtree);
        let mut registered = 0;

        while let Some(entry) = walker.next() {
            if !entry.is_dir {
                continue;
            }

            match self.register(&entry.path) {
                Ok(_) => registered += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path.display(), error = %e, "Skipping unwatchable subtree");
                    walker.skip_subtree();
                }
            }
        }

        let stats = walker.stats();
        tracing::debug!(
            base = %base.display(),
            directories = stats.directories,
            files = stats.files,
            errors = stats.errors,
            registered,
            "Initial registration complete"
        );
        registered
    }

    /// Register `dir`, returning the existing key if it is already watched.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend refuses the registration.
    pub fn register(&mut self, dir: &Path) -> Result<WatchKey> {
        if let Some(&key) = self.handles.get(dir) {
            return Ok(key);
        }

        let key = self.backend.register(dir)?;
        self.handles.insert(dir.to_path_buf(), key);
        self.paths.insert(key, dir.to_path_buf());
        Ok(key)
    }

    #[must_use]
    pub fn is_registered(&self, dir: &Path) -> bool {
        self.handles.contains_key(dir)
    }

    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Apply one entry event reported on `key`.
    ///
    /// Keys this tree never registered are ignored.
    pub fn handle_event(&mut self, key: WatchKey, event: &RawEvent) -> Vec<Change> {
        let Some(dir) = self.paths.get(&key).cloned() else {
            return Vec::new();
        };
        let path = dir.join(&event.name);

        match event.kind {
            RawEventKind::Create => self.handle_created(path),
            RawEventKind::Modify => {
                if self.handles.contains_key(&path) || is_directory(&path) {
                    Vec::new()
                } else {
                    vec![Change::modified(path)]
                }
            }
            RawEventKind::Delete => {
                if self.is_tombstoned(&path) {
                    tracing::trace!(path = %path.display(), "Delete already reported");
                    Vec::new()
                } else if dir != self.base && !is_directory(&dir) {
                    let top = self.vanished_root(&dir);
                    self.release_subtree(&top)
                } else if self.handles.contains_key(&path) {
                    self.release_subtree(&path)
                } else {
                    vec![Change::deleted(path)]
                }
            }
        }
    }

    /// Handle `key` becoming invalid.
    ///
    /// Stale keys, including those already released with an ancestor, are
    /// a no-op. Losing the base directory releases every handle silently.
    pub fn handle_invalidated(&mut self, key: WatchKey) -> Vec<Change> {
        let Some(dir) = self.paths.get(&key).cloned() else {
            return Vec::new();
        };

        if dir == self.base {
            let released = self.close();
            tracing::warn!(base = %dir.display(), released, "Watch root removed");
            return Vec::new();
        }

        let top = self.vanished_root(&dir);
        self.release_subtree(&top)
    }

    /// Cancel every handle. Returns the number released.
    pub fn close(&mut self) -> usize {
        let released = self.handles.len();
        for (_, key) in self.handles.drain() {
            self.backend.cancel(key);
        }
        self.paths.clear();
        self.tombstones.clear();
        released
    }

    fn handle_created(&mut self, path: PathBuf) -> Vec<Change> {
        self.tombstones.retain(|t| !t.starts_with(&path));

        if self.handles.contains_key(&path) {
            tracing::trace!(path = %path.display(), "Directory already reached by backfill");
            return Vec::new();
        }

        if is_directory(&path) {
            self.backfill(&path)
        } else {
            vec![Change::created(path)]
        }
    }

    /// Register and report a newly created subtree.
    fn backfill(&mut self, dir: &Path) -> Vec<Change> {
        let mut walker = scanner::walk(dir, ErrorPolicy::StopOnVanished);
        let mut changes = Vec::new();

        while let Some(entry) = walker.next() {
            if !entry.is_dir {
                changes.push(Change::created(entry.path));
                continue;
            }

            if self.handles.contains_key(&entry.path) {
                walker.skip_subtree();
                continue;
            }

            if let Err(e) = self.register(&entry.path) {
                tracing::warn!(path = %entry.path.display(), error = %e, "Failed to register new directory");
                walker.skip_subtree();
            }
            changes.push(Change::created(entry.path));
        }

        tracing::debug!(path = %dir.display(), reported = changes.len(), "Backfilled new directory");
        changes
    }

    /// Whether `path` lies in a directory already reported as removed.
    fn is_tombstoned(&self, path: &Path) -> bool {
        path.ancestors()
            .take_while(|a| *a != self.base)
            .any(|a| self.tombstones.contains(a))
    }

    /// Highest registered directory at or above `dir` that is gone from disk.
    ///
    /// Falls back to `dir` when nothing above it has vanished. The base
    /// directory is never returned.
    fn vanished_root(&self, dir: &Path) -> PathBuf {
        let mut top = dir.to_path_buf();
        for ancestor in dir.ancestors() {
            if ancestor == self.base || !ancestor.starts_with(&self.base) || is_directory(ancestor)
            {
                break;
            }
            if self.handles.contains_key(ancestor) {
                top = ancestor.to_path_buf();
            }
        }
        top
    }

    /// Release `dir` and every registered descendant, reporting one delete.
    fn release_subtree(&mut self, dir: &Path) -> Vec<Change> {
        let released: Vec<PathBuf> = self
            .handles
            .keys()
            .filter(|p| p.starts_with(dir))
            .cloned()
            .collect();

        for path in &released {
            if let Some(key) = self.handles.remove(path) {
                self.paths.remove(&key);
                self.backend.cancel(key);
            }
        }

        if self.tombstones.len() >= MAX_TOMBSTONES {
            self.tombstones.clear();
        }
        self.tombstones.retain(|t| !t.starts_with(dir));
        self.tombstones.insert(dir.to_path_buf());

        tracing::debug!(path = %dir.display(), handles = released.len(), "Directory removed");
        vec![Change::deleted(dir)]
    }
}

fn is_directory(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|m| m.is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::backend::testing::ManualBackend;
    use crate::watcher::events::NotificationKind;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("empty1/empty2")).unwrap();
        fs::create_dir_all(root.join("level1/level2")).unwrap();
        fs::write(root.join("file"), "").unwrap();
        fs::write(root.join("level1/file"), "").unwrap();
        fs::write(root.join("level1/level2/file"), "").unwrap();
        tmp
    }

    fn tree_for(root: &Path, backend: &Arc<ManualBackend>) -> WatchTree {
        let backend: Arc<dyn WatchBackend> = backend.clone();
        let mut tree = WatchTree::new(root.to_path_buf(), backend);
        tree.initialize();
        tree
    }

    fn pump(tree: &mut WatchTree, backend: &ManualBackend) -> Vec<(NotificationKind, PathBuf)> {
        let mut changes = Vec::new();
        while let Some(key) = backend.poll() {
            for event in backend.poll_events(key) {
                changes.extend(tree.handle_event(key, &event));
            }
            if !backend.reset(key) {
                changes.extend(tree.handle_invalidated(key));
            }
        }
        changes.into_iter().map(|c| (c.kind, c.path)).collect()
    }

    #[test]
    fn test_initialize_registers_every_directory() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let tree = tree_for(tmp.path(), &backend);

        assert_eq!(tree.handle_count(), 5);
        assert!(tree.is_registered(tmp.path()));
        assert!(tree.is_registered(&tmp.path().join("level1/level2")));
        assert!(!tree.is_registered(&tmp.path().join("file")));
    }

    #[test]
    fn test_register_is_idempotent() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let before = backend.registrations();

        let first = tree.register(&tmp.path().join("level1")).unwrap();
        let second = tree.register(&tmp.path().join("level1")).unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.registrations(), before);
    }

    #[test]
    fn test_unregistrable_subtree_skipped() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        backend.refuse(&tmp.path().join("level1"));
        let tree = tree_for(tmp.path(), &backend);

        assert!(!tree.is_registered(&tmp.path().join("level1")));
        assert!(!tree.is_registered(&tmp.path().join("level1/level2")));
        assert!(tree.is_registered(&tmp.path().join("empty1/empty2")));
    }

    #[test]
    fn test_nested_directory_creation_reported_once() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        let outer = tmp.path().join("newdir1");
        let inner = outer.join("newdir2");
        fs::create_dir_all(&inner).unwrap();
        backend.created(&outer);
        let first = pump(&mut tree, &backend);

        // The native layer reports the inner directory once its parent is
        // watched, after the backfill already reached it.
        backend.created(&inner);
        let second = pump(&mut tree, &backend);

        assert_eq!(
            first,
            vec![
                (NotificationKind::Created, outer.clone()),
                (NotificationKind::Created, inner.clone()),
            ]
        );
        assert!(second.is_empty());
        assert!(tree.is_registered(&inner));
    }

    #[test]
    fn test_backfill_reports_files() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        let dir = tmp.path().join("fresh");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.txt"), "a").unwrap();
        backend.created(&dir);

        assert_eq!(
            pump(&mut tree, &backend),
            vec![
                (NotificationKind::Created, dir.clone()),
                (NotificationKind::Created, dir.join("a.txt")),
            ]
        );
    }

    #[test]
    fn test_backfill_of_vanished_directory_reports_nothing() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        let dir = tmp.path().join("transient");
        fs::create_dir(&dir).unwrap();
        let key = tree.register(tmp.path()).unwrap();
        fs::remove_dir(&dir).unwrap();

        // Raced: the entry is gone and looks like a plain file create.
        let changes = tree.handle_event(key, &RawEvent::new(RawEventKind::Create, "transient"));
        assert_eq!(changes, vec![Change::created(&dir)]);
        assert!(tree.backfill(&dir).is_empty());
        assert!(!tree.is_registered(&dir));
    }

    #[test]
    fn test_file_modify_and_delete() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        backend.modified(&tmp.path().join("file"));
        backend.removed(&tmp.path().join("level1/level2/file"));

        let mut changes = pump(&mut tree, &backend);
        changes.sort();
        assert_eq!(
            changes,
            vec![
                (NotificationKind::Modified, tmp.path().join("file")),
                (NotificationKind::Deleted, tmp.path().join("level1/level2/file")),
            ]
        );
    }

    #[test]
    fn test_directory_modify_ignored() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        backend.modified(&tmp.path().join("level1"));
        assert!(pump(&mut tree, &backend).is_empty());
    }

    #[test]
    fn test_directory_removal_reported_once() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let empty2 = tmp.path().join("empty1/empty2");

        // Key invalidation first, then the parent's entry delete.
        backend.removed(&empty2);
        let first = pump(&mut tree, &backend);
        backend.removed(&empty2);
        let second = pump(&mut tree, &backend);

        assert_eq!(first, vec![(NotificationKind::Deleted, empty2.clone())]);
        assert!(second.is_empty());
        assert!(!tree.is_registered(&empty2));
    }

    #[test]
    fn test_entry_delete_before_invalidation() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let empty1 = tmp.path().join("empty1");
        let empty2 = empty1.join("empty2");
        let parent = tree.register(&empty1).unwrap();
        let child = tree.register(&empty2).unwrap();

        backend
            .queue
            .signal(parent, RawEvent::new(RawEventKind::Delete, "empty2"));
        let first = pump(&mut tree, &backend);

        assert_eq!(first, vec![(NotificationKind::Deleted, empty2.clone())]);
        assert!(tree.handle_invalidated(child).is_empty());
    }

    #[test]
    fn test_subtree_released_with_ancestor() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let level1 = tmp.path().join("level1");
        let level2_key = tree.register(&level1.join("level2")).unwrap();

        backend.removed(&level1);
        let changes = pump(&mut tree, &backend);

        assert_eq!(changes, vec![(NotificationKind::Deleted, level1.clone())]);
        assert!(!tree.is_registered(&level1.join("level2")));
        assert!(tree.handle_invalidated(level2_key).is_empty());
        assert_eq!(tree.handle_count(), 3);
    }

    #[test]
    fn test_removed_tree_reported_as_one_delete() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let level1 = tmp.path().join("level1");
        let level2 = level1.join("level2");
        fs::remove_dir_all(&level1).unwrap();

        // Bottom-up removal as the native layer reports it.
        backend.removed(&level2.join("file"));
        backend.removed(&level2);
        backend.removed(&level2);
        backend.removed(&level1.join("file"));
        backend.removed(&level1);
        backend.removed(&level1);

        assert_eq!(
            pump(&mut tree, &backend),
            vec![(NotificationKind::Deleted, level1.clone())]
        );
        assert!(!tree.is_registered(&level2));
        assert_eq!(tree.handle_count(), 3);
    }

    #[test]
    fn test_invalidation_folds_into_removed_ancestor() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let empty1 = tmp.path().join("empty1");
        fs::remove_dir_all(&empty1).unwrap();

        backend.removed(&empty1.join("empty2"));
        let first = pump(&mut tree, &backend);
        backend.removed(&empty1);
        backend.removed(&empty1);
        let second = pump(&mut tree, &backend);

        assert_eq!(first, vec![(NotificationKind::Deleted, empty1.clone())]);
        assert!(second.is_empty());
        assert!(!tree.is_registered(&empty1));
    }

    #[test]
    fn test_base_removal_not_reported() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        backend.removed(tmp.path());

        assert!(pump(&mut tree, &backend).is_empty());
        assert_eq!(tree.handle_count(), 0);
    }

    #[test]
    fn test_recreated_directory_watched_again() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);
        let empty2 = tmp.path().join("empty1/empty2");

        backend.removed(&empty2);
        pump(&mut tree, &backend);

        backend.created(&empty2);
        assert_eq!(
            pump(&mut tree, &backend),
            vec![(NotificationKind::Created, empty2.clone())]
        );
        assert!(tree.is_registered(&empty2));
    }

    #[test]
    fn test_unknown_key_ignored() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut other = WatchTree::new(tmp.path().join("level1"), backend.clone());
        let key = other.register(&tmp.path().join("level1")).unwrap();

        let mut tree = WatchTree::new(tmp.path().join("empty1"), backend.clone());
        tree.initialize();

        let event = RawEvent::new(RawEventKind::Create, "file");
        assert!(tree.handle_event(key, &event).is_empty());
        assert!(tree.handle_invalidated(key).is_empty());
    }

    #[test]
    fn test_close_releases_handles() {
        let tmp = fixture();
        let backend = ManualBackend::new();
        let mut tree = tree_for(tmp.path(), &backend);

        assert_eq!(tree.close(), 5);
        assert_eq!(tree.handle_count(), 0);
        assert_eq!(backend.queue.key_for(tmp.path()), None);
    }
}

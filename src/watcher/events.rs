//! File system event types: raw native entry events and the semantic
//! notifications delivered to subscribers.

#![allow(clippy::missing_const_for_fn)]

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Kind of change reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NotificationKind {
    /// Entry was created (or reached by a backfill walk).
    Created,
    /// File contents or metadata changed.
    Modified,
    /// Entry was deleted or moved out of the tree.
    Deleted,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Modified => f.write_str("modified"),
            Self::Deleted => f.write_str("deleted"),
        }
    }
}

/// A change delivered to subscribers.
///
/// `path` is always relative to the watch root's base path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    kind: NotificationKind,
    root: Arc<Path>,
    path: PathBuf,
}

impl Notification {
    /// Create a notification for `path` relative to `root`.
    #[must_use]
    pub fn new(kind: NotificationKind, root: Arc<Path>, path: PathBuf) -> Self {
        Self { kind, root, path }
    }

    /// Kind of change.
    #[must_use]
    pub fn kind(&self) -> NotificationKind {
        self.kind
    }

    /// Base path of the watch root that produced this notification.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to the watch root.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path of the changed entry.
    #[must_use]
    pub fn absolute_path(&self) -> PathBuf {
        self.root.join(&self.path)
    }
}

/// Kind of a raw entry event reported by the native layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
    /// An entry appeared in the watched directory.
    Create,
    /// An entry in the watched directory changed.
    Modify,
    /// An entry disappeared from the watched directory.
    Delete,
}

/// A raw event for one entry of a watched directory.
///
/// `name` is relative to the directory the event's key was registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    /// What happened.
    pub kind: RawEventKind,
    /// Entry name inside the watched directory.
    pub name: OsString,
}

impl RawEvent {
    /// Create a raw event.
    pub fn new(kind: RawEventKind, name: impl Into<OsString>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

/// Semantic notification before it is made relative to a watch root.
///
/// Produced by the watch tree and handed to the dispatcher once the tree
/// lock has been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Change {
    pub kind: NotificationKind,
    pub path: PathBuf,
}

impl Change {
    pub fn created(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: NotificationKind::Created,
            path: path.into(),
        }
    }

    pub fn modified(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: NotificationKind::Modified,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: NotificationKind::Deleted,
            path: path.into(),
        }
    }
}

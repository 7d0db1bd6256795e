//! Directory walker used for the initial registration pass and for
//! backfilling newly created subtrees.
//!
//! Yields `(path, is_dir)` entries lazily, depth-first, with every directory
//! reported before its contents. Symlinks are reported but never followed.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// What to do when part of the tree cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Skip the unreadable subtree and continue with its siblings.
    SkipSubtree,
    /// Stop the walk silently once an entry has vanished; other
    /// failures skip the subtree.
    StopOnVanished,
}

/// One entry produced by a walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Absolute path of the entry.
    pub path: PathBuf,
    /// Whether the entry is a directory (symlinks are not).
    pub is_dir: bool,
}

/// Walk statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub directories: u64,
    pub files: u64,
    pub errors: u64,
    pub stopped: bool,
}

/// Lazy depth-first walk over a directory tree.
pub struct DirWalk {
    inner: walkdir::IntoIter,
    policy: ErrorPolicy,
    stats: WalkStats,
    done: bool,
}

/// Start walking `root`.
#[must_use]
pub fn walk(root: &Path, policy: ErrorPolicy) -> DirWalk {
    let inner = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    DirWalk {
        inner,
        policy,
        stats: WalkStats::default(),
        done: false,
    }
}

impl DirWalk {
    /// Do not descend into the directory most recently yielded.
    pub fn skip_subtree(&mut self) {
        self.inner.skip_current_dir();
    }

    /// Statistics collected so far.
    #[must_use]
    pub fn stats(&self) -> WalkStats {
        self.stats
    }
}

impl Iterator for DirWalk {
    type Item = WalkEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            match self.inner.next()? {
                Ok(entry) => {
                    let is_dir = entry.file_type().is_dir();
                    if is_dir {
                        self.stats.directories += 1;
                    } else {
                        self.stats.files += 1;
                    }

                    return Some(WalkEntry {
                        path: entry.into_path(),
                        is_dir,
                    });
                }
                Err(e) => {
                    self.stats.errors += 1;
                    let vanished = e
                        .io_error()
                        .is_some_and(|io| io.kind() == io::ErrorKind::NotFound);

                    if vanished && self.policy == ErrorPolicy::StopOnVanished {
                        tracing::debug!(error = %e, "Subtree vanished, stopping walk");
                        self.stats.stopped = true;
                        self.done = true;
                        return None;
                    }

                    tracing::warn!(error = %e, "Error walking directory");
                }
            }
        }
    }
}

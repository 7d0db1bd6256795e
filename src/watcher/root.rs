//! Watch roots: one watched directory tree with its filters and subscribers.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::backend::{WatchBackend, WatchKey};
use super::dispatcher::{Dispatcher, StatsSnapshot, Subscriber, SubscriptionId};
use super::events::{Notification, RawEvent};
use super::tree::WatchTree;
use crate::error::WatcherError;
use crate::Result;

/// Lifecycle of a watch root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Initial registration walk in progress.
    Init,
    /// Receiving and dispatching events.
    Active,
    /// Closed; events are ignored.
    Closed,
}

impl WatchState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Active => 1,
            Self::Closed => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Init,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

/// A watched directory tree.
///
/// Created through [`WatchService::new_watcher`](super::WatchService::new_watcher).
/// Notification paths are relative to [`DirectoryWatcher::path`].
pub struct DirectoryWatcher {
    dispatcher: Dispatcher,
    tree: Mutex<WatchTree>,
    state: AtomicU8,
}

impl DirectoryWatcher {
    /// Resolve `path` and prepare a root; no directory is registered yet.
    pub(crate) fn open(
        path: &Path,
        separator: char,
        backend: Arc<dyn WatchBackend>,
    ) -> Result<Self> {
        let base = path.canonicalize().map_err(|e| {
            WatcherError::watch_failed(path, format!("directory does not exist: {e}"))
        })?;

        if !base.is_dir() {
            return Err(WatcherError::watch_failed(path, "not a directory").into());
        }

        let shared: Arc<Path> = Arc::from(base.as_path());
        Ok(Self {
            dispatcher: Dispatcher::new(shared, separator),
            tree: Mutex::new(WatchTree::new(base, backend)),
            state: AtomicU8::new(WatchState::Init.as_u8()),
        })
    }

    /// Register the whole tree and start accepting events.
    pub(crate) fn initialize(&self) -> usize {
        let registered = self.tree.lock().initialize();

        let _ = self.state.compare_exchange(
            WatchState::Init.as_u8(),
            WatchState::Active.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        tracing::info!(path = %self.path().display(), directories = registered, "Watching directory tree");
        registered
    }

    /// Canonical base path of this root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dispatcher.base()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WatchState {
        WatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == WatchState::Closed
    }

    /// Separator used to compile globs and render probed paths.
    #[must_use]
    pub fn separator(&self) -> char {
        self.dispatcher.separator()
    }

    /// Only report paths matching `glob` (or any other include).
    ///
    /// # Errors
    ///
    /// Returns an error if the glob cannot be compiled.
    pub fn include(&self, glob: &str) -> Result<()> {
        self.dispatcher.include(glob)
    }

    /// Never report paths matching `glob`.
    ///
    /// # Errors
    ///
    /// Returns an error if the glob cannot be compiled.
    pub fn exclude(&self, glob: &str) -> Result<()> {
        self.dispatcher.exclude(glob)
    }

    /// Load exclude globs from an ignore file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or contains an invalid
    /// or unsupported pattern; no pattern is added in that case.
    pub fn exclude_from_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        self.dispatcher.exclude_from_file(path.as_ref())
    }

    /// Whether a notification for `path` would be delivered.
    ///
    /// `path` is relative to the root; absolute paths under the root are
    /// accepted too.
    #[must_use]
    pub fn should_track(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let relative = path.strip_prefix(self.path()).unwrap_or(path);
        self.dispatcher.should_track(relative)
    }

    /// Add a subscriber.
    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = self.dispatcher.subscribe(subscriber);
        tracing::debug!(path = %self.path().display(), subscriber = %id, "Subscriber added");
        id
    }

    /// Remove a subscriber. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Install a hook receiving subscriber callback failures.
    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&WatcherError) + Send + Sync + 'static,
    {
        self.dispatcher.set_error_hook(Arc::new(hook));
    }

    /// Dispatch statistics.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats().snapshot()
    }

    /// Whether `dir` is currently registered with the native layer.
    #[must_use]
    pub fn is_watching(&self, dir: impl AsRef<Path>) -> bool {
        let dir = dir.as_ref();
        let absolute: PathBuf = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.path().join(dir)
        };
        self.tree.lock().is_registered(&absolute)
    }

    /// Number of directories currently registered.
    #[must_use]
    pub fn watched_directories(&self) -> usize {
        self.tree.lock().handle_count()
    }

    /// Receive notifications through a bounded async channel.
    ///
    /// The stream is an ordinary subscriber: when its buffer is full the
    /// notification is dropped and counted as a callback failure. Dropping
    /// the stream unsubscribes it.
    #[must_use]
    pub fn stream(self: &Arc<Self>, capacity: usize) -> NotificationStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        let id = self.subscribe(Subscriber::on_any(move |notification| {
            tx.try_send(notification.clone()).map_err(|e| match e {
                TrySendError::Full(_) => anyhow::anyhow!("notification stream is full"),
                TrySendError::Closed(_) => anyhow::anyhow!("notification stream is closed"),
            })
        }));

        NotificationStream {
            rx,
            watcher: Arc::downgrade(self),
            id,
        }
    }

    /// Stop watching: release every handle and drop every subscriber.
    ///
    /// Calling this more than once has no further effect.
    pub fn close(&self) {
        let previous = self.state.swap(WatchState::Closed.as_u8(), Ordering::SeqCst);
        if previous == WatchState::Closed.as_u8() {
            return;
        }

        let released = self.tree.lock().close();
        let subscribers = self.dispatcher.clear();
        tracing::info!(
            path = %self.path().display(),
            released,
            subscribers,
            "Directory watcher closed"
        );
    }

    pub(crate) fn handle_event(&self, key: WatchKey, event: &RawEvent) {
        if self.state() != WatchState::Active {
            return;
        }

        let changes = self.tree.lock().handle_event(key, event);
        self.dispatcher.dispatch(changes);
    }

    pub(crate) fn handle_key_invalid(&self, key: WatchKey) {
        if self.state() != WatchState::Active {
            return;
        }

        let changes = self.tree.lock().handle_invalidated(key);
        self.dispatcher.dispatch(changes);
    }
}

impl fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("path", &self.path())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Async receiver of a watch root's notifications.
#[derive(Debug)]
pub struct NotificationStream {
    rx: mpsc::Receiver<Notification>,
    watcher: Weak<DirectoryWatcher>,
    id: SubscriptionId,
}

impl NotificationStream {
    /// Wait for the next notification.
    ///
    /// Returns `None` once the watch root is closed and the buffer drained.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    /// Next buffered notification, if any.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.rx.try_recv().ok()
    }

    /// Subscription backing this stream.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.upgrade() {
            watcher.unsubscribe(self.id);
        }
    }
}

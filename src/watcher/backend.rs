//! Native watch channel.
//!
//! The watch tree only needs a handful of primitives from the operating
//! system: register a directory and get a key back, block on or poll for a
//! key with pending events, drain and reset a key, cancel a key, and close
//! the channel. [`WatchBackend`] names exactly those. [`NotifyBackend`]
//! implements them on top of notify-rs with one non-recursive watch per
//! directory.
//!
//! Keys are queued at most once while they have undrained events, so a key
//! is handled by exactly one consumer at a time and its events stay ordered.
//! A single write usually arrives as several native modify events; the queue
//! keeps the first modify of an entry and drops the rest for a short window.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use super::events::{RawEvent, RawEventKind};
use crate::error::WatcherError;
use crate::Result;

/// Window in which repeated modify events for one entry are dropped.
pub const MODIFY_WINDOW: Duration = Duration::from_millis(100);

/// Entries remembered per key before stale modify stamps are pruned.
const MAX_RECENT_MODIFIES: usize = 256;

/// Opaque token for one registered directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey(u64);

impl WatchKey {
    /// Raw key value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// Primitives required from a native directory watching facility.
pub trait WatchBackend: Send + Sync {
    /// Register `dir` for create/modify/delete interest.
    ///
    /// Registering a path that already has a live key returns that key.
    ///
    /// # Errors
    ///
    /// Returns an error if the native layer refuses the registration or the
    /// channel is closed.
    fn register(&self, dir: &Path) -> Result<WatchKey>;

    /// Drop one registration of `key`. Unknown keys are ignored.
    fn cancel(&self, key: WatchKey);

    /// Block until a key has pending events or becomes invalid.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::ChannelClosed`] once the channel is closed.
    fn take(&self) -> Result<WatchKey>;

    /// Return a signalled key without blocking.
    fn poll(&self) -> Option<WatchKey>;

    /// Drain the events pending on `key`.
    fn poll_events(&self, key: WatchKey) -> Vec<RawEvent>;

    /// Re-arm `key` after its events were drained.
    ///
    /// Returns `false` if the key is no longer valid.
    fn reset(&self, key: WatchKey) -> bool;

    /// Close the channel and release every native watch.
    fn close(&self);

    /// Whether [`WatchBackend::close`] has been called.
    fn is_closed(&self) -> bool;

    /// Number of native queue overflows observed so far.
    fn overflow_count(&self) -> u64 {
        0
    }
}

#[derive(Debug)]
struct KeyState {
    path: PathBuf,
    pending: Vec<RawEvent>,
    recent: HashMap<OsString, Instant>,
    signalled: bool,
    valid: bool,
    refs: usize,
}

impl KeyState {
    /// Whether `event` repeats a modify already queued within `window`.
    fn is_repeat(&mut self, event: &RawEvent, window: Duration) -> bool {
        if event.kind != RawEventKind::Modify {
            self.recent.remove(&event.name);
            return false;
        }
        if self.pending.last() == Some(event) {
            return true;
        }
        if window.is_zero() {
            return false;
        }

        let now = Instant::now();
        if self.recent.len() >= MAX_RECENT_MODIFIES {
            self.recent.retain(|_, at| now.duration_since(*at) < window);
        }
        let repeat = self
            .recent
            .get(&event.name)
            .is_some_and(|at| now.duration_since(*at) < window);
        if !repeat {
            self.recent.insert(event.name.clone(), now);
        }
        repeat
    }
}

#[derive(Debug, Default)]
struct KeyTable {
    keys: HashMap<WatchKey, KeyState>,
    by_path: HashMap<PathBuf, WatchKey>,
}

/// Signalled-key bookkeeping shared by backends.
///
/// Tracks the path, pending events, validity and reference count of every
/// key, and hands signalled keys to consumers through a channel.
pub struct KeyQueue {
    table: Mutex<KeyTable>,
    ready_tx: Mutex<Option<Sender<WatchKey>>>,
    ready_rx: Receiver<WatchKey>,
    next_key: AtomicU64,
    overflows: AtomicU64,
    closed: AtomicBool,
    modify_window: Duration,
}

impl Default for KeyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyQueue {
    /// Create an empty queue that only coalesces identical pending modifies.
    #[must_use]
    pub fn new() -> Self {
        Self::with_modify_window(Duration::ZERO)
    }

    /// Create an empty queue that drops repeated modifies of an entry for
    /// `window` after the first one, even if it was already drained.
    #[must_use]
    pub fn with_modify_window(window: Duration) -> Self {
        let (ready_tx, ready_rx) = unbounded();

        Self {
            table: Mutex::new(KeyTable::default()),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx,
            next_key: AtomicU64::new(1),
            overflows: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            modify_window: window,
        }
    }

    /// Take a reference on the key for `path`, creating it if needed.
    ///
    /// The flag is `true` when the key is new and the native watch still
    /// has to be established.
    pub fn acquire(&self, path: &Path) -> (WatchKey, bool) {
        let mut table = self.table.lock();

        if let Some(&key) = table.by_path.get(path) {
            if let Some(state) = table.keys.get_mut(&key) {
                state.refs += 1;
                return (key, false);
            }
        }

        let key = WatchKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        table.keys.insert(
            key,
            KeyState {
                path: path.to_path_buf(),
                pending: Vec::new(),
                recent: HashMap::new(),
                signalled: false,
                valid: true,
                refs: 1,
            },
        );
        table.by_path.insert(path.to_path_buf(), key);
        (key, true)
    }

    /// Drop a reference on `key`.
    ///
    /// Returns the key's path when the last reference of a still valid key
    /// is released, meaning the native watch should be removed.
    pub fn release(&self, key: WatchKey) -> Option<PathBuf> {
        let mut table = self.table.lock();
        let state = table.keys.get_mut(&key)?;

        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 || !state.valid {
            return None;
        }

        let state = table.keys.remove(&key)?;
        if table.by_path.get(&state.path) == Some(&key) {
            table.by_path.remove(&state.path);
        }
        Some(state.path)
    }

    /// Live key registered for `path`.
    #[must_use]
    pub fn key_for(&self, path: &Path) -> Option<WatchKey> {
        self.table.lock().by_path.get(path).copied()
    }

    /// Directory `key` was registered for.
    #[must_use]
    pub fn path_of(&self, key: WatchKey) -> Option<PathBuf> {
        self.table.lock().keys.get(&key).map(|s| s.path.clone())
    }

    /// Whether `key` is known and valid.
    #[must_use]
    pub fn is_valid(&self, key: WatchKey) -> bool {
        self.table.lock().keys.get(&key).is_some_and(|s| s.valid)
    }

    /// Queue an event on `key`.
    ///
    /// A modify event identical to the last pending one is coalesced, and a
    /// modify of an entry already modified within the queue's window is
    /// dropped. Creates and deletes are always queued.
    pub fn signal(&self, key: WatchKey, event: RawEvent) {
        let mut table = self.table.lock();
        let Some(state) = table.keys.get_mut(&key) else {
            return;
        };
        if !state.valid || state.is_repeat(&event, self.modify_window) {
            return;
        }

        state.pending.push(event);
        if !state.signalled {
            state.signalled = true;
            self.send_ready(key);
        }
    }

    /// Report an event for `path` on the key of its parent directory.
    pub fn signal_entry(&self, path: &Path, kind: RawEventKind) {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return;
        };

        match self.key_for(parent) {
            Some(key) => self.signal(key, RawEvent::new(kind, name)),
            None => tracing::trace!(path = %path.display(), "Event outside registered directories"),
        }
    }

    /// Report that `path` disappeared.
    ///
    /// If `path` is itself a registered directory its key is invalidated,
    /// otherwise a delete is reported on the parent's key.
    pub fn signal_removed(&self, path: &Path) {
        match self.key_for(path) {
            Some(key) => self.invalidate(key),
            None => self.signal_entry(path, RawEventKind::Delete),
        }
    }

    /// Mark `key` invalid; consumers see this when they reset it.
    pub fn invalidate(&self, key: WatchKey) {
        let mut table = self.table.lock();
        let Some(state) = table.keys.get_mut(&key) else {
            return;
        };
        if !state.valid {
            return;
        }

        state.valid = false;
        let path = state.path.clone();
        let signalled = std::mem::replace(&mut state.signalled, true);

        if table.by_path.get(&path) == Some(&key) {
            table.by_path.remove(&path);
        }
        if !signalled {
            self.send_ready(key);
        }
    }

    /// Count a native queue overflow.
    pub fn record_overflow(&self) {
        let total = self.overflows.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(total, "Native event queue overflowed, events were lost");
    }

    /// Overflows recorded so far.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Block for the next signalled key.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::ChannelClosed`] once the queue is closed and
    /// no signalled keys remain.
    pub fn take(&self) -> Result<WatchKey> {
        self.ready_rx
            .recv()
            .map_err(|_| WatcherError::ChannelClosed.into())
    }

    /// Next signalled key, if any, without blocking.
    #[must_use]
    pub fn poll(&self) -> Option<WatchKey> {
        self.ready_rx.try_recv().ok()
    }

    /// Drain pending events of `key`.
    pub fn drain(&self, key: WatchKey) -> Vec<RawEvent> {
        self.table
            .lock()
            .keys
            .get_mut(&key)
            .map(|s| std::mem::take(&mut s.pending))
            .unwrap_or_default()
    }

    /// Re-arm `key`. Invalid keys are forgotten and reported as `false`.
    pub fn reset(&self, key: WatchKey) -> bool {
        let mut table = self.table.lock();
        let Some(state) = table.keys.get_mut(&key) else {
            return false;
        };

        if !state.valid {
            table.keys.remove(&key);
            return false;
        }

        if state.pending.is_empty() {
            state.signalled = false;
        } else {
            self.send_ready(key);
        }
        true
    }

    /// Close the queue; blocked consumers wake up with an error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready_tx.lock().take();
    }

    /// Whether the queue has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send_ready(&self, key: WatchKey) {
        if let Some(tx) = self.ready_tx.lock().as_ref() {
            let _ = tx.send(key);
        }
    }
}

/// Translate one notify event into key signals.
fn route_native_event(queue: &KeyQueue, event: &Event) {
    if event.need_rescan() {
        queue.record_overflow();
        return;
    }

    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                queue.signal_entry(path, RawEventKind::Create);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for path in &event.paths {
                    queue.signal_removed(path);
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    queue.signal_entry(path, RawEventKind::Create);
                }
            }
            // Paired renames are also reported as separate From and To events.
            RenameMode::Both => {}
            _ => {
                for path in &event.paths {
                    if path.exists() {
                        queue.signal_entry(path, RawEventKind::Create);
                    } else {
                        queue.signal_removed(path);
                    }
                }
            }
        },
        EventKind::Modify(_) => {
            for path in &event.paths {
                queue.signal_entry(path, RawEventKind::Modify);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                queue.signal_removed(path);
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
}

/// Native backend built on notify-rs.
pub struct NotifyBackend {
    queue: Arc<KeyQueue>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl NotifyBackend {
    /// Create a backend with its own native watcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the native watcher cannot be created.
    pub fn new() -> Result<Self> {
        let queue = Arc::new(KeyQueue::with_modify_window(MODIFY_WINDOW));
        let sink = Arc::clone(&queue);

        let watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) => route_native_event(&sink, &event),
                Err(e) => {
                    tracing::error!("Watch error: {:?}", e);
                }
            })
            .map_err(|e| WatcherError::watch_failed("init", e.to_string()))?;

        Ok(Self {
            queue,
            watcher: Mutex::new(Some(watcher)),
        })
    }
}

impl WatchBackend for NotifyBackend {
    fn register(&self, dir: &Path) -> Result<WatchKey> {
        let mut watcher = self.watcher.lock();
        let native = watcher.as_mut().ok_or(WatcherError::Closed)?;

        let (key, fresh) = self.queue.acquire(dir);
        if fresh {
            if let Err(e) = native.watch(dir, RecursiveMode::NonRecursive) {
                self.queue.release(key);
                return Err(WatcherError::RegistrationFailed {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                }
                .into());
            }
            tracing::debug!(path = %dir.display(), %key, "Registered directory");
        }

        Ok(key)
    }

    fn cancel(&self, key: WatchKey) {
        let mut watcher = self.watcher.lock();
        let Some(path) = self.queue.release(key) else {
            return;
        };

        if let Some(native) = watcher.as_mut() {
            if let Err(e) = native.unwatch(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Native watch already gone");
            }
        }
    }

    fn take(&self) -> Result<WatchKey> {
        self.queue.take()
    }

    fn poll(&self) -> Option<WatchKey> {
        self.queue.poll()
    }

    fn poll_events(&self, key: WatchKey) -> Vec<RawEvent> {
        self.queue.drain(key)
    }

    fn reset(&self, key: WatchKey) -> bool {
        self.queue.reset(key)
    }

    fn close(&self) {
        self.queue.close();
        if self.watcher.lock().take().is_some() {
            tracing::debug!("Native watcher released");
        }
    }

    fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    fn overflow_count(&self) -> u64 {
        self.queue.overflow_count()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::thread;
    use std::time::Duration;

    fn modify(name: &str) -> RawEvent {
        RawEvent::new(RawEventKind::Modify, name)
    }

    #[test]
    fn test_acquire_is_idempotent_per_path() {
        let queue = KeyQueue::new();
        let (first, fresh) = queue.acquire(Path::new("/w/a"));
        let (second, again) = queue.acquire(Path::new("/w/a"));

        assert!(fresh);
        assert!(!again);
        assert_eq!(first, second);
        assert_eq!(queue.key_for(Path::new("/w/a")), Some(first));
    }

    #[test]
    fn test_release_returns_path_on_last_reference() {
        let queue = KeyQueue::new();
        let (key, _) = queue.acquire(Path::new("/w/a"));
        queue.acquire(Path::new("/w/a"));

        assert_eq!(queue.release(key), None);
        assert_eq!(queue.release(key), Some(PathBuf::from("/w/a")));
        assert_eq!(queue.key_for(Path::new("/w/a")), None);
        assert_eq!(queue.release(key), None);
    }

    #[test]
    fn test_key_signalled_once_until_reset() {
        let queue = KeyQueue::new();
        let (key, _) = queue.acquire(Path::new("/w"));

        queue.signal(key, RawEvent::new(RawEventKind::Create, "a"));
        queue.signal(key, RawEvent::new(RawEventKind::Create, "b"));

        assert_eq!(queue.poll(), Some(key));
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.drain(key).len(), 2);
        assert!(queue.reset(key));
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_events_after_drain_requeue_on_reset() {
        let queue = KeyQueue::new();
        let (key, _) = queue.acquire(Path::new("/w"));

        queue.signal(key, modify("a"));
        assert_eq!(queue.poll(), Some(key));
        assert_eq!(queue.drain(key), vec![modify("a")]);

        queue.signal(key, modify("b"));
        assert_eq!(queue.poll(), None);
        assert!(queue.reset(key));
        assert_eq!(queue.poll(), Some(key));
        assert_eq!(queue.drain(key), vec![modify("b")]);
    }

    #[test]
    fn test_repeated_modify_coalesced() {
        let queue = KeyQueue::new();
        let (key, _) = queue.acquire(Path::new("/w"));

        queue.signal(key, modify("file"));
        queue.signal(key, modify("file"));
        queue.signal(key, modify("other"));
        queue.signal(key, modify("file"));

        let names: Vec<OsString> = queue.drain(key).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["file", "other", "file"]);
    }

    #[test]
    fn test_modify_after_drain_dropped_within_window() {
        let queue = KeyQueue::with_modify_window(Duration::from_secs(60));
        let (key, _) = queue.acquire(Path::new("/w"));

        queue.signal(key, modify("file"));
        assert_eq!(queue.poll(), Some(key));
        assert_eq!(queue.drain(key), vec![modify("file")]);
        assert!(queue.reset(key));

        // Second native event of the same write, after the first was handled.
        queue.signal(key, modify("file"));
        assert_eq!(queue.poll(), None);
        assert!(queue.drain(key).is_empty());

        queue.signal(key, modify("other"));
        assert_eq!(queue.drain(key), vec![modify("other")]);
    }

    #[test]
    fn test_modify_window_cleared_by_delete_and_expiry() {
        let queue = KeyQueue::with_modify_window(Duration::from_millis(50));
        let (key, _) = queue.acquire(Path::new("/w"));
        let delete = RawEvent::new(RawEventKind::Delete, "file");

        queue.signal(key, modify("file"));
        queue.signal(key, delete.clone());
        queue.signal(key, modify("file"));
        assert_eq!(
            queue.drain(key),
            vec![modify("file"), delete, modify("file")]
        );

        thread::sleep(Duration::from_millis(80));
        queue.signal(key, modify("file"));
        assert_eq!(queue.drain(key), vec![modify("file")]);
    }

    #[test]
    fn test_signal_entry_routes_to_parent_key() {
        let queue = KeyQueue::new();
        let (key, _) = queue.acquire(Path::new("/w/dir"));

        queue.signal_entry(Path::new("/w/dir/file"), RawEventKind::Create);
        queue.signal_entry(Path::new("/elsewhere/file"), RawEventKind::Create);

        assert_eq!(queue.poll(), Some(key));
        assert_eq!(
            queue.drain(key),
            vec![RawEvent::new(RawEventKind::Create, "file")]
        );
        assert_eq!(queue.poll(), None);
    }

    #[test]
    fn test_removed_directory_invalidates_key() {
        let queue = KeyQueue::new();
        let (parent, _) = queue.acquire(Path::new("/w"));
        let (child, _) = queue.acquire(Path::new("/w/dir"));

        queue.signal_removed(Path::new("/w/dir"));
        assert_eq!(queue.poll(), Some(child));
        assert!(!queue.reset(child));
        assert!(!queue.is_valid(child));

        // Second report of the same removal lands on the parent.
        queue.signal_removed(Path::new("/w/dir"));
        assert_eq!(queue.poll(), Some(parent));
        assert_eq!(
            queue.drain(parent),
            vec![RawEvent::new(RawEventKind::Delete, "dir")]
        );
    }

    #[test]
    fn test_invalid_key_does_not_unwatch_replacement() {
        let queue = KeyQueue::new();
        let (old, _) = queue.acquire(Path::new("/w/dir"));
        queue.invalidate(old);
        let (new, fresh) = queue.acquire(Path::new("/w/dir"));

        assert!(fresh);
        assert_ne!(old, new);
        assert_eq!(queue.release(old), None);
        assert_eq!(queue.key_for(Path::new("/w/dir")), Some(new));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(KeyQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.take())
        };

        thread::sleep(Duration::from_millis(50));
        queue.close();

        let result = consumer.join().unwrap();
        assert!(matches!(
            result,
            Err(crate::Error::Watcher(WatcherError::ChannelClosed))
        ));
        assert!(queue.is_closed());
    }

    #[test]
    fn test_overflow_counted() {
        let queue = KeyQueue::new();
        let event = Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        route_native_event(&queue, &event);
        assert_eq!(queue.overflow_count(), 1);
    }

    #[test]
    fn test_route_rename() {
        let queue = KeyQueue::new();
        let (key, _) = queue.acquire(Path::new("/w"));
        let rename = |mode, paths: &[&str]| {
            paths.iter().fold(
                Event::new(EventKind::Modify(ModifyKind::Name(mode))),
                |event, p| event.add_path(PathBuf::from(p)),
            )
        };

        route_native_event(&queue, &rename(RenameMode::From, &["/w/old"]));
        route_native_event(&queue, &rename(RenameMode::To, &["/w/new"]));
        route_native_event(&queue, &rename(RenameMode::Both, &["/w/old", "/w/new"]));

        assert_eq!(
            queue.drain(key),
            vec![
                RawEvent::new(RawEventKind::Delete, "old"),
                RawEvent::new(RawEventKind::Create, "new"),
            ]
        );
    }

    #[test]
    fn test_access_events_ignored() {
        let queue = KeyQueue::new();
        queue.acquire(Path::new("/w"));
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/w/file"));

        route_native_event(&queue, &event);
        assert_eq!(queue.poll(), None);
    }
}

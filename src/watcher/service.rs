//! Watch service: owns the native channel and drives it.
//!
//! In polling mode the caller drains signalled keys with
//! [`WatchService::poll`]. In thread-pool mode named worker threads block on
//! the channel; each signalled key is handled by exactly one worker.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use super::backend::{NotifyBackend, WatchBackend, WatchKey};
use super::root::DirectoryWatcher;
use crate::config::{validate_separator, validate_threads, ExecutionMode, ServiceConfig};
use crate::error::WatcherError;
use crate::observability::spans;
use crate::{Error, Result};

/// State shared with worker threads.
struct ServiceInner {
    backend: Arc<dyn WatchBackend>,
    watchers: RwLock<Vec<Arc<DirectoryWatcher>>>,
    closed: AtomicBool,
    keys_handled: AtomicU64,
}

impl ServiceInner {
    /// Live watch roots; closed ones are dropped from the list.
    fn live_watchers(&self) -> Vec<Arc<DirectoryWatcher>> {
        let snapshot = self.watchers.read().clone();
        if snapshot.iter().all(|w| !w.is_closed()) {
            return snapshot;
        }

        let mut watchers = self.watchers.write();
        watchers.retain(|w| !w.is_closed());
        watchers.clone()
    }

    /// Drain `key`, offer its events to every root, then re-arm it.
    fn handle_key(&self, key: WatchKey) {
        let _span = spans::key_span(key.as_u64()).entered();
        let events = self.backend.poll_events(key);
        let watchers = self.live_watchers();

        tracing::debug!(%key, events = events.len(), watchers = watchers.len(), "Handling key");

        for event in &events {
            for watcher in &watchers {
                watcher.handle_event(key, event);
            }
        }

        if !self.backend.reset(key) {
            tracing::debug!(%key, "Key invalidated");
            for watcher in &watchers {
                watcher.handle_key_invalid(key);
            }
        }

        self.keys_handled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Directory watching service.
///
/// One service shares a single native channel between any number of
/// [`DirectoryWatcher`]s. Closed on drop.
pub struct WatchService {
    inner: Arc<ServiceInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    mode: ExecutionMode,
    separator: char,
}

impl WatchService {
    /// Create a service on the native backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the native watcher
    /// cannot be created or a worker thread cannot be spawned.
    pub fn new(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;
        let backend = Arc::new(NotifyBackend::new()?);
        Self::with_backend(backend, config)
    }

    /// Create a caller-driven service.
    ///
    /// # Errors
    ///
    /// Returns an error if the native watcher cannot be created.
    pub fn polling() -> Result<Self> {
        Self::new(&ServiceConfig::polling())
    }

    /// Create a service with `threads` worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error if `threads` is out of range, the native watcher
    /// cannot be created or a worker thread cannot be spawned.
    pub fn thread_pool(threads: usize) -> Result<Self> {
        Self::new(&ServiceConfig::thread_pool(threads))
    }

    /// Create a service on a caller-supplied backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a worker thread
    /// cannot be spawned.
    pub fn with_backend(backend: Arc<dyn WatchBackend>, config: &ServiceConfig) -> Result<Self> {
        config.validate()?;

        let service = Self {
            inner: Arc::new(ServiceInner {
                backend,
                watchers: RwLock::new(Vec::new()),
                closed: AtomicBool::new(false),
                keys_handled: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
            mode: config.mode,
            separator: config.effective_separator(),
        };

        if let ExecutionMode::ThreadPool { threads } = config.mode {
            service.spawn_workers(threads)?;
        }

        tracing::info!(mode = config.mode.name(), "Watch service started");
        Ok(service)
    }

    /// Execution mode fixed at construction.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Watch the tree under `path` with the service's separator.
    ///
    /// Returns once every existing directory has been registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is closed or `path` is not an
    /// existing directory.
    pub fn new_watcher(&self, path: impl AsRef<Path>) -> Result<Arc<DirectoryWatcher>> {
        self.new_watcher_with_separator(path, self.separator)
    }

    /// Watch the tree under `path`, compiling globs with `separator`.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is closed, the separator is invalid
    /// or `path` is not an existing directory.
    pub fn new_watcher_with_separator(
        &self,
        path: impl AsRef<Path>,
        separator: char,
    ) -> Result<Arc<DirectoryWatcher>> {
        if self.is_closed() {
            return Err(WatcherError::Closed.into());
        }
        validate_separator(separator)?;

        let watcher = Arc::new(DirectoryWatcher::open(
            path.as_ref(),
            separator,
            Arc::clone(&self.inner.backend),
        )?);

        self.inner.watchers.write().push(Arc::clone(&watcher));
        watcher.initialize();
        Ok(watcher)
    }

    /// Live watch roots of this service.
    #[must_use]
    pub fn watchers(&self) -> Vec<Arc<DirectoryWatcher>> {
        self.inner.live_watchers()
    }

    /// Add `threads` worker threads.
    ///
    /// # Errors
    ///
    /// Returns an error in polling mode, after close, or if the total would
    /// exceed the thread limit.
    pub fn start(&self, threads: usize) -> Result<()> {
        if self.mode == ExecutionMode::Polling {
            return Err(WatcherError::ModeMismatch {
                expected: ExecutionMode::ThreadPool { threads }.name(),
                actual: self.mode.name(),
            }
            .into());
        }
        if self.is_closed() {
            return Err(WatcherError::Closed.into());
        }

        validate_threads(threads)?;
        validate_threads(self.worker_count() + threads)?;
        self.spawn_workers(threads)
    }

    /// Handle every key that is signalled right now, without blocking.
    ///
    /// Returns the number of keys handled.
    ///
    /// # Errors
    ///
    /// Returns an error in thread-pool mode or after close.
    pub fn poll(&self) -> Result<usize> {
        if self.mode != ExecutionMode::Polling {
            return Err(WatcherError::ModeMismatch {
                expected: ExecutionMode::Polling.name(),
                actual: self.mode.name(),
            }
            .into());
        }
        if self.is_closed() {
            return Err(WatcherError::Closed.into());
        }

        let mut handled = 0;
        while let Some(key) = self.inner.backend.poll() {
            self.inner.handle_key(key);
            handled += 1;
        }
        Ok(handled)
    }

    /// Number of worker threads spawned.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Keys handled since the service started.
    #[must_use]
    pub fn keys_handled(&self) -> u64 {
        self.inner.keys_handled.load(Ordering::Relaxed)
    }

    /// Native queue overflows observed by the backend.
    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.inner.backend.overflow_count()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the channel and every watch root, then join the workers.
    ///
    /// Idempotent. May be called from a subscriber callback; the calling
    /// worker is not joined.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.backend.close();

        let watchers: Vec<_> = self.inner.watchers.write().drain(..).collect();
        for watcher in &watchers {
            watcher.close();
        }

        let current = std::thread::current().id();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let joined = workers.len();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("Watch worker panicked");
            }
        }

        tracing::info!(
            watchers = watchers.len(),
            workers = joined,
            keys_handled = self.keys_handled(),
            "Watch service closed"
        );
    }

    fn spawn_workers(&self, threads: usize) -> Result<()> {
        let mut workers = self.workers.lock();
        let first = workers.len();

        for i in first..first + threads {
            let inner = Arc::clone(&self.inner);

            let handle = std::thread::Builder::new()
                .name(format!("treewatch-worker-{i}"))
                .spawn(move || {
                    worker_loop(&inner);
                })
                .map_err(|e| Error::internal(format!("failed to spawn worker: {e}")))?;

            workers.push(handle);
        }

        tracing::info!(threads, total = workers.len(), "Watch worker pool started");
        Ok(())
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WatchService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchService")
            .field("mode", &self.mode)
            .field("separator", &self.separator)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Block on the channel and handle keys until it closes.
fn worker_loop(inner: &ServiceInner) {
    loop {
        match inner.backend.take() {
            Ok(key) => inner.handle_key(key),
            Err(_) => {
                tracing::debug!("Watch worker shutting down");
                return;
            }
        }
    }
}

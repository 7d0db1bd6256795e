//! Subscriber registry and notification dispatch for one watch root.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::events::{Change, Notification, NotificationKind};
use super::filter::FilterSet;
use crate::error::WatcherError;
use crate::Result;

/// Callback invoked with a notification.
pub type Callback = Arc<dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync>;

/// Hook receiving callback failures.
pub type ErrorHook = Arc<dyn Fn(&WatcherError) + Send + Sync>;

/// A set of optional callbacks, one per notification kind.
#[derive(Clone, Default)]
pub struct Subscriber {
    on_create: Option<Callback>,
    on_modify: Option<Callback>,
    on_delete: Option<Callback>,
}

impl Subscriber {
    /// Subscriber with no callbacks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscriber receiving every kind through the same callback.
    #[must_use]
    pub fn on_any<F>(f: F) -> Self
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(f);
        Self {
            on_create: Some(Arc::clone(&callback)),
            on_modify: Some(Arc::clone(&callback)),
            on_delete: Some(callback),
        }
    }

    #[must_use]
    pub fn on_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_create = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_modify<F>(mut self, f: F) -> Self
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_modify = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_delete = Some(Arc::new(f));
        self
    }

    /// Callback registered for `kind`, if any.
    #[must_use]
    pub fn callback_for(&self, kind: NotificationKind) -> Option<&Callback> {
        match kind {
            NotificationKind::Created => self.on_create.as_ref(),
            NotificationKind::Modified => self.on_modify.as_ref(),
            NotificationKind::Deleted => self.on_delete.as_ref(),
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("on_create", &self.on_create.is_some())
            .field("on_modify", &self.on_modify.is_some())
            .field("on_delete", &self.on_delete.is_some())
            .finish()
    }
}

/// Token identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch counters for one watch root.
#[derive(Debug, Default)]
pub struct WatcherStats {
    dispatched: AtomicU64,
    callbacks_invoked: AtomicU64,
    callback_failures: AtomicU64,
}

/// Point-in-time copy of [`WatcherStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Notifications that passed the filters.
    pub dispatched: u64,
    /// Callbacks invoked.
    pub callbacks_invoked: u64,
    /// Callbacks that returned an error or panicked.
    pub callback_failures: u64,
}

impl WatcherStats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            callbacks_invoked: self.callbacks_invoked.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Dispatcher {
    base: Arc<Path>,
    filters: RwLock<FilterSet>,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<Subscriber>)>>,
    next_id: AtomicU64,
    stats: WatcherStats,
    error_hook: RwLock<Option<ErrorHook>>,
}

impl Dispatcher {
    pub fn new(base: Arc<Path>, separator: char) -> Self {
        Self {
            base,
            filters: RwLock::new(FilterSet::new(separator)),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stats: WatcherStats::default(),
            error_hook: RwLock::new(None),
        }
    }

    pub fn base(&self) -> &Arc<Path> {
        &self.base
    }

    pub fn include(&self, glob: &str) -> Result<()> {
        self.filters.write().include(glob)
    }

    pub fn exclude(&self, glob: &str) -> Result<()> {
        self.filters.write().exclude(glob)
    }

    pub fn exclude_from_file(&self, path: &Path) -> Result<usize> {
        self.filters.write().exclude_from_file(path)
    }

    pub fn should_track(&self, relative: &Path) -> bool {
        self.filters.read().should_track(relative)
    }

    pub fn separator(&self) -> char {
        self.filters.read().separator()
    }

    pub fn subscribe(&self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers.write().push((id, Arc::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Drop every subscriber, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        let removed = subscribers.len();
        subscribers.clear();
        removed
    }

    pub fn set_error_hook(&self, hook: ErrorHook) {
        *self.error_hook.write() = Some(hook);
    }

    pub fn stats(&self) -> &WatcherStats {
        &self.stats
    }

    pub fn dispatch(&self, changes: Vec<Change>) {
        for change in changes {
            self.notify(change.kind, &change.path);
        }
    }

    /// Deliver one change to every matching subscriber.
    ///
    /// Returns the number of callbacks invoked.
    pub fn notify(&self, kind: NotificationKind, absolute: &Path) -> usize {
        let Ok(relative) = absolute.strip_prefix(&*self.base) else {
            tracing::trace!(path = %absolute.display(), "Change outside watch root");
            return 0;
        };

        if !self.should_track(relative) {
            return 0;
        }
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);

        let notification =
            Notification::new(kind, Arc::clone(&self.base), relative.to_path_buf());
        tracing::debug!(%kind, path = %relative.display(), "Dispatching notification");

        let subscribers = self.subscribers.read().clone();
        let mut invoked = 0;

        for (id, subscriber) in &subscribers {
            let Some(callback) = subscriber.callback_for(kind) else {
                continue;
            };
            invoked += 1;
            self.stats.callbacks_invoked.fetch_add(1, Ordering::Relaxed);

            match catch_unwind(AssertUnwindSafe(|| callback(&notification))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => self.report_failure(*id, absolute, format!("{e:#}")),
                Err(panic) => self.report_failure(*id, absolute, panic_message(&*panic)),
            }
        }

        invoked
    }

    fn report_failure(&self, id: SubscriptionId, path: &Path, reason: String) {
        self.stats.callback_failures.fetch_add(1, Ordering::Relaxed);

        let err = WatcherError::CallbackFailed {
            subscriber: id.as_u64(),
            path: PathBuf::from(path),
            reason,
        };
        tracing::error!(subscriber = id.as_u64(), error = %err, "Subscriber callback failed");

        let hook = self.error_hook.read().clone();
        if let Some(hook) = hook {
            hook(&err);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

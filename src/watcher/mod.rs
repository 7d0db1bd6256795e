//! Recursive directory watching.
//!
//! This module provides:
//! - A native watch channel built on notify-rs ([`WatchBackend`], [`NotifyBackend`])
//! - Glob include/exclude filtering ([`FilterSet`])
//! - Per-root registration trees that follow directory creation and removal
//! - Subscriber dispatch ([`DirectoryWatcher`]) and the driving [`WatchService`]

mod backend;
mod dispatcher;
mod events;
mod filter;
mod root;
mod scanner;
mod service;
mod tree;

pub use backend::{KeyQueue, NotifyBackend, WatchBackend, WatchKey, MODIFY_WINDOW};
pub use dispatcher::{Callback, ErrorHook, StatsSnapshot, Subscriber, SubscriptionId, WatcherStats};
pub use events::{Notification, NotificationKind, RawEvent, RawEventKind};
pub use filter::{glob_to_regex, FilterSet, GlobMatcher};
pub use root::{DirectoryWatcher, NotificationStream, WatchState};
pub use scanner::{walk, DirWalk, ErrorPolicy, WalkEntry, WalkStats};
pub use service::WatchService;

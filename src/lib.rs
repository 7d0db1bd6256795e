//! treewatch
//!
//! Recursive directory tree watching with glob filtering and subscriber
//! callbacks, on top of per-directory native watches.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod observability;
pub mod watcher;

pub use config::{ExecutionMode, ServiceConfig};
pub use error::{Error, PatternError, Result, WatcherError};
pub use watcher::{
    DirectoryWatcher, Notification, NotificationKind, NotificationStream, Subscriber,
    SubscriptionId, WatchService,
};

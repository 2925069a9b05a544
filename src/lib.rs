//! Native directory-change monitoring.
//!
//! A [`DirectoryMonitor`] watches one directory (non-recursively) and reports
//! files being added, removed, modified and renamed to an [`EventSink`],
//! using inotify on Linux, `ReadDirectoryChangesW` on Windows and the
//! `notify` crate elsewhere. [`MonitorController`] runs the blocking watch
//! loop on its own thread; [`enumerate_files`] produces on-demand snapshots.

pub mod backend;
pub mod cli;
pub mod config;
pub mod controller;
pub mod decode;
pub mod error;
pub mod events;
pub mod monitor;
pub mod snapshot;

pub use backend::{create_monitor, NotifyMonitor};
#[cfg(target_os = "linux")]
pub use backend::InotifyMonitor;
#[cfg(windows)]
pub use backend::WindowsMonitor;
pub use config::{ControllerConfig, MonitorConfig, WatchMode, WatcherConfig};
pub use controller::MonitorController;
pub use error::MonitorError;
pub use events::*;
pub use monitor::{DirectoryMonitor, MonitorState};
pub use snapshot::enumerate_files;

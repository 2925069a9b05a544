//! Concrete monitors and the factory that picks one.

#[cfg(target_os = "linux")]
pub mod inotify;
pub mod portable;
#[cfg(windows)]
pub mod windows;

use std::sync::Arc;
use crate::config::{WatchMode, WatcherConfig};
use crate::{DirectoryMonitor, EventSink};

#[cfg(target_os = "linux")]
pub use inotify::InotifyMonitor;
pub use portable::NotifyMonitor;
#[cfg(windows)]
pub use windows::WindowsMonitor;

/// Build the monitor selected by `config.mode`.
///
/// `Auto` uses the built-in notification loop on Linux and Windows and falls
/// back to the `notify` crate everywhere else.
pub fn create_monitor(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Arc<dyn DirectoryMonitor> {
    match config.mode {
        WatchMode::Auto => native_monitor(config, sink),
        WatchMode::Notify => Arc::new(NotifyMonitor::recommended(config, sink)),
        WatchMode::Polling => Arc::new(NotifyMonitor::polling(config, sink)),
    }
}

#[cfg(target_os = "linux")]
fn native_monitor(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Arc<dyn DirectoryMonitor> {
    Arc::new(InotifyMonitor::new(config, sink))
}

#[cfg(windows)]
fn native_monitor(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Arc<dyn DirectoryMonitor> {
    Arc::new(WindowsMonitor::new(config, sink))
}

#[cfg(not(any(target_os = "linux", windows)))]
fn native_monitor(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Arc<dyn DirectoryMonitor> {
    Arc::new(NotifyMonitor::recommended(config, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LoggingSink;

    #[test]
    fn test_factory_honours_mode() {
        let sink: Arc<dyn EventSink> = Arc::new(LoggingSink);
        let mut config = WatcherConfig::default();

        config.mode = WatchMode::Polling;
        assert_eq!(create_monitor(&config, Arc::clone(&sink)).backend_name(), "polling");

        config.mode = WatchMode::Notify;
        assert_eq!(create_monitor(&config, Arc::clone(&sink)).backend_name(), "notify");

        config.mode = WatchMode::Auto;
        let expected = if cfg!(target_os = "linux") {
            "inotify"
        } else if cfg!(windows) {
            "ReadDirectoryChangesW"
        } else {
            "notify"
        };
        assert_eq!(create_monitor(&config, sink).backend_name(), expected);
    }
}

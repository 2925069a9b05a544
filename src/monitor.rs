//! The monitoring contract shared by every backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use crate::decode::Notification;
use crate::{snapshot, EventSink, FileRecord, MonitorError};

/// State every monitor owns: the watched path, the run flag, whether a loop
/// currently holds its OS handle, the last error and the sink.
pub struct MonitorState {
    directory: RwLock<PathBuf>,
    run_flag: AtomicBool,
    watching: AtomicBool,
    last_error: Mutex<String>,
    sink: Arc<dyn EventSink>,
}

/// What the watch loop should do after a batch of notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    WatchLost,
}

impl MonitorState {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            directory: RwLock::new(PathBuf::new()),
            run_flag: AtomicBool::new(false),
            watching: AtomicBool::new(false),
            last_error: Mutex::new(String::new()),
            sink,
        }
    }

    pub fn sink(&self) -> &dyn EventSink {
        self.sink.as_ref()
    }

    pub fn directory_path(&self) -> PathBuf {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_directory_path(&self, path: &Path) {
        *self.directory.write().unwrap_or_else(PoisonError::into_inner) = path.to_path_buf();
    }

    /// True until someone asks the loop to stop.
    pub fn should_run(&self) -> bool {
        self.run_flag.load(Ordering::Acquire)
    }

    fn set_run_flag(&self, value: bool) {
        self.run_flag.store(value, Ordering::Release);
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record_error(&self, err: &MonitorError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = err.to_string();
    }

    fn clear_error(&self) {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Mark the loop as active for as long as the guard lives.
    ///
    /// Backends call this right after acquiring their OS handle, so
    /// `in_process()` only reports true while a handle is actually held.
    pub fn enter_loop(&self) -> WatchingGuard<'_> {
        self.clear_error();
        self.watching.store(true, Ordering::Release);
        WatchingGuard { state: self }
    }

    /// Hand decoded notifications to the sink in order.
    pub fn deliver<I>(&self, dir: &Path, notifications: I) -> LoopControl
    where
        I: IntoIterator<Item = Notification>,
    {
        for notification in notifications {
            match notification {
                Notification::Change(event) => {
                    tracing::debug!("{} {}", event.label(), event.name().display());
                    event.dispatch(self.sink());
                }
                Notification::Overflow => {
                    tracing::warn!(
                        "Change notifications overflowed for {}, resending snapshot",
                        dir.display()
                    );
                    self.sink().on_snapshot_changed(&snapshot::enumerate_files(dir));
                }
                Notification::WatchLost => {
                    tracing::warn!("Watched directory {} went away", dir.display());
                    return LoopControl::WatchLost;
                }
            }
        }
        LoopControl::Continue
    }
}

pub struct WatchingGuard<'a> {
    state: &'a MonitorState,
}

impl Drop for WatchingGuard<'_> {
    fn drop(&mut self) {
        self.state.watching.store(false, Ordering::Release);
    }
}

/// Reject paths a watch loop cannot be started on.
pub fn validate_directory(dir: &Path) -> Result<(), MonitorError> {
    if dir.as_os_str().is_empty() {
        return Err(MonitorError::EmptyPath);
    }
    if !dir.is_dir() {
        return Err(MonitorError::PathNotFound(dir.to_path_buf()));
    }
    Ok(())
}

/// A directory monitor.
///
/// `start` blocks the calling thread for the whole life of the watch loop,
/// so it is meant to run on a dedicated thread (see
/// [`MonitorController`](crate::MonitorController)). Stopping is
/// cooperative: `stop` clears the run flag and the loop notices it within one
/// bounded OS wait.
///
/// Backends only provide [`watch`](DirectoryMonitor::watch); the rest of the
/// contract is shared.
pub trait DirectoryMonitor: Send + Sync {
    fn state(&self) -> &MonitorState;

    fn backend_name(&self) -> &'static str;

    /// Acquire an OS handle on `dir` and run the wait-decode loop until the
    /// run flag clears, the wait fails or the directory disappears.
    ///
    /// Only a failure to acquire the handle is an error. The handle must be
    /// released on every return path.
    fn watch(&self, dir: &Path) -> Result<(), MonitorError>;

    fn start(&self) {
        let state = self.state();
        state.set_run_flag(true);

        let dir = state.directory_path();
        tracing::info!("Starting {} monitor on {}", self.backend_name(), dir.display());

        if let Err(err) = validate_directory(&dir).and_then(|()| self.watch(&dir)) {
            tracing::warn!("Monitor did not start: {}", err);
            state.record_error(&err);
        }

        state.set_run_flag(false);
        tracing::info!("Monitor on {} stopped", dir.display());
    }

    /// Ask the loop to exit. Always accepted, even when nothing is running.
    fn stop(&self) -> bool {
        self.state().set_run_flag(false);
        true
    }

    /// Replace the watched path.
    ///
    /// A running loop is only signalled, not waited for; stop it first when
    /// the old watch must be gone before the new path takes effect.
    fn set_directory_path(&self, path: &Path) {
        let state = self.state();
        if state.should_run() {
            tracing::debug!("Directory changed while running, requesting stop");
            state.set_run_flag(false);
        }

        state.set_directory_path(path);
        state.clear_error();

        if !path.as_os_str().is_empty() {
            state.sink().on_snapshot_changed(&self.enumerate_files());
        }
    }

    fn current_directory_path(&self) -> PathBuf {
        self.state().directory_path()
    }

    fn last_error(&self) -> String {
        self.state().last_error()
    }

    fn in_process(&self) -> bool {
        self.state().is_watching()
    }

    fn enumerate_files(&self) -> Vec<FileRecord> {
        snapshot::enumerate_files(self.state().directory_path())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc::Receiver;
    use std::thread;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use crate::{ChangeEvent, ChannelSink, MonitorEvent};

    /// Backend that holds no OS resources and just spins on the run flag.
    struct SpinMonitor {
        state: MonitorState,
    }

    impl SpinMonitor {
        fn new() -> (Self, Receiver<MonitorEvent>) {
            let (sink, rx) = ChannelSink::new();
            let monitor = Self {
                state: MonitorState::new(Arc::new(sink)),
            };
            (monitor, rx)
        }
    }

    impl DirectoryMonitor for SpinMonitor {
        fn state(&self) -> &MonitorState {
            &self.state
        }

        fn backend_name(&self) -> &'static str {
            "spin"
        }

        fn watch(&self, _dir: &Path) -> Result<(), MonitorError> {
            let _active = self.state.enter_loop();
            while self.state.should_run() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        }
    }

    pub(crate) fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_start_on_empty_path_records_error() {
        let (monitor, _rx) = SpinMonitor::new();

        monitor.start();

        assert_eq!(monitor.last_error(), MonitorError::EmptyPath.to_string());
        assert!(!monitor.in_process());
    }

    #[test]
    fn test_start_on_missing_path_returns_immediately() {
        let (monitor, _rx) = SpinMonitor::new();
        let missing = PathBuf::from("/nonexistent/dirmon/path/12345");
        monitor.set_directory_path(&missing);

        let started = Instant::now();
        monitor.start();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(monitor.last_error(), MonitorError::PathNotFound(missing).to_string());
        assert!(!monitor.in_process());
    }

    #[test]
    fn test_stop_without_start_is_accepted() {
        let (monitor, _rx) = SpinMonitor::new();
        assert!(monitor.stop());
        assert!(!monitor.in_process());
        assert!(monitor.last_error().is_empty());
    }

    #[test]
    fn test_stop_ends_running_loop() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (monitor, _rx) = SpinMonitor::new();
        monitor.set_directory_path(temp_dir.path());
        let monitor = Arc::new(monitor);

        let worker = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || monitor.start())
        };

        assert!(wait_until(|| monitor.in_process(), Duration::from_secs(2)));
        assert!(monitor.stop());
        assert!(wait_until(|| !monitor.in_process(), Duration::from_secs(2)));
        worker.join().expect("Watch thread panicked");
    }

    #[test]
    fn test_set_empty_path_emits_no_snapshot() {
        let (monitor, rx) = SpinMonitor::new();
        monitor.set_directory_path(Path::new(""));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_set_path_emits_matching_snapshot() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("one.txt"), "1").expect("Failed to write file");
        fs::write(temp_dir.path().join("two.txt"), "22").expect("Failed to write file");
        fs::create_dir(temp_dir.path().join("dir")).expect("Failed to create dir");

        let (monitor, rx) = SpinMonitor::new();
        monitor.set_directory_path(temp_dir.path());

        match rx.try_recv() {
            Ok(MonitorEvent::Snapshot(files)) => {
                assert_eq!(files.len(), 2);
                assert_eq!(files, monitor.enumerate_files());
            }
            other => panic!("Expected snapshot, got {:?}", other),
        }
        assert_eq!(monitor.current_directory_path(), temp_dir.path());
    }

    #[test]
    fn test_set_path_clears_run_flag_and_error() {
        let (monitor, _rx) = SpinMonitor::new();
        monitor.start();
        assert!(!monitor.last_error().is_empty());

        monitor.state().set_run_flag(true);
        monitor.set_directory_path(Path::new(""));

        assert!(!monitor.state().should_run());
        assert!(monitor.last_error().is_empty());
    }

    #[test]
    fn test_enumerate_missing_path_leaves_error_untouched() {
        let (monitor, _rx) = SpinMonitor::new();
        monitor.set_directory_path(Path::new("/nonexistent/dirmon/path/12345"));

        assert!(monitor.enumerate_files().is_empty());
        assert!(monitor.last_error().is_empty());
    }

    #[test]
    fn test_deliver_handles_overflow_and_watch_lost() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        fs::write(temp_dir.path().join("kept.txt"), "x").expect("Failed to write file");
        let (monitor, rx) = SpinMonitor::new();

        let control = monitor.state().deliver(
            temp_dir.path(),
            vec![
                Notification::Change(ChangeEvent::Added(PathBuf::from("kept.txt"))),
                Notification::Overflow,
                Notification::WatchLost,
                Notification::Change(ChangeEvent::Removed(PathBuf::from("never.txt"))),
            ],
        );

        assert_eq!(control, LoopControl::WatchLost);
        let received: Vec<MonitorEvent> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(
            received[0],
            MonitorEvent::Change(ChangeEvent::Added(PathBuf::from("kept.txt")))
        );
        assert!(matches!(&received[1], MonitorEvent::Snapshot(files) if files.len() == 1));
    }
}

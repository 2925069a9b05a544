//! Thread ownership for a blocking [`DirectoryMonitor`].

use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use crate::config::ControllerConfig;
use crate::DirectoryMonitor;

const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(50);

struct Worker {
    handle: JoinHandle<()>,
    done_rx: Receiver<()>,
}

/// Runs a monitor's blocking `start` on a dedicated thread and owns the stop
/// handshake.
pub struct MonitorController {
    monitor: Arc<dyn DirectoryMonitor>,
    worker: Option<Worker>,
    stop_timeout: Duration,
}

impl MonitorController {
    pub fn new(monitor: Arc<dyn DirectoryMonitor>) -> Self {
        Self {
            monitor,
            worker: None,
            stop_timeout: ControllerConfig::default().stop_timeout(),
        }
    }

    /// How long dropping the controller waits for the watch thread.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn monitor(&self) -> &Arc<dyn DirectoryMonitor> {
        &self.monitor
    }

    /// Whether a watch thread is still alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |worker| !worker.handle.is_finished())
    }

    /// Spawn the watch thread. Does nothing while one is already alive.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            tracing::debug!("Watch thread already running");
            return Ok(());
        }
        self.reap();

        let monitor = Arc::clone(&self.monitor);
        let (done_tx, done_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("dirmon-watch".to_string())
            .spawn(move || {
                monitor.start();
                let _ = done_tx.send(());
            })
            .context("Failed to spawn watch thread")?;

        self.worker = Some(Worker { handle, done_rx });
        Ok(())
    }

    /// Ask the watch loop to exit and wait up to `timeout` for it.
    ///
    /// Returns false when the thread is still running after `timeout`; it is
    /// detached in that case and will exit on its own once its current OS
    /// wait returns.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(worker) = self.worker.take() else {
            self.monitor.stop();
            return true;
        };

        let deadline = Instant::now() + timeout;
        loop {
            // Re-sent every slice: a thread that had not reached `start`
            // yet would otherwise raise the run flag again after us.
            self.monitor.stop();

            let remaining = deadline.saturating_duration_since(Instant::now());
            match worker.done_rx.recv_timeout(remaining.min(STOP_RETRY_INTERVAL)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        tracing::error!("Watch thread panicked");
                    }
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if remaining.is_zero() {
                        tracing::warn!("Watch thread did not stop within {:?}, detaching it", timeout);
                        return false;
                    }
                }
            }
        }
    }

    /// Change the watched directory, restarting the watch thread if it was
    /// running.
    pub fn set_directory_path(&mut self, path: &Path, timeout: Duration) -> Result<()> {
        let was_running = self.is_running();
        if was_running && !self.stop(timeout) {
            anyhow::bail!("Watch thread did not stop within {:?}", timeout);
        }

        self.monitor.set_directory_path(path);

        if was_running {
            self.start()?;
        }
        Ok(())
    }

    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.handle.join().is_err() {
                tracing::error!("Watch thread panicked");
            }
        }
    }
}

impl Drop for MonitorController {
    fn drop(&mut self) {
        self.stop(self.stop_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use crate::monitor::tests::wait_until;
    use crate::monitor::MonitorState;
    use crate::{ChannelSink, LoggingSink, MonitorError, MonitorEvent, NotifyMonitor, WatcherConfig};
    use tempfile::TempDir;

    fn polling_monitor() -> (Arc<dyn DirectoryMonitor>, Receiver<MonitorEvent>) {
        let (sink, rx) = ChannelSink::new();
        let config = WatcherConfig {
            wait_timeout_ms: 20,
            poll_interval_ms: 50,
            ..WatcherConfig::default()
        };
        (Arc::new(NotifyMonitor::polling(&config, Arc::new(sink))), rx)
    }

    #[test]
    fn test_stop_when_never_started() {
        let (monitor, _rx) = polling_monitor();
        let mut controller = MonitorController::new(monitor);
        assert!(!controller.is_running());
        assert!(controller.stop(Duration::from_millis(100)));
    }

    #[test]
    fn test_start_and_stop_round_trip() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (monitor, _rx) = polling_monitor();
        monitor.set_directory_path(temp_dir.path());

        let mut controller = MonitorController::new(Arc::clone(&monitor));
        controller.start().expect("Failed to start controller");
        assert!(wait_until(|| monitor.in_process(), Duration::from_secs(2)));
        assert!(controller.is_running());

        // A second start while running is a no-op.
        controller.start().expect("Failed to start controller");

        assert!(controller.stop(Duration::from_secs(2)));
        assert!(!monitor.in_process());
        assert!(!controller.is_running());
    }

    #[test]
    fn test_failed_start_finishes_thread() {
        let (monitor, _rx) = polling_monitor();
        monitor.set_directory_path(Path::new("/nonexistent/dirmon/12345"));

        let mut controller = MonitorController::new(Arc::clone(&monitor));
        controller.start().expect("Failed to start controller");

        assert!(wait_until(|| !controller.is_running(), Duration::from_secs(2)));
        assert!(monitor.last_error().contains("doesn't exist"));
        assert!(controller.stop(Duration::from_millis(100)));
    }

    #[test]
    fn test_set_directory_path_restarts_on_new_directory() {
        let first = TempDir::new().expect("Failed to create temp dir");
        let second = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(second.path().join("seen.txt"), "x").expect("Failed to write file");

        let (monitor, rx) = polling_monitor();
        monitor.set_directory_path(first.path());
        let mut controller = MonitorController::new(Arc::clone(&monitor));
        controller.start().expect("Failed to start controller");
        assert!(wait_until(|| monitor.in_process(), Duration::from_secs(2)));

        controller
            .set_directory_path(second.path(), Duration::from_secs(2))
            .expect("Failed to switch directory");

        assert_eq!(monitor.current_directory_path(), second.path());
        assert!(controller.is_running());
        assert!(wait_until(|| monitor.in_process(), Duration::from_secs(2)));

        let snapshot = rx
            .try_iter()
            .filter_map(|event| match event {
                MonitorEvent::Snapshot(files) => Some(files),
                _ => None,
            })
            .last()
            .expect("Expected a snapshot for the new directory");
        let names: Vec<PathBuf> = snapshot.into_iter().map(|f| f.relative_path).collect();
        assert_eq!(names, vec![PathBuf::from("seen.txt")]);

        assert!(controller.stop(Duration::from_secs(2)));
    }

    /// Holds its loop for a fixed time no matter what `stop` says.
    struct StubbornMonitor {
        state: MonitorState,
    }

    impl DirectoryMonitor for StubbornMonitor {
        fn state(&self) -> &MonitorState {
            &self.state
        }

        fn backend_name(&self) -> &'static str {
            "stubborn"
        }

        fn watch(&self, _dir: &Path) -> Result<(), MonitorError> {
            let _active = self.state.enter_loop();
            thread::sleep(Duration::from_millis(800));
            Ok(())
        }
    }

    #[test]
    fn test_drop_waits_only_for_configured_timeout() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let monitor: Arc<dyn DirectoryMonitor> = Arc::new(StubbornMonitor {
            state: MonitorState::new(Arc::new(LoggingSink)),
        });
        monitor.set_directory_path(temp_dir.path());

        let mut controller =
            MonitorController::new(Arc::clone(&monitor)).with_stop_timeout(Duration::from_millis(50));
        assert_eq!(controller.stop_timeout(), Duration::from_millis(50));
        controller.start().expect("Failed to start controller");
        assert!(wait_until(|| monitor.in_process(), Duration::from_secs(2)));

        let dropped_at = Instant::now();
        drop(controller);
        assert!(dropped_at.elapsed() < Duration::from_millis(500));

        // The detached thread still finishes on its own.
        assert!(wait_until(|| !monitor.in_process(), Duration::from_secs(2)));
    }

    #[test]
    fn test_default_stop_timeout_matches_config() {
        let (monitor, _rx) = polling_monitor();
        let controller = MonitorController::new(monitor);
        assert_eq!(controller.stop_timeout(), ControllerConfig::default().stop_timeout());
    }
}

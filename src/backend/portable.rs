//! Backend built on the `notify` crate, for platforms without a built-in
//! loop and for polling.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use crate::config::WatcherConfig;
use crate::decode::Notification;
use crate::monitor::{DirectoryMonitor, LoopControl, MonitorState};
use crate::{ChangeEvent, EventSink, MonitorError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    Recommended,
    Polling(Duration),
}

pub struct NotifyMonitor {
    state: MonitorState,
    strategy: Strategy,
    wait_timeout: Duration,
}

impl NotifyMonitor {
    /// Native notifications through `notify::recommended_watcher`.
    pub fn recommended(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: MonitorState::new(sink),
            strategy: Strategy::Recommended,
            wait_timeout: config.wait_timeout(),
        }
    }

    /// Periodic rescans through `notify::PollWatcher`.
    pub fn polling(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: MonitorState::new(sink),
            strategy: Strategy::Polling(config.poll_interval()),
            wait_timeout: config.wait_timeout(),
        }
    }

    fn open_watcher(
        &self,
        dir: &Path,
        tx: mpsc::Sender<notify::Result<Event>>,
    ) -> notify::Result<Box<dyn Watcher>> {
        let mut watcher: Box<dyn Watcher> = match self.strategy {
            Strategy::Recommended => Box::new(notify::recommended_watcher(tx)?),
            Strategy::Polling(interval) => Box::new(PollWatcher::new(
                tx,
                Config::default().with_poll_interval(interval),
            )?),
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}

impl DirectoryMonitor for NotifyMonitor {
    fn state(&self) -> &MonitorState {
        &self.state
    }

    fn backend_name(&self) -> &'static str {
        match self.strategy {
            Strategy::Recommended => "notify",
            Strategy::Polling(_) => "polling",
        }
    }

    fn watch(&self, dir: &Path) -> Result<(), MonitorError> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        // Dropping the watcher at the end of this call releases the watch.
        let _watcher = self
            .open_watcher(dir, tx)
            .map_err(|err| MonitorError::handle(dir, io::Error::new(io::ErrorKind::Other, err)))?;
        let _active = self.state.enter_loop();
        let mut translator = EventTranslator::new(dir);

        while self.state.should_run() {
            match rx.recv_timeout(self.wait_timeout) {
                Ok(Ok(event)) => {
                    // A stop request wins over whatever is queued.
                    if !self.state.should_run() {
                        break;
                    }
                    if self.state.deliver(dir, translator.translate(&event)) == LoopControl::WatchLost {
                        break;
                    }
                }
                Ok(Err(err)) => {
                    tracing::error!("File watcher error: {}", err);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // A quiet wait means no partner is coming for a pending move.
                    self.state.deliver(dir, translator.flush());
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Ok(())
    }
}

/// Turns `notify` events into notifications relative to the watched
/// directory.
///
/// A `RenameMode::From` is held back until the next event: a `RenameMode::To`
/// with the same tracker completes a rename, anything else means the file
/// left the directory.
struct EventTranslator {
    given: PathBuf,
    canonical: Option<PathBuf>,
    departed: Option<Departure>,
}

struct Departure {
    tracker: Option<usize>,
    name: PathBuf,
}

impl EventTranslator {
    fn new(dir: &Path) -> Self {
        Self {
            given: dir.to_path_buf(),
            canonical: dir.canonicalize().ok(),
            departed: None,
        }
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        if let Ok(rel) = path.strip_prefix(&self.given) {
            return Some(rel.to_path_buf());
        }
        self.canonical
            .as_ref()
            .and_then(|root| path.strip_prefix(root).ok())
            .map(Path::to_path_buf)
    }

    /// Report a held-back move source as removed.
    fn flush(&mut self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        self.flush_into(&mut notifications);
        notifications
    }

    fn flush_into(&mut self, notifications: &mut Vec<Notification>) {
        if let Some(departure) = self.departed.take() {
            notifications.push(Notification::Change(ChangeEvent::Removed(departure.name)));
        }
    }

    fn translate(&mut self, event: &Event) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if event.need_rescan() {
            self.flush_into(&mut notifications);
            notifications.push(Notification::Overflow);
            return notifications;
        }

        // Backends that report `Both` also report `From` and `To`.
        if matches!(event.kind, EventKind::Modify(ModifyKind::Name(RenameMode::Both))) {
            return notifications;
        }

        for path in &event.paths {
            let Some(name) = self.relative(path) else {
                continue;
            };

            if name.as_os_str().is_empty() {
                if matches!(event.kind, EventKind::Remove(_)) {
                    self.flush_into(&mut notifications);
                    notifications.push(Notification::WatchLost);
                }
                continue;
            }

            if name.components().count() > 1 {
                continue;
            }

            let change = match event.kind {
                EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                    self.flush_into(&mut notifications);
                    self.departed = Some(Departure {
                        tracker: event.tracker(),
                        name,
                    });
                    continue;
                }
                EventKind::Modify(ModifyKind::Name(RenameMode::To)) => match self.departed.take() {
                    Some(departure) if departure.tracker == event.tracker() => {
                        notifications.push(Notification::Change(ChangeEvent::RenamedFrom(departure.name)));
                        ChangeEvent::RenamedTo(name)
                    }
                    unmatched => {
                        if let Some(departure) = unmatched {
                            notifications.push(Notification::Change(ChangeEvent::Removed(departure.name)));
                        }
                        ChangeEvent::Added(name)
                    }
                },
                EventKind::Access(_) | EventKind::Any | EventKind::Other => continue,
                _ => {
                    self.flush_into(&mut notifications);
                    match event.kind {
                        EventKind::Create(_) => ChangeEvent::Added(name),
                        EventKind::Remove(_) => ChangeEvent::Removed(name),
                        // No direction given, so the two sides cannot be paired.
                        EventKind::Modify(ModifyKind::Name(_)) if path.exists() => ChangeEvent::Added(name),
                        EventKind::Modify(ModifyKind::Name(_)) => ChangeEvent::Removed(name),
                        _ => ChangeEvent::Modified(name),
                    }
                }
            };
            notifications.push(Notification::Change(change));
        }
        notifications
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, Flag, RemoveKind};
    use crate::LoggingSink;

    fn translator() -> EventTranslator {
        EventTranslator {
            given: PathBuf::from("/watched"),
            canonical: None,
            departed: None,
        }
    }

    fn rename(mode: RenameMode, path: &str, tracker: usize) -> Event {
        Event::new(EventKind::Modify(ModifyKind::Name(mode)))
            .add_path(path.into())
            .set_tracker(tracker)
    }

    fn change(event: ChangeEvent) -> Notification {
        Notification::Change(event)
    }

    #[test]
    fn test_translate_basic_kinds() {
        let mut translator = translator();

        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/watched/a.txt".into());
        assert_eq!(
            translator.translate(&created),
            vec![change(ChangeEvent::Added(PathBuf::from("a.txt")))]
        );

        let modified = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path("/watched/a.txt".into());
        assert_eq!(
            translator.translate(&modified),
            vec![change(ChangeEvent::Modified(PathBuf::from("a.txt")))]
        );

        let removed = Event::new(EventKind::Remove(RemoveKind::File)).add_path("/watched/a.txt".into());
        assert_eq!(
            translator.translate(&removed),
            vec![change(ChangeEvent::Removed(PathBuf::from("a.txt")))]
        );
    }

    #[test]
    fn test_matching_trackers_make_a_rename() {
        let mut translator = translator();

        assert!(translator.translate(&rename(RenameMode::From, "/watched/old.txt", 9)).is_empty());
        assert_eq!(
            translator.translate(&rename(RenameMode::To, "/watched/new.txt", 9)),
            vec![
                change(ChangeEvent::RenamedFrom(PathBuf::from("old.txt"))),
                change(ChangeEvent::RenamedTo(PathBuf::from("new.txt"))),
            ]
        );

        let both = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path("/watched/old.txt".into())
            .add_path("/watched/new.txt".into())
            .set_tracker(9);
        assert!(translator.translate(&both).is_empty());
        assert!(translator.flush().is_empty());
    }

    #[test]
    fn test_unrelated_moves_become_removed_and_added() {
        let mut translator = translator();

        assert!(translator.translate(&rename(RenameMode::From, "/watched/leaving.txt", 1)).is_empty());
        assert_eq!(
            translator.translate(&rename(RenameMode::To, "/watched/arriving.txt", 2)),
            vec![
                change(ChangeEvent::Removed(PathBuf::from("leaving.txt"))),
                change(ChangeEvent::Added(PathBuf::from("arriving.txt"))),
            ]
        );
    }

    #[test]
    fn test_pending_move_out_is_flushed() {
        let mut translator = translator();

        assert!(translator.translate(&rename(RenameMode::From, "/watched/gone.txt", 4)).is_empty());
        assert_eq!(
            translator.flush(),
            vec![change(ChangeEvent::Removed(PathBuf::from("gone.txt")))]
        );
        assert!(translator.flush().is_empty());
    }

    #[test]
    fn test_other_event_breaks_pending_move() {
        let mut translator = translator();

        assert!(translator.translate(&rename(RenameMode::From, "/watched/old.txt", 4)).is_empty());
        let created = Event::new(EventKind::Create(CreateKind::File)).add_path("/watched/c.txt".into());
        assert_eq!(
            translator.translate(&created),
            vec![
                change(ChangeEvent::Removed(PathBuf::from("old.txt"))),
                change(ChangeEvent::Added(PathBuf::from("c.txt"))),
            ]
        );
        assert_eq!(
            translator.translate(&rename(RenameMode::To, "/watched/new.txt", 4)),
            vec![change(ChangeEvent::Added(PathBuf::from("new.txt")))]
        );
    }

    #[test]
    fn test_translate_skips_foreign_and_nested_paths() {
        let mut translator = translator();
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path("/elsewhere/a.txt".into())
            .add_path("/watched/sub/deep.txt".into());
        assert!(translator.translate(&event).is_empty());
    }

    #[test]
    fn test_translate_root_removal_and_rescan() {
        let mut translator = translator();

        let gone = Event::new(EventKind::Remove(RemoveKind::Folder)).add_path("/watched".into());
        assert_eq!(translator.translate(&gone), vec![Notification::WatchLost]);

        let rescan = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(translator.translate(&rescan), vec![Notification::Overflow]);
    }

    #[test]
    fn test_backend_names() {
        let config = WatcherConfig::default();
        assert_eq!(NotifyMonitor::recommended(&config, Arc::new(LoggingSink)).backend_name(), "notify");
        assert_eq!(NotifyMonitor::polling(&config, Arc::new(LoggingSink)).backend_name(), "polling");
    }
}

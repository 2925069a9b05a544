//! What monitors report and where it goes.
//!
//! Backends decode OS records into [`ChangeEvent`]s and hand them to an
//! [`EventSink`]. [`ChannelSink`] turns the callbacks back into a stream of
//! [`MonitorEvent`]s for consumers that prefer a receiver.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::SystemTime;
use serde::{Deserialize, Serialize};

/// A structural change inside the watched directory.
///
/// Names are relative to the watched directory. A rename arrives as a
/// `RenamedFrom` immediately followed by a `RenamedTo`, in the order the OS
/// reported them; nothing else ties the two together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ChangeEvent {
    Added(PathBuf),
    Removed(PathBuf),
    Modified(PathBuf),
    RenamedFrom(PathBuf),
    RenamedTo(PathBuf),
}

impl ChangeEvent {
    pub fn name(&self) -> &Path {
        match self {
            ChangeEvent::Added(name)
            | ChangeEvent::Removed(name)
            | ChangeEvent::Modified(name)
            | ChangeEvent::RenamedFrom(name)
            | ChangeEvent::RenamedTo(name) => name,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChangeEvent::Added(_) => "ADDED",
            ChangeEvent::Removed(_) => "REMOVED",
            ChangeEvent::Modified(_) => "MODIFIED",
            ChangeEvent::RenamedFrom(_) => "RENAMED FROM",
            ChangeEvent::RenamedTo(_) => "RENAMED TO",
        }
    }

    /// Route the event to the matching sink callback.
    pub fn dispatch(&self, sink: &dyn EventSink) {
        match self {
            ChangeEvent::Added(name) => sink.on_file_added(name),
            ChangeEvent::Removed(name) => sink.on_file_removed(name),
            ChangeEvent::Modified(name) => sink.on_file_modified(name),
            ChangeEvent::RenamedFrom(name) => sink.on_renamed_from(name),
            ChangeEvent::RenamedTo(name) => sink.on_renamed_to(name),
        }
    }
}

/// One regular file in a directory snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl FileRecord {
    pub fn new(relative_path: PathBuf, modified: SystemTime, size: u64) -> Self {
        Self {
            relative_path,
            modified,
            size,
        }
    }
}

/// Receiver of everything a monitor reports.
///
/// Callbacks run on the watch-loop thread (or on whichever thread changed
/// the directory path, for snapshots), so implementations must be cheap and
/// must not call back into the monitor's `start`.
pub trait EventSink: Send + Sync {
    fn on_file_added(&self, _name: &Path) {}
    fn on_file_removed(&self, _name: &Path) {}
    fn on_file_modified(&self, _name: &Path) {}
    fn on_renamed_from(&self, _old_name: &Path) {}
    fn on_renamed_to(&self, _new_name: &Path) {}
    fn on_snapshot_changed(&self, _files: &[FileRecord]) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorEvent {
    Change(ChangeEvent),
    Snapshot(Vec<FileRecord>),
}

/// Sink that forwards every notification over a std channel.
pub struct ChannelSink {
    tx: Sender<MonitorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<MonitorEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: MonitorEvent) {
        // A dropped receiver just means nobody is listening any more.
        if self.tx.send(event).is_err() {
            tracing::debug!("Monitor event receiver dropped");
        }
    }
}

impl EventSink for ChannelSink {
    fn on_file_added(&self, name: &Path) {
        self.send(MonitorEvent::Change(ChangeEvent::Added(name.to_path_buf())));
    }

    fn on_file_removed(&self, name: &Path) {
        self.send(MonitorEvent::Change(ChangeEvent::Removed(name.to_path_buf())));
    }

    fn on_file_modified(&self, name: &Path) {
        self.send(MonitorEvent::Change(ChangeEvent::Modified(name.to_path_buf())));
    }

    fn on_renamed_from(&self, old_name: &Path) {
        self.send(MonitorEvent::Change(ChangeEvent::RenamedFrom(old_name.to_path_buf())));
    }

    fn on_renamed_to(&self, new_name: &Path) {
        self.send(MonitorEvent::Change(ChangeEvent::RenamedTo(new_name.to_path_buf())));
    }

    fn on_snapshot_changed(&self, files: &[FileRecord]) {
        self.send(MonitorEvent::Snapshot(files.to_vec()));
    }
}

/// Sink that only writes trace output; handy when nothing consumes events.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl EventSink for LoggingSink {
    fn on_file_added(&self, name: &Path) {
        tracing::info!("Added: {}", name.display());
    }

    fn on_file_removed(&self, name: &Path) {
        tracing::info!("Removed: {}", name.display());
    }

    fn on_file_modified(&self, name: &Path) {
        tracing::info!("Modified: {}", name.display());
    }

    fn on_renamed_from(&self, old_name: &Path) {
        tracing::info!("Renamed from: {}", old_name.display());
    }

    fn on_renamed_to(&self, new_name: &Path) {
        tracing::info!("Renamed to: {}", new_name.display());
    }

    fn on_snapshot_changed(&self, files: &[FileRecord]) {
        tracing::info!("Snapshot: {} files", files.len());
    }
}

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Reasons a watch loop refuses to start.
///
/// These are never propagated out of `DirectoryMonitor::start`; the monitor
/// records the rendered message and the caller reads it back through
/// `last_error()`.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Directory name is empty")]
    EmptyPath,
    #[error("Directory doesn't exist: {0}")]
    PathNotFound(PathBuf),
    #[error("Can't make handle for directory {path}: {source}")]
    HandleAcquisitionFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl MonitorError {
    pub fn handle(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::HandleAcquisitionFailed {
            path: path.into(),
            source,
        }
    }
}

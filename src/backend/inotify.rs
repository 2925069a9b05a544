//! Linux backend reading raw inotify records.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use crate::config::{WatcherConfig, MIN_BUFFER_SIZE};
use crate::decode::{InotifyRecords, INOTIFY_WATCH_MASK};
use crate::monitor::{DirectoryMonitor, LoopControl, MonitorState};
use crate::{EventSink, MonitorError};

const IN_ONLYDIR: u32 = 0x0100_0000;

pub struct InotifyMonitor {
    state: MonitorState,
    buffer_size: usize,
    wait_timeout: Duration,
}

impl InotifyMonitor {
    pub fn new(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: MonitorState::new(sink),
            buffer_size: config.buffer_size.max(MIN_BUFFER_SIZE),
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// An inotify descriptor watching one directory. Closing the descriptor
/// drops the watch with it.
struct InotifyWatch {
    fd: OwnedFd,
}

impl InotifyWatch {
    fn open(dir: &Path) -> io::Result<Self> {
        let path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;

        // SAFETY: plain syscall, the result is checked before use.
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: `path` is a valid NUL-terminated string for the call.
        let wd = unsafe {
            libc::inotify_add_watch(fd.as_raw_fd(), path.as_ptr(), INOTIFY_WATCH_MASK | IN_ONLYDIR)
        };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }

    /// Block until records are available or `timeout` passes.
    fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut pollfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        // SAFETY: `pollfd` outlives the call and the count matches.
        let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }
        Ok(ready > 0)
    }

    fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        // SAFETY: the pointer and length describe `buffer` exactly.
        let read = unsafe { libc::read(self.fd.as_raw_fd(), buffer.as_mut_ptr().cast(), buffer.len()) };
        if read < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(0),
                _ => Err(err),
            };
        }
        Ok(read as usize)
    }
}

impl DirectoryMonitor for InotifyMonitor {
    fn state(&self) -> &MonitorState {
        &self.state
    }

    fn backend_name(&self) -> &'static str {
        "inotify"
    }

    fn watch(&self, dir: &Path) -> Result<(), MonitorError> {
        let watch = InotifyWatch::open(dir).map_err(|err| MonitorError::handle(dir, err))?;
        let _active = self.state.enter_loop();
        let mut buffer = vec![0u8; self.buffer_size];

        while self.state.should_run() {
            match watch.wait(self.wait_timeout) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!("Waiting for changes in {} failed: {}", dir.display(), err);
                    break;
                }
            }

            // A stop request wins over whatever is queued.
            if !self.state.should_run() {
                break;
            }

            let filled = match watch.read(&mut buffer) {
                Ok(filled) => filled,
                Err(err) => {
                    tracing::error!("Reading changes in {} failed: {}", dir.display(), err);
                    break;
                }
            };

            if self.state.deliver(dir, InotifyRecords::new(&buffer[..filled])) == LoopControl::WatchLost {
                break;
            }
        }

        Ok(())
    }
}

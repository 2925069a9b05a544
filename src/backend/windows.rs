//! Windows backend driving `ReadDirectoryChangesW` with overlapped I/O.

use std::ffi::c_void;
use std::io;
use std::iter;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED,
    FILE_LIST_DIRECTORY, FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, WaitForSingleObject};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};
use crate::config::{WatcherConfig, MIN_BUFFER_SIZE};
use crate::decode::{Notification, NotifyInformationRecords};
use crate::monitor::{DirectoryMonitor, LoopControl, MonitorState};
use crate::{EventSink, MonitorError};

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_SECURITY
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_FILE_NAME;

pub struct WindowsMonitor {
    state: MonitorState,
    buffer_size: usize,
    wait_timeout: Duration,
}

impl WindowsMonitor {
    pub fn new(config: &WatcherConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state: MonitorState::new(sink),
            buffer_size: config.buffer_size.max(MIN_BUFFER_SIZE),
            wait_timeout: config.wait_timeout(),
        }
    }
}

/// A kernel handle closed on drop.
struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn open_directory(dir: &Path) -> io::Result<Self> {
        let wide: Vec<u16> = dir.as_os_str().encode_wide().chain(iter::once(0)).collect();

        // SAFETY: `wide` is NUL-terminated and outlives the call.
        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }

    fn manual_reset_event() -> io::Result<Self> {
        // SAFETY: anonymous event with default security.
        let handle = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if handle.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }

    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: the handle is owned and closed exactly once.
        unsafe {
            CloseHandle(self.0);
        }
    }
}

enum Wait {
    Completed,
    Stopped,
    Failed(io::Error),
}

impl WindowsMonitor {
    /// Wait for the pending read in slices of `wait_timeout`, re-checking the
    /// run flag between slices.
    fn wait_for_read(&self, event: &OwnedHandle) -> Wait {
        let millis = self.wait_timeout.as_millis().min(u32::MAX as u128) as u32;
        loop {
            // SAFETY: `event` is a live handle.
            match unsafe { WaitForSingleObject(event.raw(), millis) } {
                WAIT_OBJECT_0 => return Wait::Completed,
                WAIT_TIMEOUT => {
                    if !self.state.should_run() {
                        return Wait::Stopped;
                    }
                }
                _ => return Wait::Failed(io::Error::last_os_error()),
            }
        }
    }
}

/// Cancel an in-flight read and wait until the kernel is done with the
/// buffer and the OVERLAPPED block.
fn cancel_pending(directory: &OwnedHandle, overlapped: &OVERLAPPED) {
    let mut transferred = 0u32;
    // SAFETY: both the handle and `overlapped` are still alive; waiting on
    // the result guarantees the kernel no longer touches them afterwards.
    unsafe {
        CancelIoEx(directory.raw(), overlapped);
        GetOverlappedResult(directory.raw(), overlapped, &mut transferred, 1);
    }
}

impl DirectoryMonitor for WindowsMonitor {
    fn state(&self) -> &MonitorState {
        &self.state
    }

    fn backend_name(&self) -> &'static str {
        "ReadDirectoryChangesW"
    }

    fn watch(&self, dir: &Path) -> Result<(), MonitorError> {
        // DWORD-aligned, declared first so it outlives both handles.
        let mut buffer = vec![0u32; self.buffer_size / 4];
        let buffer_bytes = (buffer.len() * 4) as u32;

        let directory = OwnedHandle::open_directory(dir).map_err(|err| MonitorError::handle(dir, err))?;
        let event = OwnedHandle::manual_reset_event().map_err(|err| MonitorError::handle(dir, err))?;
        let _active = self.state.enter_loop();

        while self.state.should_run() {
            // SAFETY: OVERLAPPED is plain data; all-zero is its initial state.
            let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
            overlapped.hEvent = event.raw();

            // SAFETY: `buffer` and `overlapped` stay alive and unmoved until
            // the read completes or is cancelled below.
            let issued = unsafe {
                ReadDirectoryChangesW(
                    directory.raw(),
                    buffer.as_mut_ptr() as *mut c_void,
                    buffer_bytes,
                    0,
                    NOTIFY_FILTER,
                    ptr::null_mut(),
                    &mut overlapped,
                    None,
                )
            };
            if issued == 0 {
                tracing::error!(
                    "Waiting for changes in {} failed: {}",
                    dir.display(),
                    io::Error::last_os_error()
                );
                break;
            }

            match self.wait_for_read(&event) {
                Wait::Completed => {}
                Wait::Stopped => {
                    cancel_pending(&directory, &overlapped);
                    break;
                }
                Wait::Failed(err) => {
                    tracing::error!("Waiting for changes in {} failed: {}", dir.display(), err);
                    cancel_pending(&directory, &overlapped);
                    break;
                }
            }

            let mut filled = 0u32;
            // SAFETY: the read has completed, so this does not block.
            let ok = unsafe { GetOverlappedResult(directory.raw(), &overlapped, &mut filled, 0) };
            if ok == 0 {
                tracing::error!(
                    "Reading changes in {} failed: {}",
                    dir.display(),
                    io::Error::last_os_error()
                );
                break;
            }

            // A stop request wins over whatever is queued.
            if !self.state.should_run() {
                break;
            }

            let control = if filled == 0 {
                // The kernel buffer overflowed and the changes were dropped.
                self.state.deliver(dir, iter::once(Notification::Overflow))
            } else {
                // SAFETY: the kernel wrote `filled` bytes into `buffer`, which
                // is at least that long and no longer shared with the kernel.
                let bytes = unsafe {
                    std::slice::from_raw_parts(buffer.as_ptr() as *const u8, (filled as usize).min(buffer_bytes as usize))
                };
                self.state.deliver(dir, NotifyInformationRecords::new(bytes))
            };

            if control == LoopControl::WatchLost {
                break;
            }
        }

        Ok(())
    }
}

//! Bounds-checked readers for raw change-notification buffers.
//!
//! The kernel fills a fixed-size buffer with variable-length records on each
//! wake-up. Nothing here trusts the lengths and offsets inside those records:
//! every read is checked against the buffer, and a record that does not fit
//! ends (or is skipped by) the walk instead of reading out of range.

use std::path::PathBuf;
use crate::ChangeEvent;

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Change(ChangeEvent),
    /// The OS dropped events; consumers should resynchronise from a snapshot.
    Overflow,
    /// The watched directory itself went away.
    WatchLost,
}

// FILE_NOTIFY_INFORMATION actions.
pub const FILE_ACTION_ADDED: u32 = 0x1;
pub const FILE_ACTION_REMOVED: u32 = 0x2;
pub const FILE_ACTION_MODIFIED: u32 = 0x3;
pub const FILE_ACTION_RENAMED_OLD_NAME: u32 = 0x4;
pub const FILE_ACTION_RENAMED_NEW_NAME: u32 = 0x5;

const NOTIFY_INFORMATION_HEADER: usize = 12;

// inotify event masks.
pub const IN_MODIFY: u32 = 0x0000_0002;
pub const IN_ATTRIB: u32 = 0x0000_0004;
pub const IN_MOVED_FROM: u32 = 0x0000_0040;
pub const IN_MOVED_TO: u32 = 0x0000_0080;
pub const IN_CREATE: u32 = 0x0000_0100;
pub const IN_DELETE: u32 = 0x0000_0200;
pub const IN_DELETE_SELF: u32 = 0x0000_0400;
pub const IN_MOVE_SELF: u32 = 0x0000_0800;
pub const IN_Q_OVERFLOW: u32 = 0x0000_4000;
pub const IN_IGNORED: u32 = 0x0000_8000;

/// Everything a directory watch asks inotify for.
pub const INOTIFY_WATCH_MASK: u32 = IN_CREATE
    | IN_DELETE
    | IN_MODIFY
    | IN_ATTRIB
    | IN_MOVED_FROM
    | IN_MOVED_TO
    | IN_DELETE_SELF
    | IN_MOVE_SELF;

const INOTIFY_HEADER: usize = 16;

/// Walks a `FILE_NOTIFY_INFORMATION` chain (as filled by
/// `ReadDirectoryChangesW`).
///
/// Each record is `next_entry_offset: u32`, `action: u32`,
/// `file_name_length: u32` (bytes), then the UTF-16LE name. An offset of 0
/// ends the chain, as does any offset landing at or past the end of the
/// buffer.
pub struct NotifyInformationRecords<'a> {
    buffer: &'a [u8],
    next: Option<usize>,
}

impl<'a> NotifyInformationRecords<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        let next = if buffer.is_empty() { None } else { Some(0) };
        Self { buffer, next }
    }
}

impl<'a> Iterator for NotifyInformationRecords<'a> {
    type Item = Notification;

    fn next(&mut self) -> Option<Notification> {
        loop {
            let offset = self.next.take()?;

            let next_entry = read_u32_le(self.buffer, offset)?;
            let action = read_u32_le(self.buffer, offset + 4)?;
            let name_len = read_u32_le(self.buffer, offset + 8)? as usize;

            self.next = following_record(offset, next_entry, self.buffer.len());

            let name_start = offset + NOTIFY_INFORMATION_HEADER;
            let name_bytes = name_start
                .checked_add(name_len)
                .and_then(|name_end| self.buffer.get(name_start..name_end));

            let name = match name_bytes {
                Some(bytes) if !bytes.is_empty() && bytes.len() % 2 == 0 => utf16_name(bytes),
                _ => {
                    tracing::warn!(
                        "Skipping notify record at offset {} with name length {}",
                        offset,
                        name_len
                    );
                    continue;
                }
            };

            let event = match action {
                FILE_ACTION_ADDED => ChangeEvent::Added(name),
                FILE_ACTION_REMOVED => ChangeEvent::Removed(name),
                FILE_ACTION_MODIFIED => ChangeEvent::Modified(name),
                FILE_ACTION_RENAMED_OLD_NAME => ChangeEvent::RenamedFrom(name),
                FILE_ACTION_RENAMED_NEW_NAME => ChangeEvent::RenamedTo(name),
                other => {
                    tracing::debug!("Ignoring unknown notify action {}", other);
                    continue;
                }
            };

            return Some(Notification::Change(event));
        }
    }
}

fn following_record(offset: usize, next_entry: u32, buffer_len: usize) -> Option<usize> {
    if next_entry == 0 {
        return None;
    }

    match offset.checked_add(next_entry as usize) {
        Some(target) if target < buffer_len => Some(target),
        _ => {
            tracing::warn!(
                "Notify record at offset {} points past the buffer (next offset {})",
                offset,
                next_entry
            );
            None
        }
    }
}

fn read_u32_le(buffer: &[u8], at: usize) -> Option<u32> {
    let bytes = buffer.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn utf16_name(bytes: &[u8]) -> PathBuf {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStringExt;
        PathBuf::from(std::ffi::OsString::from_wide(&units))
    }

    #[cfg(not(windows))]
    {
        PathBuf::from(String::from_utf16_lossy(&units))
    }
}

/// Walks the `inotify_event` records returned by one `read(2)` on an inotify
/// descriptor.
///
/// Each record is `wd: i32`, `mask: u32`, `cookie: u32`, `len: u32`, then
/// `len` bytes of NUL-padded name. Records are packed back to back.
///
/// An `IN_MOVED_FROM` directly followed by an `IN_MOVED_TO` carrying the same
/// cookie is a rename inside the directory. A move half without its partner
/// crossed the directory boundary and is reported as `Removed` or `Added`.
#[cfg(unix)]
pub struct InotifyRecords<'a> {
    buffer: &'a [u8],
    offset: usize,
    pending: Option<Notification>,
}

#[cfg(unix)]
struct InotifyRecord<'a> {
    mask: u32,
    cookie: u32,
    /// Name with the NUL padding cut off; empty for the directory itself.
    name: &'a [u8],
}

#[cfg(unix)]
impl<'a> InotifyRecords<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            offset: 0,
            pending: None,
        }
    }

    /// The record starting at `offset` and the offset just past it, if the
    /// whole record fits.
    fn record_at(&self, offset: usize) -> Option<(InotifyRecord<'a>, usize)> {
        let buffer: &'a [u8] = self.buffer;
        let header_end = offset.checked_add(INOTIFY_HEADER)?;
        let header = buffer.get(offset..header_end)?;
        let mask = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
        let cookie = u32::from_ne_bytes([header[8], header[9], header[10], header[11]]);
        let len = u32::from_ne_bytes([header[12], header[13], header[14], header[15]]) as usize;

        let name_end = header_end.checked_add(len)?;
        let padded = buffer.get(header_end..name_end)?;
        let name_len = padded.iter().position(|&b| b == 0).unwrap_or(padded.len());

        let record = InotifyRecord {
            mask,
            cookie,
            name: &padded[..name_len],
        };
        Some((record, name_end))
    }

    /// Consume the next record if it is the `IN_MOVED_TO` half of `cookie`.
    fn take_move_partner(&mut self, cookie: u32) -> Option<PathBuf> {
        let (record, after) = self.record_at(self.offset)?;
        if record.mask & IN_MOVED_TO == 0 || record.cookie != cookie || record.name.is_empty() {
            return None;
        }
        self.offset = after;
        Some(inotify_name(record.name))
    }

    fn finish(&mut self) -> Option<Notification> {
        if self.offset < self.buffer.len() {
            tracing::warn!(
                "Truncated inotify record at offset {} of {}",
                self.offset,
                self.buffer.len()
            );
        }
        self.offset = self.buffer.len();
        None
    }
}

#[cfg(unix)]
fn inotify_name(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    PathBuf::from(OsStr::from_bytes(bytes))
}

#[cfg(unix)]
impl<'a> Iterator for InotifyRecords<'a> {
    type Item = Notification;

    fn next(&mut self) -> Option<Notification> {
        if let Some(pending) = self.pending.take() {
            return Some(pending);
        }

        loop {
            let Some((record, after)) = self.record_at(self.offset) else {
                return self.finish();
            };
            self.offset = after;

            if record.mask & IN_Q_OVERFLOW != 0 {
                return Some(Notification::Overflow);
            }
            if record.mask & (IN_DELETE_SELF | IN_MOVE_SELF | IN_IGNORED) != 0 {
                return Some(Notification::WatchLost);
            }
            if record.name.is_empty() {
                // Events about the watched directory itself.
                continue;
            }
            let name = inotify_name(record.name);

            let event = if record.mask & IN_CREATE != 0 {
                ChangeEvent::Added(name)
            } else if record.mask & IN_DELETE != 0 {
                ChangeEvent::Removed(name)
            } else if record.mask & IN_MOVED_FROM != 0 {
                match self.take_move_partner(record.cookie) {
                    Some(new_name) => {
                        self.pending = Some(Notification::Change(ChangeEvent::RenamedTo(new_name)));
                        ChangeEvent::RenamedFrom(name)
                    }
                    None => ChangeEvent::Removed(name),
                }
            } else if record.mask & IN_MOVED_TO != 0 {
                // Paired halves are consumed above, so this one came from outside.
                ChangeEvent::Added(name)
            } else if record.mask & (IN_MODIFY | IN_ATTRIB) != 0 {
                ChangeEvent::Modified(name)
            } else {
                tracing::debug!("Ignoring inotify mask {:#x}", record.mask);
                continue;
            };

            return Some(Notification::Change(event));
        }
    }
}

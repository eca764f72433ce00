//! Stat polling source for hosts without kqueue.
//!
//! Each registered descriptor is re-`fstat`ed on every drain and the
//! difference from the previous stat is turned into the vnode notes kqueue
//! would have raised. Only notes that were registered are reported, and
//! like `EV_CLEAR` a note is reported once per change.

use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use super::{EventSource, WatchToken};
use crate::mask::VnodeFlags;
use crate::sys::{self, FileStat};

#[derive(Debug)]
struct Polled {
    fd: RawFd,
    flags: VnodeFlags,
    last: FileStat,
    location: Option<PathBuf>,
}

/// Interval-driven [`EventSource`]. Drains report in token order.
#[derive(Debug)]
pub struct StatPoller {
    interval: Duration,
    entries: BTreeMap<WatchToken, Polled>,
}

impl StatPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            entries: BTreeMap::new(),
        }
    }
}

/// Where the descriptor currently points, when the platform can tell.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn fd_location(fd: RawFd) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{fd}")).ok()
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn fd_location(_fd: RawFd) -> Option<PathBuf> {
    None
}

fn changes(before: &FileStat, now: &FileStat, moved: bool) -> VnodeFlags {
    let mut out = VnodeFlags::empty();

    if now.nlink == 0 {
        if before.nlink != 0 {
            out |= VnodeFlags::DELETE;
        }
        return out;
    }

    let written = now.mtime != before.mtime || now.size != before.size;
    if written {
        out |= VnodeFlags::WRITE;
    }
    if now.size > before.size {
        out |= VnodeFlags::EXTEND;
    }
    if now.nlink != before.nlink {
        out |= VnodeFlags::LINK;
    }
    if moved {
        out |= VnodeFlags::RENAME;
    }

    // ctime also moves on writes, link changes and renames; only a bare
    // ctime bump counts as an attribute change
    let owner_or_mode =
        now.mode != before.mode || now.uid != before.uid || now.gid != before.gid;
    let bare_ctime = now.ctime != before.ctime && out.is_empty();
    if owner_or_mode || bare_ctime {
        out |= VnodeFlags::ATTRIB;
    }
    out
}

impl EventSource for StatPoller {
    fn register(&mut self, fd: RawFd, token: WatchToken, flags: VnodeFlags) -> io::Result<()> {
        if let Some(entry) = self.entries.get_mut(&token) {
            entry.flags = flags;
            return Ok(());
        }
        let last = sys::fstat_raw(fd)?;
        let location = fd_location(fd);
        self.entries.insert(
            token,
            Polled {
                fd,
                flags,
                last,
                location,
            },
        );
        Ok(())
    }

    fn deregister(&mut self, _fd: RawFd, token: WatchToken) -> io::Result<()> {
        self.entries.remove(&token);
        Ok(())
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.interval)
    }

    fn drain(&mut self, out: &mut Vec<(WatchToken, VnodeFlags)>) -> io::Result<()> {
        let mut dead = Vec::new();
        for (&token, entry) in self.entries.iter_mut() {
            let now = match sys::fstat_raw(entry.fd) {
                Ok(st) => st,
                Err(e) if e.raw_os_error() == Some(libc::EBADF) => {
                    dead.push(token);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut moved = false;
            if entry.flags.contains(VnodeFlags::RENAME) && now.nlink > 0 {
                let location = fd_location(entry.fd);
                moved = location.is_some() && entry.location.is_some() && location != entry.location;
                entry.location = location;
            }

            let seen = changes(&entry.last, &now, moved);
            entry.last = now;
            let reported = seen & entry.flags;
            if !reported.is_empty() {
                trace!(?token, ?reported, "stat change");
                out.push((token, reported));
            }
        }
        for token in dead {
            self.entries.remove(&token);
        }
        Ok(())
    }
}

//! `EVFILT_VNODE` source.

use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tracing::warn;

use super::{EventSource, WatchToken};
use crate::mask::VnodeFlags;
use crate::sys;

const BATCH: usize = 64;

pub struct Kqueue {
    kq: OwnedFd,
    buf: Vec<libc::kevent>,
}

// SAFETY: `udata` only ever carries a token number, never a pointer that is
// dereferenced, so moving the buffer between threads is sound.
unsafe impl Send for Kqueue {}

fn vnode_change(fd: RawFd, action: u32, token: WatchToken, flags: VnodeFlags) -> libc::kevent {
    // SAFETY: kevent is plain old data; every field we rely on is set below.
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = libc::EVFILT_VNODE as _;
    ev.flags = action as _;
    ev.fflags = flags.bits() as _;
    ev.udata = token.0 as usize as _;
    ev
}

impl Kqueue {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: kqueue() returned a fresh descriptor.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        sys::set_cloexec(kq.as_fd(), true)?;
        let mut buf = Vec::with_capacity(BATCH);
        // SAFETY: zeroed kevents are valid placeholders for the kernel to fill.
        buf.resize_with(BATCH, || unsafe { std::mem::zeroed() });
        Ok(Self { kq, buf })
    }

    fn apply(&self, change: &libc::kevent) -> io::Result<()> {
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        loop {
            let ret = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    change,
                    1,
                    std::ptr::null_mut(),
                    0,
                    &timeout,
                )
            };
            if ret != -1 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl EventSource for Kqueue {
    fn register(&mut self, fd: RawFd, token: WatchToken, flags: VnodeFlags) -> io::Result<()> {
        let action = (libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR) as u32;
        self.apply(&vnode_change(fd, action, token, flags))
    }

    fn deregister(&mut self, fd: RawFd, token: WatchToken) -> io::Result<()> {
        self.apply(&vnode_change(fd, libc::EV_DELETE as u32, token, VnodeFlags::empty()))
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.kq.as_raw_fd())
    }

    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    fn drain(&mut self, out: &mut Vec<(WatchToken, VnodeFlags)>) -> io::Result<()> {
        let timeout = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        loop {
            let n = unsafe {
                libc::kevent(
                    self.kq.as_raw_fd(),
                    std::ptr::null(),
                    0,
                    self.buf.as_mut_ptr(),
                    self.buf.len() as _,
                    &timeout,
                )
            };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let n = n as usize;
            for ev in &self.buf[..n] {
                if (ev.flags as u32) & (libc::EV_ERROR as u32) != 0 {
                    warn!(ident = ev.ident as u64, errno = ev.data as i64, "kevent error");
                    continue;
                }
                let token = WatchToken(ev.udata as usize as u64);
                out.push((token, VnodeFlags::from_bits_truncate(ev.fflags as u32)));
            }
            if n < self.buf.len() {
                return Ok(());
            }
        }
    }
}

//! inotify sessions and the process-wide descriptor registry.
//!
//! An [`Inotify`] owns the consumer end of a socket pair; its worker writes
//! `struct inotify_event` records to the other end. The registry functions
//! mirror the C surface: they hand out the consumer descriptor and look the
//! session up by it.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{complete_len, Events};
use crate::kernel::{self, EventSource};
use crate::mask::EventMask;
use crate::sys;
use crate::watch::WatchDescriptor;
use crate::worker::{self, SessionState, WorkerHandle};

bitflags! {
    /// `inotify_init1` flags, Linux values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InitFlags: i32 {
        const NONBLOCK = 0o4000;
        const CLOEXEC  = 0o2000000;
    }
}

pub struct Inotify {
    stream: UnixStream,
    worker: WorkerHandle,
    /// Head of a record that did not fit the caller's last read.
    partial: Mutex<Vec<u8>>,
}

impl Inotify {
    pub fn init() -> Result<Self> {
        Self::init1(InitFlags::empty())
    }

    /// Start a session configured from the environment.
    pub fn init1(flags: InitFlags) -> Result<Self> {
        Self::with_config(flags, Config::load()?)
    }

    pub fn with_config(flags: InitFlags, config: Config) -> Result<Self> {
        let source = kernel::native_source(&config)?;
        Self::with_source(flags, &config, source)
    }

    /// Start a session on an explicit kernel event source.
    pub fn with_source(
        flags: InitFlags,
        config: &Config,
        source: Box<dyn EventSource>,
    ) -> Result<Self> {
        let (stream, control) = UnixStream::pair()?;
        stream.set_nonblocking(flags.contains(InitFlags::NONBLOCK))?;
        sys::set_cloexec(stream.as_fd(), flags.contains(InitFlags::CLOEXEC))?;

        let worker = worker::spawn(config, control, source, stream.as_raw_fd())?;
        debug!(fd = stream.as_raw_fd(), ?flags, "session started");
        Ok(Self {
            stream,
            worker,
            partial: Mutex::new(Vec::new()),
        })
    }

    /// Watch `path`, or change the mask of the watch already on it.
    pub fn add_watch<P: AsRef<Path>>(&self, path: P, mask: EventMask) -> Result<WatchDescriptor> {
        if !mask.intersects(EventMask::ALL_EVENTS) {
            return Err(Error::InvalidArgument(format!(
                "mask {:#x} selects no events",
                mask.bits()
            )));
        }
        self.worker.add_or_modify(path.as_ref(), mask)
    }

    /// Stop watching. `IN_IGNORED` is queued for `wd` before this returns.
    pub fn rm_watch(&self, wd: WatchDescriptor) -> Result<()> {
        self.worker.remove(wd)
    }

    /// Read whole event records into `buf`.
    ///
    /// Blocks unless the session was created with [`InitFlags::NONBLOCK`],
    /// in which case an empty socket gives an `Io` error of kind
    /// `WouldBlock`. A buffer too small for the next record is
    /// `InvalidArgument`; the record stays for a larger read.
    pub fn read_events<'a>(&self, buf: &'a mut [u8]) -> Result<Events<'a>> {
        let mut partial = self
            .partial
            .lock()
            .map_err(|_| Error::ProtocolViolation("read state poisoned".into()))?;

        if partial.len() > buf.len() {
            return Err(Error::InvalidArgument("buffer too small for next event".into()));
        }
        let mut filled = partial.len();
        buf[..filled].copy_from_slice(&partial);
        partial.clear();

        let whole = loop {
            let whole = complete_len(&buf[..filled]);
            if whole > 0 {
                break whole;
            }
            if filled == buf.len() {
                partial.extend_from_slice(&buf[..filled]);
                return Err(Error::InvalidArgument("buffer too small for next event".into()));
            }
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => {
                    partial.extend_from_slice(&buf[..filled]);
                    return Err(Error::AlreadyClosed);
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    partial.extend_from_slice(&buf[..filled]);
                    return Err(Error::Io(e));
                }
            }
        };

        partial.extend_from_slice(&buf[whole..filled]);
        Ok(Events::new(&buf[..whole]))
    }

    pub fn state(&self) -> SessionState {
        self.worker.state()
    }

    /// Tear the session down: every watch is released and the worker
    /// thread has exited when this returns.
    pub fn close(self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        self.worker.begin_close();
        // EOF on the control end stops the worker
        let _ = self.stream.shutdown(Shutdown::Both);
        self.worker.join();
    }
}

impl AsFd for Inotify {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

impl AsRawFd for Inotify {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Drop for Inotify {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ────── descriptor registry ───────────────────────────────────────────────────
static SESSIONS: Lazy<Mutex<HashMap<RawFd, Arc<Inotify>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn sessions() -> Result<std::sync::MutexGuard<'static, HashMap<RawFd, Arc<Inotify>>>> {
    SESSIONS
        .lock()
        .map_err(|_| Error::ProtocolViolation("session registry poisoned".into()))
}

fn lookup(fd: RawFd) -> Result<Arc<Inotify>> {
    sessions()?.get(&fd).cloned().ok_or(Error::AlreadyClosed)
}

/// `inotify_init()`: start a session and return its descriptor.
pub fn init() -> Result<RawFd> {
    init1(InitFlags::empty())
}

pub fn init1(flags: InitFlags) -> Result<RawFd> {
    let session = Inotify::init1(flags)?;
    let fd = session.as_raw_fd();
    sessions()?.insert(fd, Arc::new(session));
    info!(fd, "session registered");
    Ok(fd)
}

pub fn add_watch<P: AsRef<Path>>(fd: RawFd, path: P, mask: EventMask) -> Result<WatchDescriptor> {
    lookup(fd)?.add_watch(path, mask)
}

pub fn rm_watch(fd: RawFd, wd: WatchDescriptor) -> Result<()> {
    lookup(fd)?.rm_watch(wd)
}

pub fn read_events(fd: RawFd, buf: &mut [u8]) -> Result<Events<'_>> {
    lookup(fd)?.read_events(buf)
}

/// Close the session behind `fd`. Unknown descriptors are `AlreadyClosed`.
pub fn close(fd: RawFd) -> Result<()> {
    let session = {
        let mut map = sessions()?;
        let session = map.get(&fd).cloned().ok_or(Error::AlreadyClosed)?;
        // refuse new commands before the entry disappears
        session.worker.begin_close();
        map.remove(&fd);
        session
    };
    session.shutdown();
    info!(fd, "session closed");
    Ok(())
}

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;

use crate::config::Config;
use crate::error::Error;
use crate::event::{Event, Events};
use crate::kernel::{EventSource, Kernel, StatPoller, WatchToken};
use crate::mask::VnodeFlags;
use crate::session::{InitFlags, Inotify};

lazy_static! {
    /// Serializes tests that touch `KQNOTIFY_*` / `RUST_LOG`.
    pub static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
}

/// `(wd, mask bits, cookie, name)` of one record.
pub type Record = (i32, u32, u32, Option<String>);

/// A kernel layer that works on every host.
pub fn poll_kernel() -> Kernel {
    Kernel::new(Box::new(StatPoller::new(Duration::from_millis(5))))
}

/// A non-blocking session on the stat poller with a short rescan period.
pub fn poll_session() -> Inotify {
    let config = Config {
        poll_interval: Duration::from_millis(5),
        ..Config::default()
    };
    let source = Box::new(StatPoller::new(config.poll_interval));
    Inotify::with_source(InitFlags::NONBLOCK, &config, source).unwrap()
}

/// Switches shared with a [`ControlledSource`].
#[derive(Debug, Default)]
pub struct SourceSwitches {
    /// Let the next drain through; that drain clears it.
    pub open: AtomicBool,
    /// Refuse every registration with `EMFILE`.
    pub fail_register: AtomicBool,
}

/// A stat poller the test decides for: it drains only when opened and can
/// refuse registrations. While closed it asks for no timer, so a worker on
/// it sleeps until a command or the control socket wakes it.
pub struct ControlledSource {
    inner: StatPoller,
    switches: Arc<SourceSwitches>,
}

impl ControlledSource {
    pub fn new() -> (Self, Arc<SourceSwitches>) {
        let switches = Arc::new(SourceSwitches::default());
        let source = Self {
            inner: StatPoller::new(Duration::from_millis(5)),
            switches: switches.clone(),
        };
        (source, switches)
    }
}

impl EventSource for ControlledSource {
    fn register(&mut self, fd: RawFd, token: WatchToken, flags: VnodeFlags) -> io::Result<()> {
        if self.switches.fail_register.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        self.inner.register(fd, token, flags)
    }

    fn deregister(&mut self, fd: RawFd, token: WatchToken) -> io::Result<()> {
        self.inner.deregister(fd, token)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        None
    }

    fn poll_interval(&self) -> Option<Duration> {
        if self.switches.open.load(Ordering::SeqCst) {
            self.inner.poll_interval()
        } else {
            None
        }
    }

    fn drain(&mut self, out: &mut Vec<(WatchToken, VnodeFlags)>) -> io::Result<()> {
        if self.switches.open.swap(false, Ordering::SeqCst) {
            self.inner.drain(out)
        } else {
            Ok(())
        }
    }
}

/// Give coarse filesystem timestamps a chance to tick over.
pub fn settle() {
    thread::sleep(Duration::from_millis(30));
}

fn record(e: Event<'_>) -> Record {
    (
        e.wd,
        e.mask.bits(),
        e.cookie,
        e.name.map(|n| n.to_string_lossy().into_owned()),
    )
}

/// Every record in `buf`.
pub fn collect(buf: &[u8]) -> Vec<Record> {
    Events::new(buf).map(record).collect()
}

/// Read from a non-blocking session until `want` records arrived or two
/// seconds passed.
pub fn read_records(session: &Inotify, want: usize) -> Vec<Record> {
    let deadline = Instant::now() + Duration::from_secs(2);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    while out.len() < want && Instant::now() < deadline {
        match session.read_events(&mut buf) {
            Ok(events) => out.extend(events.map(record)),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(5));
            }
            Err(e) => panic!("read failed: {e}"),
        }
    }
    out
}

/// Whatever arrives within `wait`.
pub fn drain_for(session: &Inotify, wait: Duration) -> Vec<Record> {
    thread::sleep(wait);
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match session.read_events(&mut buf) {
            Ok(events) => out.extend(events.map(record)),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => return out,
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

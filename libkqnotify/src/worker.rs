//! Per-session worker thread.
//!
//! The worker owns the kernel event source, the watch table and the outbound
//! queue. Callers reach it only through the command mailbox; the consumer
//! reaches it only through the control socket, whose end-of-file shuts the
//! worker down.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, info_span, trace, warn};

use crate::config::Config;
use crate::dep_list::{diff, DiffHandler, DirEntry, DirListing};
use crate::error::{Error, Result};
use crate::event_queue::EventQueue;
use crate::iwatch::IWatch;
use crate::kernel::{EventSource, Kernel, WatchToken};
use crate::mask::{vnode_to_inotify, EventMask, VnodeFlags, CHILD_EVENTS};
use crate::sys;
use crate::watch::WatchDescriptor;

const CONTROL: Token = Token(0);
const WAKER: Token = Token(1);
const KERNEL: Token = Token(2);

/// How often a waiting caller checks whether the worker is gone.
const REPLY_POLL: Duration = Duration::from_millis(50);

// ────── session state ─────────────────────────────────────────────────────────
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

pub(crate) enum Command {
    AddOrModify {
        path: PathBuf,
        mask: EventMask,
        reply: Sender<Result<WatchDescriptor>>,
    },
    Remove {
        wd: WatchDescriptor,
        reply: Sender<Result<()>>,
    },
}

impl Command {
    fn refuse(self) {
        match self {
            Command::AddOrModify { reply, .. } => {
                let _ = reply.send(Err(Error::AlreadyClosed));
            }
            Command::Remove { reply, .. } => {
                let _ = reply.send(Err(Error::AlreadyClosed));
            }
        }
    }
}

// ────── caller side ───────────────────────────────────────────────────────────
/// The caller's end of a worker: mailbox, waker and shared state.
pub struct WorkerHandle {
    commands: Sender<Command>,
    waker: Arc<Waker>,
    state: Arc<Mutex<SessionState>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    pub fn add_or_modify(&self, path: &Path, mask: EventMask) -> Result<WatchDescriptor> {
        self.submit(|reply| Command::AddOrModify {
            path: path.to_path_buf(),
            mask,
            reply,
        })
    }

    pub fn remove(&self, wd: WatchDescriptor) -> Result<()> {
        self.submit(|reply| Command::Remove { wd, reply })
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|g| *g)
            .unwrap_or(SessionState::Closed)
    }

    /// Refuse new commands from now on. Commands already submitted still
    /// get their reply.
    pub fn begin_close(&self) {
        if let Ok(mut g) = self.state.lock() {
            if *g == SessionState::Active {
                *g = SessionState::Closing;
            }
        }
    }

    /// Block until the worker thread is gone.
    pub fn join(&self) {
        let handle = match self.thread.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = handle {
            if h.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// Hand a command to the worker and wait for its reply.
    fn submit<T>(&self, make: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        {
            let st = self
                .state
                .lock()
                .map_err(|_| Error::ProtocolViolation("session state poisoned".into()))?;
            if *st != SessionState::Active {
                return Err(Error::AlreadyClosed);
            }
        }

        let (tx, rx) = bounded(1);
        self.commands
            .send(make(tx))
            .map_err(|_| Error::AlreadyClosed)?;
        if let Err(e) = self.waker.wake() {
            // the worker is going away; its final drain answers us
            debug!(error = %e, "wake failed");
        }
        loop {
            match rx.recv_timeout(REPLY_POLL) {
                Ok(res) => return res,
                Err(RecvTimeoutError::Disconnected) => return Err(Error::AlreadyClosed),
                // a command that slipped in after the final drain gets no reply
                Err(RecvTimeoutError::Timeout) if self.state() == SessionState::Closed => {
                    return rx.try_recv().unwrap_or(Err(Error::AlreadyClosed));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }
}

/// Start a worker serving `control` with events from `source`.
pub(crate) fn spawn(
    config: &Config,
    control: UnixStream,
    source: Box<dyn EventSource>,
    session: RawFd,
) -> Result<WorkerHandle> {
    let (tx, rx) = bounded(config.command_queue_depth);
    let state = Arc::new(Mutex::new(SessionState::Active));
    let (mut worker, waker) = Worker::new(config, control, source, rx, state.clone())?;

    let thread = thread::Builder::new()
        .name(format!("kqnotify-{session}"))
        .spawn(move || {
            let span = info_span!("worker", session);
            let _enter = span.enter();
            worker.run();
        })?;

    Ok(WorkerHandle {
        commands: tx,
        waker,
        state,
        thread: Mutex::new(Some(thread)),
    })
}

// ────── worker side ───────────────────────────────────────────────────────────
struct Worker {
    poll: Poll,
    control: UnixStream,
    kernel: Kernel,
    commands: Receiver<Command>,
    state: Arc<Mutex<SessionState>>,
    watches: BTreeMap<WatchDescriptor, IWatch>,
    queue: EventQueue,
    next_wd: WatchDescriptor,
    next_cookie: u32,
    last_scan: Instant,
    /// The consumer is gone or the socket broke.
    hangup: bool,
}

impl Worker {
    fn new(
        config: &Config,
        control: UnixStream,
        source: Box<dyn EventSource>,
        commands: Receiver<Command>,
        state: Arc<Mutex<SessionState>>,
    ) -> Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        control.set_nonblocking(true)?;
        poll.registry().register(
            &mut SourceFd(&control.as_raw_fd()),
            CONTROL,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let kernel = Kernel::new(source);
        if let Some(kq) = kernel.raw_fd() {
            poll.registry()
                .register(&mut SourceFd(&kq), KERNEL, Interest::READABLE)?;
        }

        let worker = Worker {
            poll,
            control,
            kernel,
            commands,
            state,
            watches: BTreeMap::new(),
            queue: EventQueue::new(config.max_queued_events),
            next_wd: 1,
            next_cookie: 0,
            last_scan: Instant::now(),
            hangup: false,
        };
        Ok((worker, waker))
    }

    fn run(&mut self) {
        debug!("worker running");
        let mut events = Events::with_capacity(64);

        while !self.hangup {
            let timeout = self.timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poll failed");
                break;
            }

            let mut kernel_ready = false;
            for ev in events.iter() {
                match ev.token() {
                    CONTROL => {
                        if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
                            self.hangup |= self.control_hung_up();
                        }
                        // the consumer made room for queued records
                        if ev.is_writable() && !self.hangup {
                            self.flush();
                        }
                    }
                    WAKER => self.process_commands(),
                    KERNEL => kernel_ready = true,
                    _ => {}
                }
            }
            if self.hangup {
                break;
            }

            let scan_due = self
                .kernel
                .poll_interval()
                .is_some_and(|iv| self.last_scan.elapsed() >= iv);
            if kernel_ready || scan_due {
                self.last_scan = Instant::now();
                if let Err(e) = self.process_kernel_events() {
                    error!(error = %e, "kernel event source failed");
                    break;
                }
            }

            self.reap_closed();
            self.flush();
        }

        self.shutdown();
    }

    /// Time until the next rescan, if the source needs one. Records that
    /// did not fit wait for writable readiness on the control socket.
    fn timeout(&self) -> Option<Duration> {
        self.kernel
            .poll_interval()
            .map(|iv| iv.saturating_sub(self.last_scan.elapsed()))
    }

    /// Read and discard whatever the consumer sent; `true` on EOF.
    fn control_hung_up(&mut self) -> bool {
        let mut buf = [0u8; 64];
        loop {
            match (&self.control).read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "control socket failed");
                    return true;
                }
            }
        }
    }

    fn flush(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let capacity = match sys::send_space(self.control.as_fd()) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "send space unknown");
                return;
            }
        };
        let mut out = &self.control;
        match self.queue.flush(&mut out, capacity) {
            Ok(n) => trace!(bytes = n, "flush"),
            Err(e) => {
                debug!(error = %e, "consumer gone");
                self.hangup = true;
            }
        }
    }

    // ── commands ──────────────────────────────────────────────────────────
    fn process_commands(&mut self) {
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                Command::AddOrModify { path, mask, reply } => {
                    let res = self.add_or_modify(&path, mask);
                    if let Err(e) = &res {
                        debug!(path = %path.display(), error = %e, "add_watch failed");
                    }
                    let _ = reply.send(res);
                }
                Command::Remove { wd, reply } => {
                    let res = self.remove(wd);
                    let _ = reply.send(res);
                }
            }
        }
    }

    fn add_or_modify(&mut self, path: &Path, mask: EventMask) -> Result<WatchDescriptor> {
        let follow = !mask.contains(EventMask::DONT_FOLLOW);
        let fd = sys::open_watch(None, path.as_os_str(), follow)
            .map_err(|e| Error::from_io(e, path.display()))?;
        let st = sys::fstat(fd.as_fd())?;
        if mask.contains(EventMask::ONLYDIR) && !st.is_dir() {
            return Err(Error::NotADirectory(path.display().to_string()));
        }

        let existing = self
            .watches
            .values_mut()
            .find(|iw| !iw.is_closed() && iw.identity() == (st.dev, st.ino));
        if let Some(iw) = existing {
            let flags = if mask.contains(EventMask::MASK_ADD) {
                iw.flags() | mask
            } else {
                mask
            };
            iw.update_flags(&mut self.kernel, flags.difference(EventMask::MASK_ADD))?;
            debug!(wd = iw.wd(), flags = ?iw.flags(), "watch modified");
            return Ok(iw.wd());
        }

        let wd = self.next_wd;
        let iw = IWatch::open(
            &mut self.kernel,
            wd,
            path.as_os_str(),
            fd,
            &st,
            mask.difference(EventMask::MASK_ADD),
        )?;
        self.next_wd += 1;
        self.watches.insert(wd, iw);
        info!(wd, path = %path.display(), "watch added");
        Ok(wd)
    }

    fn remove(&mut self, wd: WatchDescriptor) -> Result<()> {
        let iw = self
            .watches
            .remove(&wd)
            .ok_or_else(|| Error::NotFound(format!("watch descriptor {wd}")))?;
        self.queue.enqueue(wd, EventMask::IGNORED, 0, None);
        self.flush();
        iw.release(&mut self.kernel);
        info!(wd, "watch removed");
        Ok(())
    }

    // ── kernel events ─────────────────────────────────────────────────────
    fn process_kernel_events(&mut self) -> io::Result<()> {
        for (token, wd, flags) in self.kernel.drain()? {
            self.handle_vnode(token, wd, flags);
        }
        Ok(())
    }

    fn handle_vnode(&mut self, token: WatchToken, wd: WatchDescriptor, flags: VnodeFlags) {
        let Some(iw) = self.watches.get_mut(&wd) else {
            return;
        };
        if iw.is_closed() {
            return;
        }
        let Some(w) = iw.watch_for(token) else {
            return;
        };
        trace!(wd, ?token, ?flags, "vnode event");

        let is_dir = w.is_dir();
        if w.is_sub() {
            let name = w.name().to_os_string();
            let raw = vnode_to_inotify(flags, is_dir, true);
            if let Some(mask) = iw.admit(raw, is_dir) {
                self.queue.enqueue(wd, mask, 0, Some(&name));
            }
            return;
        }

        let structural = flags.intersects(VnodeFlags::WRITE | VnodeFlags::EXTEND | VnodeFlags::LINK);
        if is_dir && structural && iw.flags().intersects(CHILD_EVENTS) {
            scan_directory(iw, &mut self.kernel, &mut self.queue, &mut self.next_cookie);
        }

        let mut raw = vnode_to_inotify(flags, is_dir, false);
        let mut gone = false;
        if flags.contains(VnodeFlags::DELETE) {
            match sys::fstat(iw.primary().as_fd()) {
                Ok(st) if st.nlink > 0 => raw |= EventMask::ATTRIB,
                _ => {
                    raw |= EventMask::DELETE_SELF;
                    gone = true;
                }
            }
        }
        if let Some(mask) = iw.admit(raw, is_dir) {
            self.queue.enqueue(wd, mask, 0, None);
        }
        if flags.contains(VnodeFlags::REVOKE) {
            self.queue.enqueue(wd, EventMask::UNMOUNT, 0, None);
            gone = true;
        }
        if gone {
            self.queue.enqueue(wd, EventMask::IGNORED, 0, None);
            iw.mark_closed();
            debug!(wd, "watched object gone");
        }
    }

    fn reap_closed(&mut self) {
        let closed: Vec<WatchDescriptor> = self
            .watches
            .iter()
            .filter(|(_, iw)| iw.is_closed())
            .map(|(wd, _)| *wd)
            .collect();
        for wd in closed {
            if let Some(iw) = self.watches.remove(&wd) {
                iw.release(&mut self.kernel);
            }
        }
    }

    fn set_state(&self, next: SessionState) {
        match self.state.lock() {
            Ok(mut g) => *g = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn shutdown(&mut self) {
        self.set_state(SessionState::Closing);
        for cmd in self.commands.try_iter() {
            cmd.refuse();
        }
        for (_, iw) in std::mem::take(&mut self.watches) {
            iw.release(&mut self.kernel);
        }
        self.set_state(SessionState::Closed);
        debug!("worker stopped");
    }
}

// ────── directory scans ───────────────────────────────────────────────────────
fn next_cookie(counter: &mut u32) -> u32 {
    *counter = counter.wrapping_add(1);
    if *counter == 0 {
        *counter = 1;
    }
    *counter
}

/// Re-list a watched directory and report what changed since the last
/// listing. A failed listing keeps the old one for the next attempt.
fn scan_directory(
    iw: &mut IWatch,
    kernel: &mut Kernel,
    queue: &mut EventQueue,
    cookies: &mut u32,
) {
    let Some(before) = iw.primary_mut().take_deps() else {
        return;
    };
    match DirListing::read(iw.primary().as_fd()) {
        Ok(mut after) => {
            let mut scan = ScanEvents {
                iw: &mut *iw,
                kernel,
                queue,
                cookies,
            };
            let renamed = diff(&before, &mut after, &mut scan);
            trace!(wd = iw.wd(), renamed, entries = after.len(), "directory rescanned");
            iw.primary_mut().set_deps(after);
        }
        Err(e) => {
            warn!(wd = iw.wd(), error = %e, "listing failed, keeping previous");
            iw.primary_mut().set_deps(before);
        }
    }
}

/// Applies diff results to the sub-watches and queues the matching events.
struct ScanEvents<'a> {
    iw: &'a mut IWatch,
    kernel: &'a mut Kernel,
    queue: &'a mut EventQueue,
    cookies: &'a mut u32,
}

impl ScanEvents<'_> {
    fn emit(&mut self, raw: EventMask, is_dir: bool, cookie: u32, name: &OsStr) {
        if let Some(mask) = self.iw.admit(raw, is_dir) {
            self.queue.enqueue(self.iw.wd(), mask, cookie, Some(name));
        }
    }
}

impl DiffHandler for ScanEvents<'_> {
    fn moved(&mut self, from: &DirEntry, to: &DirEntry) {
        let is_dir = self.iw.subwatch_is_dir(from);
        let cookie = next_cookie(self.cookies);
        self.emit(EventMask::MOVED_FROM, is_dir, cookie, from.name());
        self.emit(EventMask::MOVED_TO, is_dir, cookie, to.name());
        self.iw.rename_subwatch(from, to);
    }

    fn replaced(&mut self, victim: &DirEntry) {
        self.iw.del_subwatch(self.kernel, victim);
    }

    fn overwritten(&mut self, old: &DirEntry, new: &DirEntry) {
        let was_dir = self.iw.subwatch_is_dir(old);
        if let Err(e) = self.iw.reopen_subwatch(self.kernel, old, new) {
            debug!(name = ?new.name(), error = %e, "overwritten entry vanished");
        }
        let is_dir = self.iw.subwatch_is_dir(new);
        self.emit(EventMask::DELETE, was_dir, 0, old.name());
        self.emit(EventMask::CREATE, is_dir, 0, new.name());
    }

    fn removed(&mut self, entry: &DirEntry) {
        let is_dir = self.iw.subwatch_is_dir(entry);
        self.emit(EventMask::DELETE, is_dir, 0, entry.name());
        self.iw.del_subwatch(self.kernel, entry);
    }

    fn added(&mut self, entry: &DirEntry) {
        self.iw.add_subwatch(self.kernel, entry);
        let is_dir = self.iw.subwatch_is_dir(entry);
        self.emit(EventMask::CREATE, is_dir, 0, entry.name());
    }
}

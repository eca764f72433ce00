//! Kernel event source and token routing.
//!
//! Every kernel registration gets a [`WatchToken`] that is never reused
//! within a session, so a late event for a released watch cannot be routed
//! to its successor. The [`Kernel`] maps tokens to the watch descriptor of
//! the owning user watch; the owning [`crate::iwatch::IWatch`] maps the token
//! to the exact primary or sub-watch.

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
mod poll;

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub use kqueue::Kqueue;
pub use poll::StatPoller;

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mask::VnodeFlags;
use crate::watch::WatchDescriptor;

/// Opaque kernel user-data attached to one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchToken(pub(crate) u64);

/// A per-descriptor vnode event facility.
///
/// `register` on a descriptor that is already registered replaces its flags.
pub trait EventSource: Send {
    fn register(&mut self, fd: RawFd, token: WatchToken, flags: VnodeFlags) -> io::Result<()>;

    fn deregister(&mut self, fd: RawFd, token: WatchToken) -> io::Result<()>;

    /// Descriptor that turns readable when events are pending, if any.
    fn raw_fd(&self) -> Option<RawFd>;

    /// How often [`EventSource::drain`] must be called when there is no
    /// descriptor to wait on.
    fn poll_interval(&self) -> Option<Duration>;

    /// Append every pending `(token, flags)` pair to `out` without blocking.
    fn drain(&mut self, out: &mut Vec<(WatchToken, VnodeFlags)>) -> io::Result<()>;
}

/// The platform's native source: kqueue where it exists, stat polling
/// elsewhere.
pub fn native_source(config: &Config) -> io::Result<Box<dyn EventSource>> {
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    {
        let _ = config;
        Ok(Box::new(Kqueue::new()?))
    }
    #[cfg(not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    )))]
    {
        Ok(Box::new(StatPoller::new(config.poll_interval)))
    }
}

pub struct Kernel {
    source: Box<dyn EventSource>,
    routes: HashMap<WatchToken, WatchDescriptor>,
    next_token: u64,
}

impl Kernel {
    pub fn new(source: Box<dyn EventSource>) -> Self {
        Self {
            source,
            routes: HashMap::new(),
            next_token: 1,
        }
    }

    /// Register `fd` on behalf of watch `wd` and return its fresh token.
    pub fn register(
        &mut self,
        fd: BorrowedFd<'_>,
        wd: WatchDescriptor,
        flags: VnodeFlags,
    ) -> Result<WatchToken> {
        let token = WatchToken(self.next_token);
        self.next_token += 1;
        self.source
            .register(fd.as_raw_fd(), token, flags)
            .map_err(|e| Error::from_io(e, "kernel registration"))?;
        self.routes.insert(token, wd);
        Ok(token)
    }

    /// Change the flags of an existing registration.
    pub fn rearm(&mut self, fd: BorrowedFd<'_>, token: WatchToken, flags: VnodeFlags) -> Result<()> {
        self.source
            .register(fd.as_raw_fd(), token, flags)
            .map_err(|e| Error::from_io(e, "kernel re-registration"))
    }

    /// Forget a registration. Must run before `fd` is closed.
    pub fn deregister(&mut self, fd: BorrowedFd<'_>, token: WatchToken) {
        self.routes.remove(&token);
        if let Err(e) = self.source.deregister(fd.as_raw_fd(), token) {
            // the descriptor may already be gone with its vnode
            debug!(?token, error = %e, "deregister failed");
        }
    }

    pub fn route(&self, token: WatchToken) -> Option<WatchDescriptor> {
        self.routes.get(&token).copied()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.source.raw_fd()
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.source.poll_interval()
    }

    /// Pending events whose token still routes to a live watch.
    pub fn drain(&mut self) -> io::Result<Vec<(WatchToken, WatchDescriptor, VnodeFlags)>> {
        let mut raw = Vec::new();
        self.source.drain(&mut raw)?;
        let mut out = Vec::with_capacity(raw.len());
        for (token, flags) in raw {
            match self.routes.get(&token) {
                Some(&wd) => out.push((token, wd, flags)),
                None => debug!(?token, ?flags, "event for released watch dropped"),
            }
        }
        Ok(out)
    }

    pub fn registrations(&self) -> usize {
        self.routes.len()
    }
}

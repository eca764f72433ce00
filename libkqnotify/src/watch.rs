//! One kernel registration on one open file.

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use crate::dep_list::{DirEntry, DirListing};
use crate::error::{Error, Result};
use crate::kernel::{Kernel, WatchToken};
use crate::mask::{inotify_to_vnode, EventMask, VnodeFlags};
use crate::sys::{self, FileStat};

/// Caller-visible watch identifier, allocated from 1 per session.
pub type WatchDescriptor = i32;

#[derive(Debug)]
pub enum WatchKind {
    /// Requested by the caller. Directories carry their last listing.
    User { deps: Option<DirListing> },
    /// Opened by the engine on one entry of the parent's directory.
    Sub { parent: WatchDescriptor },
}

#[derive(Debug)]
pub struct Watch {
    kind: WatchKind,
    /// Path for user watches, entry name for sub-watches.
    name: OsString,
    fd: OwnedFd,
    token: WatchToken,
    dev: u64,
    inode: u64,
    is_dir: bool,
    fflags: VnodeFlags,
}

impl Watch {
    /// Wrap an already opened user path and register it.
    pub(crate) fn user(
        kernel: &mut Kernel,
        wd: WatchDescriptor,
        path: &OsStr,
        fd: OwnedFd,
        st: &FileStat,
        mask: EventMask,
    ) -> Result<Self> {
        let deps = if st.is_dir() {
            Some(DirListing::read_initial(fd.as_fd(), path.to_string_lossy())?)
        } else {
            None
        };
        Self::register(kernel, WatchKind::User { deps }, wd, path.to_os_string(), fd, st, mask)
    }

    /// Open `entry` inside the directory `dir` and register it for `parent`.
    pub(crate) fn sub(
        kernel: &mut Kernel,
        parent: WatchDescriptor,
        dir: BorrowedFd<'_>,
        entry: &DirEntry,
        mask: EventMask,
    ) -> Result<Self> {
        let fd = sys::open_watch(Some(dir), entry.name(), false)
            .map_err(|e| Error::from_io(e, entry.name().to_string_lossy()))?;
        let st = sys::fstat(fd.as_fd())?;
        Self::register(
            kernel,
            WatchKind::Sub { parent },
            parent,
            entry.name().to_os_string(),
            fd,
            &st,
            mask,
        )
    }

    fn register(
        kernel: &mut Kernel,
        kind: WatchKind,
        wd: WatchDescriptor,
        name: OsString,
        fd: OwnedFd,
        st: &FileStat,
        mask: EventMask,
    ) -> Result<Self> {
        let is_sub = matches!(kind, WatchKind::Sub { .. });
        let fflags = inotify_to_vnode(mask, st.is_dir(), is_sub);
        let token = kernel.register(fd.as_fd(), wd, fflags)?;
        Ok(Self {
            kind,
            name,
            fd,
            token,
            dev: st.dev,
            inode: st.ino,
            is_dir: st.is_dir(),
            fflags,
        })
    }

    /// Re-register with the kernel notes matching `mask`.
    pub(crate) fn rearm(&mut self, kernel: &mut Kernel, mask: EventMask) -> Result<()> {
        let fflags = inotify_to_vnode(mask, self.is_dir, self.is_sub());
        if fflags != self.fflags {
            kernel.rearm(self.fd.as_fd(), self.token, fflags)?;
            self.fflags = fflags;
        }
        Ok(())
    }

    /// Deregister and close.
    pub(crate) fn release(self, kernel: &mut Kernel) {
        kernel.deregister(self.fd.as_fd(), self.token);
    }

    pub fn kind(&self) -> &WatchKind {
        &self.kind
    }

    pub fn is_sub(&self) -> bool {
        matches!(self.kind, WatchKind::Sub { .. })
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &OsStr) {
        self.name = name.to_os_string();
    }

    pub fn token(&self) -> WatchToken {
        self.token
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn fflags(&self) -> VnodeFlags {
        self.fflags
    }

    pub(crate) fn take_deps(&mut self) -> Option<DirListing> {
        match &mut self.kind {
            WatchKind::User { deps } => deps.take(),
            WatchKind::Sub { .. } => None,
        }
    }

    pub(crate) fn set_deps(&mut self, listing: DirListing) {
        if let WatchKind::User { deps } = &mut self.kind {
            *deps = Some(listing);
        }
    }

    pub(crate) fn matches(&self, entry: &DirEntry) -> bool {
        self.inode == entry.inode() && self.name.as_os_str() == entry.name()
    }
}

impl AsFd for Watch {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

//! The caller-visible watch: one primary watch plus, for directories, one
//! sub-watch per entry.

use std::ffi::OsStr;
use std::os::fd::{AsFd, OwnedFd};

use tracing::{debug, warn};

use crate::dep_list::{diff, DiffHandler, DirEntry, DirListing};
use crate::error::Result;
use crate::kernel::{Kernel, WatchToken};
use crate::mask::{EventMask, CHILD_EVENTS};
use crate::sys::FileStat;
use crate::watch::{Watch, WatchDescriptor};
use crate::watch_set::WatchSet;

#[derive(Debug)]
pub struct IWatch {
    wd: WatchDescriptor,
    flags: EventMask,
    primary: Watch,
    subs: WatchSet,
    is_closed: bool,
    oneshot_fired: bool,
}

impl IWatch {
    /// Register `fd` (already opened on `path`) and, for a directory, one
    /// sub-watch per entry. Entries that cannot be opened are skipped.
    pub(crate) fn open(
        kernel: &mut Kernel,
        wd: WatchDescriptor,
        path: &OsStr,
        fd: OwnedFd,
        st: &FileStat,
        mask: EventMask,
    ) -> Result<Self> {
        let primary = Watch::user(kernel, wd, path, fd, st, mask)?;
        let mut iw = Self {
            wd,
            flags: mask,
            primary,
            subs: WatchSet::new(),
            is_closed: false,
            oneshot_fired: false,
        };
        if let Some(deps) = iw.primary.take_deps() {
            for entry in &deps {
                iw.add_subwatch(kernel, entry);
            }
            iw.primary.set_deps(deps);
        }
        debug!(wd, path = ?path, subs = iw.subs.len(), "watch opened");
        Ok(iw)
    }

    pub fn wd(&self) -> WatchDescriptor {
        self.wd
    }

    pub fn flags(&self) -> EventMask {
        self.flags
    }

    pub fn primary(&self) -> &Watch {
        &self.primary
    }

    pub(crate) fn primary_mut(&mut self) -> &mut Watch {
        &mut self.primary
    }

    pub fn subs(&self) -> &WatchSet {
        &self.subs
    }

    pub fn is_dir(&self) -> bool {
        self.primary.is_dir()
    }

    /// `(dev, inode)` of the watched object.
    pub fn identity(&self) -> (u64, u64) {
        (self.primary.dev(), self.primary.inode())
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed
    }

    pub(crate) fn mark_closed(&mut self) {
        self.is_closed = true;
    }

    /// The primary watch or the sub-watch registered under `token`.
    pub fn watch_for(&self, token: WatchToken) -> Option<&Watch> {
        if self.primary.token() == token {
            Some(&self.primary)
        } else {
            self.subs.get(token)
        }
    }

    pub(crate) fn add_subwatch(&mut self, kernel: &mut Kernel, entry: &DirEntry) -> Option<&Watch> {
        match Watch::sub(kernel, self.wd, self.primary.as_fd(), entry, self.flags) {
            Ok(w) => Some(self.subs.insert(w)),
            Err(e) => {
                warn!(wd = self.wd, name = ?entry.name(), error = %e, "sub-watch skipped");
                None
            }
        }
    }

    pub(crate) fn del_subwatch(&mut self, kernel: &mut Kernel, entry: &DirEntry) {
        if let Some(w) = self.subs.remove(entry) {
            w.release(kernel);
        }
    }

    /// Only the cached name changes; descriptor and inode stay.
    pub(crate) fn rename_subwatch(&mut self, from: &DirEntry, to: &DirEntry) {
        if let Some(w) = self.subs.find_mut(from) {
            w.set_name(to.name());
        }
    }

    /// Point the sub-watch for `old` at the file now called `new`. On
    /// failure the sub-watch is gone.
    pub(crate) fn reopen_subwatch(
        &mut self,
        kernel: &mut Kernel,
        old: &DirEntry,
        new: &DirEntry,
    ) -> Result<()> {
        self.del_subwatch(kernel, old);
        let w = Watch::sub(kernel, self.wd, self.primary.as_fd(), new, self.flags)?;
        self.subs.insert(w);
        Ok(())
    }

    /// Whether `entry` was a directory when last seen.
    pub fn subwatch_is_dir(&self, entry: &DirEntry) -> bool {
        self.subs.find(entry).map_or(entry.is_dir(), Watch::is_dir)
    }

    /// Replace the mask and re-register every watch with it. A one-shot
    /// watch that already fired is armed again.
    pub(crate) fn update_flags(&mut self, kernel: &mut Kernel, mask: EventMask) -> Result<()> {
        let gained_children = self.is_dir()
            && !self.flags.intersects(CHILD_EVENTS)
            && mask.intersects(CHILD_EVENTS);

        // a refused registration leaves the watch as it was
        self.primary.rearm(kernel, mask)?;
        self.flags = mask;
        self.oneshot_fired = false;
        for w in self.subs.iter_mut() {
            if let Err(e) = w.rearm(kernel, mask) {
                warn!(wd = self.wd, name = ?w.name(), error = %e, "sub-watch rearm failed");
            }
        }

        // the listing went stale while nobody asked for child events
        if gained_children {
            self.resync(kernel);
        }
        Ok(())
    }

    /// Bring listing and sub-watches up to date without reporting anything.
    pub(crate) fn resync(&mut self, kernel: &mut Kernel) {
        let Some(before) = self.primary.take_deps() else {
            return;
        };
        match DirListing::read(self.primary.as_fd()) {
            Ok(mut after) => {
                diff(&before, &mut after, &mut Resync { iw: self, kernel });
                self.primary.set_deps(after);
            }
            Err(e) => {
                warn!(wd = self.wd, error = %e, "resync listing failed");
                self.primary.set_deps(before);
            }
        }
    }

    /// Filter a translated event through the watch mask and one-shot state.
    /// `None` means the event is not delivered.
    pub(crate) fn admit(&mut self, raw: EventMask, is_dir: bool) -> Option<EventMask> {
        let mut mask = raw & self.flags & EventMask::ALL_EVENTS;
        if mask.is_empty() {
            return None;
        }
        if self.flags.contains(EventMask::ONESHOT) {
            if self.oneshot_fired {
                return None;
            }
            self.oneshot_fired = true;
        }
        if is_dir {
            mask |= EventMask::ISDIR;
        }
        Some(mask)
    }

    /// Deregister and close every descriptor.
    pub(crate) fn release(mut self, kernel: &mut Kernel) {
        self.subs.release_all(kernel);
        self.primary.release(kernel);
        debug!(wd = self.wd, "watch released");
    }
}

struct Resync<'a> {
    iw: &'a mut IWatch,
    kernel: &'a mut Kernel,
}

impl DiffHandler for Resync<'_> {
    fn moved(&mut self, from: &DirEntry, to: &DirEntry) {
        self.iw.rename_subwatch(from, to);
    }

    fn replaced(&mut self, victim: &DirEntry) {
        self.iw.del_subwatch(self.kernel, victim);
    }

    fn overwritten(&mut self, old: &DirEntry, new: &DirEntry) {
        if let Err(e) = self.iw.reopen_subwatch(self.kernel, old, new) {
            debug!(name = ?new.name(), error = %e, "reopen failed");
        }
    }

    fn removed(&mut self, entry: &DirEntry) {
        self.iw.del_subwatch(self.kernel, entry);
    }

    fn added(&mut self, entry: &DirEntry) {
        self.iw.add_subwatch(self.kernel, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dep_list::FileKind;
    use crate::sys;
    use crate::test_utils::{poll_kernel, ControlledSource};
    use std::sync::atomic::Ordering;

    fn open_dir(kernel: &mut Kernel, path: &std::path::Path, mask: EventMask) -> IWatch {
        let fd = sys::open_watch(None, path.as_os_str(), true).unwrap();
        let st = sys::fstat(fd.as_fd()).unwrap();
        IWatch::open(kernel, 1, path.as_os_str(), fd, &st, mask).unwrap()
    }

    fn entry_for(dir: &std::path::Path, name: &str) -> DirEntry {
        let fd = sys::open_watch(None, dir.join(name).as_os_str(), false).unwrap();
        let st = sys::fstat(fd.as_fd()).unwrap();
        DirEntry::new(name, st.ino, st.kind)
    }

    #[test]
    fn directory_gets_one_subwatch_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("1"), b"").unwrap();
        std::fs::create_dir(tmp.path().join("2")).unwrap();

        let mut kernel = poll_kernel();
        let iw = open_dir(&mut kernel, tmp.path(), EventMask::ALL_EVENTS);
        assert!(iw.is_dir());
        assert_eq!(iw.subs().len(), 2);
        assert_eq!(kernel.registrations(), 3);
        assert!(iw.subwatch_is_dir(&entry_for(tmp.path(), "2")));
        assert!(!iw.subwatch_is_dir(&entry_for(tmp.path(), "1")));

        iw.release(&mut kernel);
        assert_eq!(kernel.registrations(), 0);
    }

    #[test]
    fn rename_keeps_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a"), b"").unwrap();
        let mut kernel = poll_kernel();
        let mut iw = open_dir(&mut kernel, tmp.path(), EventMask::ALL_EVENTS);

        let from = entry_for(tmp.path(), "a");
        let token = iw.subs().find(&from).unwrap().token();
        let to = DirEntry::new("b", from.inode(), FileKind::Regular);
        iw.rename_subwatch(&from, &to);

        let w = iw.subs().find(&to).unwrap();
        assert_eq!(w.token(), token);
        assert_eq!(w.name(), "b");
        assert!(iw.subs().find(&from).is_none());
        iw.release(&mut kernel);
    }

    #[test]
    fn reopen_follows_new_inode_or_drops() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), b"old").unwrap();
        let mut kernel = poll_kernel();
        let mut iw = open_dir(&mut kernel, tmp.path(), EventMask::ALL_EVENTS);
        let old = entry_for(tmp.path(), "f");

        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("g"), b"new").unwrap();
        std::fs::rename(outside.path().join("g"), tmp.path().join("f")).unwrap();
        let new = entry_for(tmp.path(), "f");
        assert_ne!(old.inode(), new.inode());

        iw.reopen_subwatch(&mut kernel, &old, &new).unwrap();
        assert_eq!(iw.subs().find(&new).unwrap().inode(), new.inode());

        std::fs::remove_file(tmp.path().join("f")).unwrap();
        let ghost = DirEntry::new("f", 0, FileKind::Unknown);
        assert!(iw.reopen_subwatch(&mut kernel, &new, &ghost).is_err());
        assert!(iw.subs().is_empty());
        iw.release(&mut kernel);
    }

    #[test]
    fn gaining_child_interest_resyncs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut kernel = poll_kernel();
        let mut iw = open_dir(&mut kernel, tmp.path(), EventMask::DELETE_SELF);
        assert!(iw.subs().is_empty());

        std::fs::write(tmp.path().join("late"), b"").unwrap();
        iw.update_flags(&mut kernel, EventMask::DELETE_SELF | EventMask::CREATE)
            .unwrap();
        assert_eq!(iw.subs().len(), 1);
        assert_eq!(iw.flags(), EventMask::DELETE_SELF | EventMask::CREATE);
        iw.release(&mut kernel);
    }

    #[test]
    fn oneshot_admits_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut kernel = poll_kernel();
        let mut iw = open_dir(
            &mut kernel,
            tmp.path(),
            EventMask::CREATE | EventMask::DELETE | EventMask::ONESHOT,
        );

        assert_eq!(iw.admit(EventMask::MODIFY, false), None);
        assert_eq!(
            iw.admit(EventMask::CREATE, true),
            Some(EventMask::CREATE | EventMask::ISDIR)
        );
        assert_eq!(iw.admit(EventMask::DELETE, false), None);

        iw.update_flags(&mut kernel, EventMask::DELETE | EventMask::ONESHOT)
            .unwrap();
        assert_eq!(iw.admit(EventMask::DELETE, false), Some(EventMask::DELETE));
        iw.release(&mut kernel);
    }

    #[test]
    fn refused_rearm_keeps_previous_mask() {
        let tmp = tempfile::tempdir().unwrap();
        let (source, switches) = ControlledSource::new();
        let mut kernel = Kernel::new(Box::new(source));
        let mask = EventMask::CREATE | EventMask::ONESHOT;
        let mut iw = open_dir(&mut kernel, tmp.path(), mask);
        assert!(iw.admit(EventMask::CREATE, false).is_some());

        switches.fail_register.store(true, Ordering::SeqCst);
        assert!(iw.update_flags(&mut kernel, EventMask::ATTRIB).is_err());
        assert_eq!(iw.flags(), mask);
        // still spent
        assert_eq!(iw.admit(EventMask::CREATE, false), None);

        switches.fail_register.store(false, Ordering::SeqCst);
        iw.update_flags(&mut kernel, EventMask::ATTRIB).unwrap();
        assert_eq!(iw.flags(), EventMask::ATTRIB);
        assert_eq!(iw.admit(EventMask::ATTRIB, false), Some(EventMask::ATTRIB));
        iw.release(&mut kernel);
    }
}

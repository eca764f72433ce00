//! Directory snapshots and the diff that turns two of them into inotify
//! style changes.
//!
//! kqueue only says "this directory was written". To learn which entry was
//! created, deleted or renamed, the worker keeps the last listing of every
//! watched directory and compares it with a fresh one. The comparison runs in
//! fixed passes whose order decides what the consumer sees:
//!
//! 1. unchanged: same name and inode on both sides;
//! 2. moved: same inode under a new name;
//! 3. replaced: an old entry whose name became the destination of a move;
//!    overwritten: same name, new inode that did not arrive through a move;
//! 4. removed / added: whatever is left.
//!
//! An inode match always wins over a name match, so `mv a b` onto an existing
//! `b` reads as a rename, not as delete + create.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::os::fd::BorrowedFd;

use tracing::trace;

use crate::error::{Error, Result};
use crate::sys;

/// File type as far as a directory entry (or a stat) tells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FileKind {
    /// The filesystem did not say; resolve with a stat when it matters.
    #[default]
    Unknown,
    Regular,
    Directory,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirEntry {
    name: OsString,
    inode: u64,
    kind: FileKind,
}

impl DirEntry {
    pub fn new(name: impl Into<OsString>, inode: u64, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            inode,
            kind,
        }
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    fn same_identity(&self, other: &DirEntry) -> bool {
        self.inode == other.inode && self.name == other.name
    }
}

/// One point-in-time snapshot of a directory, sorted by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirListing {
    entries: Vec<DirEntry>,
}

impl DirListing {
    pub fn new(mut entries: Vec<DirEntry>) -> Self {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.dedup_by(|a, b| a.name == b.name);
        Self { entries }
    }

    /// Snapshot the directory open on `dir`.
    pub fn read(dir: BorrowedFd<'_>) -> Result<Self> {
        let entries = sys::read_dir(dir).map_err(|e| Error::ListingFailed(e.to_string()))?;
        Ok(Self::new(entries))
    }

    /// First snapshot of a directory that is being added. Unlike [`read`],
    /// failures keep their errno mapping (`EACCES`, `EMFILE`, ...).
    ///
    /// [`read`]: DirListing::read
    pub fn read_initial(dir: BorrowedFd<'_>, what: impl std::fmt::Display) -> Result<Self> {
        let entries = sys::read_dir(dir).map_err(|e| Error::from_io(e, what))?;
        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DirEntry> {
        self.entries.iter()
    }

    pub fn get(&self, name: &OsStr) -> Option<&DirEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_os_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }
}

impl<'a> IntoIterator for &'a DirListing {
    type Item = &'a DirEntry;
    type IntoIter = std::slice::Iter<'a, DirEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Receives the classification of every entry touched by [`diff`].
///
/// Calls arrive pass by pass: all `unchanged`, then all `moved`, then
/// `replaced` / `overwritten`, then `removed`, then `added`.
pub trait DiffHandler {
    fn unchanged(&mut self, _before: &DirEntry, _after: &DirEntry) {}
    fn moved(&mut self, from: &DirEntry, to: &DirEntry);
    /// `victim` lost its name to an entry moved within the directory.
    fn replaced(&mut self, victim: &DirEntry);
    /// `old` was overwritten in place by `new`, which came from elsewhere.
    fn overwritten(&mut self, old: &DirEntry, new: &DirEntry);
    fn removed(&mut self, entry: &DirEntry);
    fn added(&mut self, entry: &DirEntry);
}

/// Compare two snapshots of the same directory.
///
/// `after` is updated in place: entries that kept their inode inherit the
/// kind cached in `before` when the fresh listing could not tell. Returns
/// `true` when any name now refers to a different inode or an inode to a
/// different name (moved, replaced or overwritten entries).
pub fn diff(before: &DirListing, after: &mut DirListing, handler: &mut dyn DiffHandler) -> bool {
    let mut names_updated = false;

    // 1. unchanged
    let mut old_left: Vec<usize> = Vec::with_capacity(before.len());
    for (i, old) in before.entries.iter().enumerate() {
        match after.entries.binary_search_by(|e| e.name.cmp(&old.name)) {
            Ok(j) if after.entries[j].same_identity(old) => {
                if after.entries[j].kind == FileKind::Unknown {
                    after.entries[j].kind = old.kind;
                }
                handler.unchanged(old, &after.entries[j]);
            }
            _ => old_left.push(i),
        }
    }
    // ordered, so that among new entries sharing an inode the first by
    // name becomes the move target
    let mut new_left: BTreeSet<usize> = after
        .entries
        .iter()
        .enumerate()
        .filter(|(_, new)| before.get(&new.name).map_or(true, |old| !old.same_identity(new)))
        .map(|(j, _)| j)
        .collect();

    // 2. moves: inode match among what is left
    let mut by_inode: HashMap<u64, usize> = HashMap::new();
    for &j in &new_left {
        by_inode.entry(after.entries[j].inode).or_insert(j);
    }
    let mut move_targets: HashSet<OsString> = HashSet::new();
    let mut still_old = Vec::with_capacity(old_left.len());
    for i in old_left {
        let old = &before.entries[i];
        let Some(j) = by_inode.remove(&old.inode) else {
            still_old.push(i);
            continue;
        };
        if after.entries[j].kind == FileKind::Unknown {
            after.entries[j].kind = old.kind;
        }
        let new = &after.entries[j];
        handler.moved(old, new);
        move_targets.insert(new.name.clone());
        new_left.remove(&j);
        names_updated = true;
    }

    // 3. replacement (name taken by a move), then overwrite (name taken by
    //    an entry that did not come through a move)
    let mut removed = Vec::with_capacity(still_old.len());
    for i in still_old {
        let old = &before.entries[i];
        if move_targets.contains(&old.name) {
            handler.replaced(old);
            names_updated = true;
            continue;
        }
        let occupant = after
            .entries
            .binary_search_by(|e| e.name.cmp(&old.name))
            .ok()
            .filter(|j| new_left.contains(j));
        match occupant {
            Some(j) => {
                handler.overwritten(old, &after.entries[j]);
                new_left.remove(&j);
                names_updated = true;
            }
            None => removed.push(i),
        }
    }

    // 4. leftovers
    for i in removed {
        handler.removed(&before.entries[i]);
    }
    for j in new_left {
        handler.added(&after.entries[j]);
    }

    trace!(names_updated, "directory diff done");
    names_updated
}

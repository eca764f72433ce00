use std::collections::BTreeMap;

use crate::dep_list::DirEntry;
use crate::kernel::{Kernel, WatchToken};
use crate::watch::Watch;

/// Sub-watches of one user watch, keyed by kernel token.
///
/// Lookup by directory entry matches name *and* inode, so two entries that
/// traded names within one scan still resolve to their own descriptors.
#[derive(Debug, Default)]
pub struct WatchSet {
    watches: BTreeMap<WatchToken, Watch>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, watch: Watch) -> &Watch {
        let token = watch.token();
        self.watches.entry(token).or_insert(watch)
    }

    pub fn get(&self, token: WatchToken) -> Option<&Watch> {
        self.watches.get(&token)
    }

    pub fn find(&self, entry: &DirEntry) -> Option<&Watch> {
        self.watches.values().find(|w| w.matches(entry))
    }

    pub fn find_mut(&mut self, entry: &DirEntry) -> Option<&mut Watch> {
        self.watches.values_mut().find(|w| w.matches(entry))
    }

    /// Take the sub-watch tracking `entry` out of the set.
    pub fn remove(&mut self, entry: &DirEntry) -> Option<Watch> {
        let token = self.find(entry)?.token();
        self.watches.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.watches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Watch> {
        self.watches.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Watch> {
        self.watches.values_mut()
    }

    /// Deregister and close every sub-watch.
    pub fn release_all(&mut self, kernel: &mut Kernel) {
        for (_, watch) in std::mem::take(&mut self.watches) {
            watch.release(kernel);
        }
    }
}

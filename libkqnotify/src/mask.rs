//! Flag vocabularies on both sides of the translation.
//!
//! [`EventMask`] is the inotify vocabulary, bit-for-bit identical to Linux so
//! existing consumers can parse the stream unchanged. [`VnodeFlags`] is the
//! kqueue `EVFILT_VNODE` vocabulary; the values are the `NOTE_*` constants,
//! which are the same on every BSD and on macOS.

use bitflags::bitflags;

bitflags! {
    /// inotify event and watch flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        const ACCESS        = 0x0000_0001;
        const MODIFY        = 0x0000_0002;
        const ATTRIB        = 0x0000_0004;
        const CLOSE_WRITE   = 0x0000_0008;
        const CLOSE_NOWRITE = 0x0000_0010;
        const OPEN          = 0x0000_0020;
        const MOVED_FROM    = 0x0000_0040;
        const MOVED_TO      = 0x0000_0080;
        const CREATE        = 0x0000_0100;
        const DELETE        = 0x0000_0200;
        const DELETE_SELF   = 0x0000_0400;
        const MOVE_SELF     = 0x0000_0800;

        const CLOSE = Self::CLOSE_WRITE.bits() | Self::CLOSE_NOWRITE.bits();
        const MOVE  = Self::MOVED_FROM.bits() | Self::MOVED_TO.bits();

        const ALL_EVENTS = Self::ACCESS.bits()
            | Self::MODIFY.bits()
            | Self::ATTRIB.bits()
            | Self::CLOSE.bits()
            | Self::OPEN.bits()
            | Self::MOVE.bits()
            | Self::CREATE.bits()
            | Self::DELETE.bits()
            | Self::DELETE_SELF.bits()
            | Self::MOVE_SELF.bits();

        // reported by the engine, never requested
        const UNMOUNT    = 0x0000_2000;
        const Q_OVERFLOW = 0x0000_4000;
        const IGNORED    = 0x0000_8000;
        const ISDIR      = 0x4000_0000;

        // add_watch modifiers
        const ONLYDIR     = 0x0100_0000;
        const DONT_FOLLOW = 0x0200_0000;
        const EXCL_UNLINK = 0x0400_0000;
        const MASK_ADD    = 0x2000_0000;
        const ONESHOT     = 0x8000_0000;
    }
}

bitflags! {
    /// kqueue `EVFILT_VNODE` notes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VnodeFlags: u32 {
        const DELETE = 0x0000_0001;
        const WRITE  = 0x0000_0002;
        const EXTEND = 0x0000_0004;
        const ATTRIB = 0x0000_0008;
        const LINK   = 0x0000_0010;
        const RENAME = 0x0000_0020;
        const REVOKE = 0x0000_0040;
    }
}

/// Events that happen to children of a watched directory.
pub const CHILD_EVENTS: EventMask = EventMask::ACCESS
    .union(EventMask::MODIFY)
    .union(EventMask::ATTRIB)
    .union(EventMask::CLOSE)
    .union(EventMask::OPEN)
    .union(EventMask::MOVE)
    .union(EventMask::CREATE)
    .union(EventMask::DELETE);

/// Events that change a directory's entry set.
pub const STRUCTURE_EVENTS: EventMask = EventMask::MOVE
    .union(EventMask::CREATE)
    .union(EventMask::DELETE);

/// Kernel notes to request for a watch.
///
/// Sub-watches never ask for rename or delete of themselves: a child moving
/// or disappearing is seen through the parent's directory diff. User watches
/// always ask for `DELETE` and `REVOKE` so that `IN_IGNORED` can be produced.
pub fn inotify_to_vnode(mask: EventMask, is_dir: bool, is_sub: bool) -> VnodeFlags {
    let mut out = VnodeFlags::REVOKE;

    if mask.contains(EventMask::ATTRIB) {
        out |= VnodeFlags::ATTRIB | VnodeFlags::LINK;
    }
    if mask.contains(EventMask::MODIFY) && !is_dir {
        out |= VnodeFlags::WRITE | VnodeFlags::EXTEND;
    }

    if is_sub {
        return out;
    }

    out |= VnodeFlags::DELETE;
    if mask.contains(EventMask::MOVE_SELF) {
        out |= VnodeFlags::RENAME;
    }
    if is_dir && mask.intersects(CHILD_EVENTS) {
        out |= VnodeFlags::WRITE | VnodeFlags::EXTEND | VnodeFlags::LINK;
    }
    out
}

/// Translate kernel notes into inotify bits, before filtering by the
/// watch's mask. `DELETE` and `REVOKE` are resolved by the caller, which
/// knows whether the last link is gone.
pub fn vnode_to_inotify(flags: VnodeFlags, is_dir: bool, is_sub: bool) -> EventMask {
    let mut out = EventMask::empty();

    if !is_dir && flags.intersects(VnodeFlags::WRITE | VnodeFlags::EXTEND) {
        out |= EventMask::MODIFY;
    }
    if flags.contains(VnodeFlags::ATTRIB) {
        out |= EventMask::ATTRIB;
    }
    // a directory's link count follows its subdirectories, which the diff reports
    if flags.contains(VnodeFlags::LINK) && !is_dir {
        out |= EventMask::ATTRIB;
    }
    if !is_sub && flags.contains(VnodeFlags::RENAME) {
        out |= EventMask::MOVE_SELF;
    }

    if is_dir && !out.is_empty() {
        out |= EventMask::ISDIR;
    }
    out
}

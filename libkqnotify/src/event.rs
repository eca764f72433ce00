//! The `struct inotify_event` wire layout: encoding for the worker,
//! parsing for consumers.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use crate::mask::EventMask;
use crate::watch::WatchDescriptor;

/// `wd`, `mask`, `cookie`, `len`; all native-endian 32-bit.
pub const HEADER_LEN: usize = 16;

/// Bytes the name field takes: NUL-terminated and padded to a multiple of
/// the header size, or nothing when there is no name.
pub fn name_len(name: Option<&OsStr>) -> usize {
    match name {
        Some(n) if !n.is_empty() => (n.len() + 1).div_ceil(HEADER_LEN) * HEADER_LEN,
        _ => 0,
    }
}

pub fn record_len(name: Option<&OsStr>) -> usize {
    HEADER_LEN + name_len(name)
}

pub(crate) fn encode(
    out: &mut Vec<u8>,
    wd: WatchDescriptor,
    mask: EventMask,
    cookie: u32,
    name: Option<&OsStr>,
) {
    let len = name_len(name);
    out.extend_from_slice(&wd.to_ne_bytes());
    out.extend_from_slice(&mask.bits().to_ne_bytes());
    out.extend_from_slice(&cookie.to_ne_bytes());
    out.extend_from_slice(&(len as u32).to_ne_bytes());
    if let Some(n) = name.filter(|n| !n.is_empty()) {
        let bytes = n.as_bytes();
        out.extend_from_slice(bytes);
        out.resize(out.len() + len - bytes.len(), 0);
    }
}

/// One parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event<'a> {
    /// `-1` for `IN_Q_OVERFLOW`.
    pub wd: WatchDescriptor,
    pub mask: EventMask,
    /// Links the `IN_MOVED_FROM` and `IN_MOVED_TO` halves of a rename.
    pub cookie: u32,
    /// Entry name, for events about a child of a watched directory.
    pub name: Option<&'a OsStr>,
}

/// Iterator over the whole records at the start of a buffer. A trailing
/// partial record is left alone; see [`Events::consumed`].
#[derive(Debug, Clone)]
pub struct Events<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Events<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes taken by the records yielded so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

fn read_u32(b: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&b[..4]);
    u32::from_ne_bytes(raw)
}

impl<'a> Iterator for Events<'a> {
    type Item = Event<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        if rest.len() < HEADER_LEN {
            return None;
        }
        let len = read_u32(&rest[12..]) as usize;
        if rest.len() < HEADER_LEN + len {
            return None;
        }

        let raw_name = &rest[HEADER_LEN..HEADER_LEN + len];
        // padding is NULs after the name
        let end = raw_name.iter().position(|&b| b == 0).unwrap_or(raw_name.len());
        let name = (end > 0).then(|| OsStr::from_bytes(&raw_name[..end]));

        self.pos += HEADER_LEN + len;
        Some(Event {
            wd: read_u32(rest) as i32,
            mask: EventMask::from_bits_retain(read_u32(&rest[4..])),
            cookie: read_u32(&rest[8..]),
            name,
        })
    }
}

/// Length of the longest prefix of `buf` made of whole records.
pub fn complete_len(buf: &[u8]) -> usize {
    let mut events = Events::new(buf);
    while events.next().is_some() {}
    events.consumed()
}

//! Outbound inotify records.
//!
//! Records wait here until the consumer socket has room. A flush only ever
//! offers whole records; when the OS takes fewer bytes than offered, the
//! unwritten tail is kept and goes out before anything else.

use std::collections::VecDeque;
use std::ffi::{OsStr, OsString};
use std::io::{self, Write};

use tracing::{trace, warn};

use crate::event::{self, record_len};
use crate::mask::EventMask;
use crate::watch::WatchDescriptor;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    wd: WatchDescriptor,
    mask: EventMask,
    cookie: u32,
    name: Option<OsString>,
}

impl Record {
    fn len(&self) -> usize {
        record_len(self.name.as_deref())
    }

    fn is_overflow(&self) -> bool {
        self.mask.contains(EventMask::Q_OVERFLOW)
    }
}

#[derive(Debug)]
pub struct EventQueue {
    records: VecDeque<Record>,
    /// Bytes of a batch the socket did not take.
    carry: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl EventQueue {
    /// A queue holding at most `limit` events plus one overflow marker.
    pub fn new(limit: usize) -> Self {
        Self {
            records: VecDeque::new(),
            carry: Vec::new(),
            limit: limit.max(1),
            dropped: 0,
        }
    }

    /// Append one record. Returns `false` if it was coalesced or dropped.
    pub fn enqueue(
        &mut self,
        wd: WatchDescriptor,
        mask: EventMask,
        cookie: u32,
        name: Option<&OsStr>,
    ) -> bool {
        let record = Record {
            wd,
            mask,
            cookie,
            name: name.filter(|n| !n.is_empty()).map(OsStr::to_os_string),
        };

        if self.records.back() == Some(&record) {
            trace!(wd, ?mask, "coalesced");
            return false;
        }

        if self.records.len() >= self.limit {
            if !self.records.back().is_some_and(Record::is_overflow) {
                warn!(limit = self.limit, "event queue overflow");
                self.records.push_back(Record {
                    wd: -1,
                    mask: EventMask::Q_OVERFLOW,
                    cookie: 0,
                    name: None,
                });
            }
            self.dropped += 1;
            return false;
        }

        self.records.push_back(record);
        true
    }

    /// Write whole records fitting in `capacity` bytes to `out`.
    ///
    /// Returns the bytes the writer accepted. Nothing is written when the
    /// first pending record (or the carried tail) does not fit.
    pub fn flush<W: Write + ?Sized>(&mut self, out: &mut W, capacity: usize) -> io::Result<usize> {
        if self.carry.len() > capacity {
            return Ok(0);
        }
        let mut batch = std::mem::take(&mut self.carry);
        while let Some(next) = self.records.front() {
            if batch.len() + next.len() > capacity {
                break;
            }
            if let Some(r) = self.records.pop_front() {
                event::encode(&mut batch, r.wd, r.mask, r.cookie, r.name.as_deref());
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let written = loop {
            match out.write(&batch) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break 0,
                Err(e) => {
                    self.carry = batch;
                    return Err(e);
                }
            }
        };
        if written < batch.len() {
            self.carry = batch.split_off(written);
        }
        trace!(written, pending = self.records.len(), "flushed");
        Ok(written)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.carry.is_empty()
    }

    /// Bytes waiting to be written, carried tail included.
    pub fn pending_bytes(&self) -> usize {
        self.carry.len() + self.records.iter().map(Record::len).sum::<usize>()
    }

    /// Events discarded since the queue first overflowed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

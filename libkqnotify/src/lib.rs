//! libkqnotify – the inotify API on top of kqueue.
//!
//! Down-stream crates (`cli-bin`, tests, FFI shims) should depend *only* on
//! the items re-exported here plus the [`session`] registry functions, never
//! on the worker internals. That gives us room to refactor the engine
//! without breaking callers.
//!
//! ```no_run
//! use libkqnotify::{EventMask, InitFlags, Inotify};
//!
//! let session = Inotify::init1(InitFlags::CLOEXEC)?;
//! session.add_watch("/tmp", EventMask::CREATE | EventMask::DELETE)?;
//! let mut buf = [0u8; 4096];
//! for ev in session.read_events(&mut buf)? {
//!     println!("{} {:?} {:?}", ev.wd, ev.mask, ev.name);
//! }
//! # Ok::<(), libkqnotify::Error>(())
//! ```

pub mod config;
pub mod dep_list;
pub mod error;
pub mod event;
pub mod event_queue;
pub mod iwatch;
pub mod kernel;
pub mod logging;
pub mod mask;
pub mod session;
pub mod sys;
pub mod watch;
pub mod watch_set;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, Events};
pub use mask::EventMask;
pub use session::{InitFlags, Inotify};
pub use watch::WatchDescriptor;
pub use worker::SessionState;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod worker_tests;

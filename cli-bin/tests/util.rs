//! tests/util.rs
//! Small helpers shared across integration tests.

#![allow(dead_code)]

use assert_cmd::Command;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Absolute path to the freshly-built `kqnotify` binary.
pub fn bin() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kqnotify"))
}

/// Build a `Command` for `kqnotify` with a short stat-poll period, so the
/// polling backend notices changes quickly.
///
/// Each call yields a brand-new `Command`, so callers can freely add
/// arguments without affecting other invocations.
pub fn kqnotify() -> Command {
    let mut cmd = Command::new(bin());
    cmd.env("KQNOTIFY_POLL_INTERVAL_MS", "10");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Run `act` on another thread once the watcher has had time to start.
pub fn after_startup<F: FnOnce() + Send + 'static>(act: F) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(700));
        act();
    })
}

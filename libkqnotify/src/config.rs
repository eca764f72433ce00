use std::time::Duration;

use crate::error::{Error, Result};

/// Linux's `/proc/sys/fs/inotify/max_queued_events` default.
pub const DEFAULT_MAX_QUEUED_EVENTS: usize = 16_384;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
pub const DEFAULT_COMMAND_QUEUE: usize = 16;

/// Runtime configuration of one session's worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Events held before `IN_Q_OVERFLOW` is reported.
    pub max_queued_events: usize,
    /// Rescan period of the stat polling backend. Unused by kqueue.
    pub poll_interval: Duration,
    /// Commands that may wait in the worker mailbox.
    pub command_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_queued_events: DEFAULT_MAX_QUEUED_EVENTS,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            command_queue_depth: DEFAULT_COMMAND_QUEUE,
        }
    }
}

impl Config {
    /// Resolve configuration from the environment.
    ///
    /// Each knob has its own variable and falls back to the default when
    /// unset:
    /// 1. `KQNOTIFY_MAX_QUEUED_EVENTS`
    /// 2. `KQNOTIFY_POLL_INTERVAL_MS`
    /// 3. `KQNOTIFY_COMMAND_QUEUE`
    ///
    /// A set but unparsable (or zero) value is an error rather than a silent
    /// fallback.
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(n) = env_usize("KQNOTIFY_MAX_QUEUED_EVENTS")? {
            cfg.max_queued_events = n;
        }
        if let Some(ms) = env_usize("KQNOTIFY_POLL_INTERVAL_MS")? {
            cfg.poll_interval = Duration::from_millis(ms as u64);
        }
        if let Some(n) = env_usize("KQNOTIFY_COMMAND_QUEUE")? {
            cfg.command_queue_depth = n;
        }

        Ok(cfg)
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    let Some(raw) = std::env::var_os(key) else {
        return Ok(None);
    };
    let raw = raw.to_string_lossy();
    match raw.trim().parse::<usize>() {
        Ok(0) | Err(_) => Err(Error::InvalidArgument(format!("{key}={raw}"))),
        Ok(n) => Ok(Some(n)),
    }
}

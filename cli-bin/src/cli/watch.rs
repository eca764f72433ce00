// src/cli/watch.rs

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Args;
use libkqnotify::{Error, EventMask, InitFlags, Inotify, WatchDescriptor};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::events;
use super::Format;

/// How long to sleep when the socket has nothing for us.
const IDLE: Duration = Duration::from_millis(20);

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Files or directories to watch
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Event to listen for; repeat for more (default: all events)
    #[arg(short, long = "event", value_parser = parse_event)]
    pub events: Vec<EventMask>,

    /// Keep listening instead of exiting after the first event
    #[arg(short, long)]
    pub monitor: bool,

    /// Watch every directory below the given ones too
    #[arg(short, long)]
    pub recursive: bool,

    /// Give up after this many seconds without an event
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Watch symbolic links themselves, not their targets
    #[arg(long)]
    pub no_dereference: bool,

    /// Prefix each event with the local time
    #[arg(long)]
    pub timestamp: bool,
}

fn parse_event(s: &str) -> std::result::Result<EventMask, String> {
    events::parse(s).ok_or_else(|| format!("unknown event `{s}` (see `kqnotify events`)"))
}

/// Why the watch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// An event was printed (or every watch went away).
    Event,
    TimedOut,
    Interrupted,
}

/// One record copied out of the read buffer.
struct Record {
    wd: WatchDescriptor,
    mask: EventMask,
    cookie: u32,
    name: Option<OsString>,
}

#[cfg(feature = "json")]
#[derive(serde::Serialize)]
struct JsonEvent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    wd: WatchDescriptor,
    path: String,
    events: Vec<&'static str>,
    cookie: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<std::borrow::Cow<'a, str>>,
}

/// Watch descriptors and the paths they were added for.
struct Watches<'a> {
    session: &'a Inotify,
    mask: EventMask,
    paths: HashMap<WatchDescriptor, PathBuf>,
}

impl Watches<'_> {
    fn add(&mut self, path: &Path) -> Result<WatchDescriptor> {
        let wd = self
            .session
            .add_watch(path, self.mask)
            .with_context(|| format!("Couldn't watch {}", path.display()))?;
        debug!(wd, path = %path.display(), "watching");
        self.paths.insert(wd, path.to_path_buf());
        Ok(wd)
    }

    /// `root` plus every directory below it. Only a failure on `root`
    /// itself is fatal.
    fn add_tree(&mut self, root: &Path) -> Result<()> {
        self.add(root)?;
        for entry in WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.map_err(|e| warn!("walk: {e}")).ok())
            .filter(|e| e.file_type().is_dir())
        {
            if let Err(e) = self.add(entry.path()) {
                warn!("{e:#}");
            }
        }
        Ok(())
    }
}

/// Run `kqnotify watch`.
pub fn run(args: &WatchArgs, format: Format) -> Result<Outcome> {
    if format == Format::Json && !cfg!(feature = "json") {
        anyhow::bail!("JSON output needs a build with `--features json`");
    }

    let mut mask = args
        .events
        .iter()
        .fold(EventMask::empty(), |acc, m| acc | *m);
    if mask.is_empty() {
        mask = EventMask::ALL_EVENTS;
    }
    if args.no_dereference {
        mask |= EventMask::DONT_FOLLOW;
    }

    let session = Inotify::init1(InitFlags::NONBLOCK | InitFlags::CLOEXEC)
        .context("Couldn't start an inotify session")?;
    let mut watches = Watches {
        session: &session,
        mask,
        paths: HashMap::new(),
    };
    for p in &args.paths {
        if args.recursive {
            watches.add_tree(p)?;
        } else {
            watches.add(p)?;
        }
    }
    info!(count = watches.paths.len(), "Watches established.");

    let running = Arc::new(AtomicBool::new(true));
    let r_clone = running.clone();
    ctrlc::set_handler(move || r_clone.store(false, Ordering::SeqCst))?;

    let deadline = args.timeout.map(|s| Instant::now() + Duration::from_secs(s));
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        if !running.load(Ordering::SeqCst) {
            info!("Interrupted.");
            return Ok(Outcome::Interrupted);
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Ok(Outcome::TimedOut);
        }

        let batch: Vec<Record> = match session.read_events(&mut buf) {
            Ok(events) => events
                .map(|e| Record {
                    wd: e.wd,
                    mask: e.mask,
                    cookie: e.cookie,
                    name: e.name.map(|n| n.to_os_string()),
                })
                .collect(),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(IDLE);
                continue;
            }
            Err(e) => return Err(e).context("Reading events failed"),
        };

        for rec in batch {
            print_record(&rec, &watches.paths, format, args.timestamp)?;

            if rec.mask.contains(EventMask::IGNORED) {
                watches.paths.remove(&rec.wd);
                if watches.paths.is_empty() {
                    info!("No watches left.");
                    return Ok(Outcome::Event);
                }
                continue;
            }
            if args.recursive && rec.mask.contains(EventMask::CREATE | EventMask::ISDIR) {
                if let (Some(dir), Some(name)) = (watches.paths.get(&rec.wd), &rec.name) {
                    let child = dir.join(name);
                    if let Err(e) = watches.add_tree(&child) {
                        warn!("{e:#}");
                    }
                }
            }
            if !args.monitor {
                return Ok(Outcome::Event);
            }
        }
    }
}

fn print_record(
    rec: &Record,
    paths: &HashMap<WatchDescriptor, PathBuf>,
    format: Format,
    timestamp: bool,
) -> Result<()> {
    let time = timestamp.then(|| chrono::Local::now().format("%H:%M:%S%.3f").to_string());
    let path = paths
        .get(&rec.wd)
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let names = events::names(rec.mask);

    match format {
        Format::Text => {
            let mut line = String::new();
            if let Some(t) = &time {
                line.push_str(t);
                line.push(' ');
            }
            line.push_str(&path);
            line.push(' ');
            line.push_str(&names.join(","));
            if let Some(name) = &rec.name {
                line.push(' ');
                line.push_str(&name.to_string_lossy());
            }
            if rec.cookie != 0 {
                line.push_str(&format!(" (cookie {})", rec.cookie));
            }
            println!("{line}");
        }
        Format::Json => {
            #[cfg(feature = "json")]
            {
                let ev = JsonEvent {
                    time,
                    wd: rec.wd,
                    path,
                    events: names,
                    cookie: rec.cookie,
                    name: rec.name.as_ref().map(|n| n.to_string_lossy()),
                };
                println!("{}", serde_json::to_string(&ev)?);
            }
        }
    }
    Ok(())
}

// src/cli.rs

pub mod events;
pub mod watch;

use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

/// Output format for event lines.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

/// kqnotify – inotify events on kqueue systems
#[derive(Parser, Debug)]
#[command(author, version, about, propagate_version = true)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = Format::Text, global = true)]
    pub format: Format,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch files or directories and print their events
    ///
    /// Example:
    ///     kqnotify watch -m -r -e create -e delete ~/Downloads
    Watch(watch::WatchArgs),

    /// List the event names accepted by `watch --event`
    Events,

    /// Generate shell completions (hidden)
    #[command(hide = true)]
    Completions {
        /// Shell to generate for
        #[arg(value_enum)]
        shell: Shell,
    },
}

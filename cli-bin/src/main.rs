//! kqnotify CLI entry-point
//!
//! All translation lives in the `libkqnotify` crate; this file handles
//! argument parsing, logging and dispatch.

mod cli; // sub-command definitions and argument structs

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use libkqnotify::logging;
use std::{env, io, process::ExitCode};
use tracing::debug;

use cli::watch::Outcome;
use cli::{Cli, Commands, Format};

fn main() -> Result<ExitCode> {
    /* ── CLI parsing & logging ────────────────────────────────── */
    let args = Cli::parse();
    if args.verbose {
        env::set_var("RUST_LOG", "debug");
    }
    logging::init();

    /* ── command dispatch ────────────────────────────────────── */
    match args.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "kqnotify", &mut io::stdout());
        }

        Commands::Events => {
            let accepted: Vec<&str> = cli::events::NAMES
                .iter()
                .filter(|(_, m)| m.intersects(libkqnotify::EventMask::ALL_EVENTS))
                .map(|(n, _)| *n)
                .collect();
            match args.format {
                Format::Text => {
                    for name in accepted {
                        println!("{name}");
                    }
                }
                Format::Json => {
                    #[cfg(feature = "json")]
                    {
                        println!("{}", serde_json::to_string(&accepted)?);
                    }
                    #[cfg(not(feature = "json"))]
                    {
                        anyhow::bail!("JSON output needs a build with `--features json`");
                    }
                }
            }
        }

        Commands::Watch(w) => {
            let outcome = cli::watch::run(&w, args.format)?;
            debug!(?outcome, "watch finished");
            if outcome == Outcome::TimedOut {
                // inotifywait's exit status for a timeout
                return Ok(ExitCode::from(2));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

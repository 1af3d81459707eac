//! `dacfg` entry point.
//!
//! # What happens at startup
//!
//! 1. `tracing_subscriber` is initialised; `RUST_LOG` picks the level
//!    (default `warn`, so command output is not drowned in log lines).
//! 2. CLI arguments are parsed with `clap` into a [`Cli`].
//! 3. Engine settings are loaded and merged with the command line.
//! 4. A [`Client`](dacfg_core::Client) is built and the sub-command runs.
//!    `watch` additionally drives an event loop until Ctrl-C.

use std::io::Write;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use dacfg_cli::application::{commands, watch};
use dacfg_cli::cli::{Cli, Command};
use dacfg_core::{notify_fn, EventLoop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = cli.effective_settings()?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    match &cli.command {
        Command::Get { group, key } => {
            let client = cli.build_client(&settings, None)?;
            commands::get(&client, group, key, &mut out)?;
        }
        Command::Set { group, key, value } => {
            let client = cli.build_client(&settings, None)?;
            commands::set(&client, group, key, value)?;
        }
        Command::Unset { group, key } => {
            let client = cli.build_client(&settings, None)?;
            commands::unset(&client, group, key)?;
        }
        Command::Reset { instance_only } => {
            let client = cli.build_client(&settings, None)?;
            commands::reset(&client, *instance_only, &mut out)?;
        }
        Command::List => {
            let client = cli.build_client(&settings, None)?;
            commands::list(&client, &mut out)?;
        }
        Command::Watch { keys, interval_ms } => {
            let event_loop = EventLoop::new();
            let client = cli.build_client(&settings, Some(event_loop.handle()))?;
            let sink = notify_fn(|group, key, value| {
                let mut out = std::io::stdout().lock();
                if writeln!(out, "{group}/{key} = {value}").is_err() {
                    error!("failed to write change of {group}/{key} to stdout");
                }
            });
            watch::subscribe(&client, keys, &sink)?;

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("failed to listen for Ctrl+C signal: {e}");
                }
                info!("received Ctrl+C, stopping");
            };
            drop(out);
            watch::drive(&event_loop, Duration::from_millis(*interval_ms), shutdown).await;
        }
    }
    Ok(())
}

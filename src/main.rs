//! # relay
//!
//! Command-line front end for the relay sync core: replay a recorded event
//! stream into an in-memory store, or probe a server's health endpoint.

#![deny(unsafe_code)]

mod replay;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use relay_client::{probe_health, HttpBackend, ProbeResult};
use relay_core::ids::SessionId;
use relay_settings::{load_settings, load_settings_from_path, RelaySettings};
use relay_sync::{SyncBackend, SyncConfig};
use relay_telemetry::{init_telemetry, TelemetryConfig};

use crate::replay::{load_events, run_replay, OfflineBackend, ReplayOptions, ReplayReport};

/// Relay sync client tools.
#[derive(Parser, Debug)]
#[command(name = "relay", about = "Relay sync client tools")]
struct Cli {
    /// Settings file (defaults to `~/.relay/settings.json`).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Emit JSON log lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Feed a recorded event log through the sync core and print the resulting state.
    Replay {
        /// File with one event per line.
        events: PathBuf,

        /// Session the simulated user is looking at.
        #[arg(long)]
        active: Option<String>,

        /// Agents the client knows about.
        #[arg(long, value_delimiter = ',', default_value = "build,plan")]
        agents: Vec<String>,

        /// Fetch history from the configured server instead of running offline.
        #[arg(long)]
        online: bool,
    },
    /// Check a server's `/health` endpoint.
    Probe {
        /// Server URL (defaults to the configured one).
        url: Option<String>,
    },
}

fn settings_for(cli: &Cli) -> Result<RelaySettings> {
    match &cli.settings {
        Some(path) => load_settings_from_path(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => load_settings().context("failed to load settings"),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let settings = settings_for(&cli)?;
    let telemetry = init_telemetry(TelemetryConfig::from_level_name(
        &settings.logging.level,
        cli.json_logs || settings.logging.json,
    ));

    match cli.command {
        Command::Replay {
            events,
            active,
            agents,
            online,
        } => {
            let parsed = load_events(&events)?;
            info!(events = parsed.events.len(), skipped = parsed.skipped, "event log loaded");

            let backend: Arc<dyn SyncBackend> = if online {
                Arc::new(HttpBackend::new(&settings.client)?)
            } else {
                Arc::new(OfflineBackend)
            };
            let event_count = parsed.events.len();
            let (snapshot, counters) = run_replay(
                parsed.events,
                ReplayOptions {
                    active: active.map(SessionId::from_raw),
                    agents,
                },
                SyncConfig::from(&settings.sync),
                backend,
                telemetry.counters(),
            )
            .await?;

            let report = ReplayReport {
                events: event_count,
                skipped_lines: parsed.skipped,
                snapshot,
                counters,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Probe { url } => {
            let url = url.unwrap_or_else(|| settings.client.server_url.clone());
            let client = reqwest::Client::builder().build()?;
            let result = probe_health(
                &client,
                &url,
                Duration::from_millis(settings.client.probe_timeout_ms),
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            return Ok(ExitCode::from(probe_exit_status(&result)));
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Non-zero unless the server answered healthy.
fn probe_exit_status(result: &ProbeResult) -> u8 {
    u8::from(!result.is_ok())
}

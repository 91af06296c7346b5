//! kartwall-monitor: watch a timing relay and manage lap history from a shell
//!
//! ```bash
//! # Live standings, two updates per second
//! kartwall-monitor watch --host timing.local --rate 2
//!
//! # Store a finished heat, then ask for a driver's laps
//! kartwall-monitor ingest heat3.json
//! kartwall-monitor request '{"action":"get_recent_sessions","webUserId":"user-a"}'
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use kartwall::{ConnectionState, Kartwall, KartwallConfig, UpdateRate};
use serde_json::json;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kartwall-monitor", about = "Kart timing feed monitor and lap history tool")]
struct CliArgs {
    /// TOML configuration file
    #[arg(long, short, env = "KARTWALL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the relay and print standings as they arrive
    Watch {
        /// Relay host (overrides the config file)
        #[arg(long)]
        host: Option<String>,
        /// Maximum standings updates per second; 0 prints every frame
        #[arg(long, default_value_t = 1)]
        rate: u32,
    },
    /// Store a finished session payload read from a JSON file
    Ingest { payload: PathBuf },
    /// Run one action request, given as JSON, and print the response
    Request { body: String },
    /// Purge lap history older than the retention window
    Cleanup,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => KartwallConfig::load_from_file(path)?,
        None => KartwallConfig::default(),
    };
    config.apply_process_env()?;

    match args.command {
        Command::Watch { host, rate } => {
            if let Some(host) = host {
                config.feed.host = host;
            }
            watch(&config, rate).await
        }
        Command::Ingest { payload } => {
            let contents = std::fs::read_to_string(&payload)
                .with_context(|| format!("reading {}", payload.display()))?;
            let session: serde_json::Value =
                serde_json::from_str(&contents).context("payload is not valid JSON")?;
            let body = json!({ "action": "process_lap_data", "sessionData": session });
            request(&config, body).await
        }
        Command::Request { body } => {
            let body: serde_json::Value = serde_json::from_str(&body).context("request is not valid JSON")?;
            request(&config, body).await
        }
        Command::Cleanup => request(&config, json!({ "action": "cleanup_old_records" })).await,
    }
}

async fn watch(config: &KartwallConfig, rate: u32) -> anyhow::Result<()> {
    let feed = Kartwall::connect_with(config);
    info!(endpoint = %feed.endpoint(), "Watching timing feed");

    let mut statuses = feed.status_updates();
    let mut standings = feed.snapshots(UpdateRate::Max(rate));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, disconnecting");
                feed.disconnect();
                return Ok(());
            }
            Some(status) = statuses.next() => {
                match status.state {
                    ConnectionState::Connected => info!("Feed connected"),
                    ConnectionState::Reconnecting => warn!(
                        retry = status.retry_count,
                        error = status.last_error.as_deref().unwrap_or("connection closed"),
                        "Feed lost, reconnecting"
                    ),
                    ConnectionState::Connecting | ConnectionState::Disconnected => {}
                }
            }
            Some(snapshot) = standings.next() => {
                println!("{}", snapshot.session_name.as_deref().unwrap_or("Live"));
                for driver in &snapshot.drivers {
                    let best = driver
                        .best_lap_ms
                        .map(|ms| format!("{}.{:03}", ms / 1000, ms % 1000))
                        .unwrap_or_else(|| "-".into());
                    println!(
                        "  P{:<2} {:<24} kart {:>3}  best {}",
                        driver.position,
                        driver.name,
                        driver.kart_number.map(|k| k.to_string()).unwrap_or_default(),
                        best
                    );
                }
            }
        }
    }
}

async fn request(config: &KartwallConfig, body: serde_json::Value) -> anyhow::Result<()> {
    let api = Kartwall::open_capture(config)?;
    let response = api.handle_value(body).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.success {
        anyhow::bail!("request failed with status {}", response.status.http_status());
    }
    Ok(())
}

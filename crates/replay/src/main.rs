use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use lockly_core::dedup::dedup;
use lockly_replay::{apply_slot_names, parse_log, parse_slot_names, write_store, ReplayOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Reconstruct Lockly activity data from z2m logs.
#[derive(Debug, Parser)]
#[command(name = "lockly-replay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the z2m log file.
    logfile: PathBuf,

    /// Activity store file to write. Its `data` field is replaced.
    #[arg(long, env = "LOCKLY_REPLAY_STORE_PATH")]
    store_path: Option<PathBuf>,

    /// z2m base MQTT topic.
    #[arg(long, env = "LOCKLY_MQTT_TOPIC", default_value = "zigbee2mqtt")]
    base_topic: String,

    /// JSON mapping of slot ids to names, e.g. '{"7": "Lorena"}'.
    #[arg(long)]
    slots: Option<String>,

    /// Hours offset from UTC of the log timestamps.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    tz_offset: f64,

    /// Print the deduplicated view instead of the raw events.
    #[arg(long)]
    dedup: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries the JSON output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lockly_replay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let names = match &cli.slots {
        Some(raw) => parse_slot_names(raw)?,
        None => Default::default(),
    };

    let text = tokio::fs::read_to_string(&cli.logfile)
        .await
        .with_context(|| format!("Failed to read {}", cli.logfile.display()))?;

    let options = ReplayOptions {
        base_topic: cli.base_topic.clone(),
        tz_offset_hours: cli.tz_offset,
    };
    let mut events = parse_log(text.lines(), &options)?;
    apply_slot_names(&mut events, &names);
    tracing::info!(events = events.len(), "Parsed lock action events");

    match &cli.store_path {
        Some(path) => write_store(path, &events).await?,
        None => {
            let output = if cli.dedup { dedup(&events) } else { events };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

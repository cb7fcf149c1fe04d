//! Sluice server binary.
//!
//! ```text
//!  client ──TCP──▶ listener ──▶ pipeline (stage → stage → …) ──▶ client
//!                                  │
//!                                  └─ suspended stages resume via bridges
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::sync::mpsc;
use uuid::Uuid;

use sluice::buffer::pool;
use sluice::config::{load_config, watcher::ConfigWatcher, SluiceConfig};
use sluice::lifecycle::SignalEvent;
use sluice::lifecycle::signals;
use sluice::observability::{logging, metrics};
use sluice::script::TransformRegistry;
use sluice::server::{Server, ServerHandle};
use sluice::stage::factory::build_templates;

#[derive(Debug, Parser)]
#[command(name = "sluice", version, about = "Programmable stream data-plane")]
struct Cli {
    /// Path to the TOML configuration file.
    config: PathBuf,

    /// Override the configured log level.
    #[arg(long)]
    log_level: Option<String>,

    /// Load, validate and build every pipeline, then exit.
    #[arg(long)]
    verify: bool,

    /// Print every pipeline template as JSON, then exit.
    #[arg(long)]
    dump: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.observability.log_level);
    logging::init_logging(level, config.observability.log_format)?;

    let instance_id = Uuid::new_v4();
    tracing::info!(
        instance_id = %instance_id,
        instance_name = config.instance.name.as_deref().unwrap_or("-"),
        version = env!("CARGO_PKG_VERSION"),
        "sluice starting"
    );

    pool::init(config.buffer.chunk_size);
    let registry = TransformRegistry::builtin();

    if cli.verify || cli.dump {
        let templates = build_templates(&config, &registry)?;
        if cli.dump {
            for template in templates.values() {
                println!("{}", serde_json::to_string_pretty(&template.dump())?);
            }
        }
        tracing::info!(pipelines = templates.len(), "Configuration verified");
        return Ok(());
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = Server::bind(&config, registry).await?;
    for addr in server.local_addrs() {
        tracing::info!(address = %addr, "Listening for connections");
    }

    let handle = server.handle();
    let signals = signals::listen()?;

    let (_watcher, updates) = match ConfigWatcher::spawn(&cli.config, &config) {
        Ok((watcher, updates)) => (Some(watcher), updates),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable; reload with SIGHUP");
            (None, mpsc::unbounded_channel().1)
        }
    };

    tokio::spawn(control_loop(handle, cli.config.clone(), signals, updates));

    server.run().await;
    tracing::info!(instance_id = %instance_id, "Shutdown complete");
    Ok(())
}

async fn control_loop(
    handle: ServerHandle,
    path: PathBuf,
    mut signals: mpsc::UnboundedReceiver<SignalEvent>,
    mut updates: mpsc::UnboundedReceiver<SluiceConfig>,
) {
    loop {
        tokio::select! {
            Some(signal) = signals.recv() => match signal {
                SignalEvent::Shutdown => {
                    if !handle.shutdown() {
                        tracing::warn!("Second shutdown signal; exiting immediately");
                        std::process::exit(1);
                    }
                }
                SignalEvent::Reload => match load_config(&path) {
                    Ok(config) => apply(&handle, &config, "signal"),
                    Err(e) => tracing::error!(error = %e, "Failed to reload config; keeping current configuration"),
                },
                SignalEvent::Dump => handle.dump(),
            },
            Some(config) = updates.recv() => apply(&handle, &config, "watcher"),
            else => break,
        }
    }
}

fn apply(handle: &ServerHandle, config: &SluiceConfig, trigger: &'static str) {
    match handle.reload(config) {
        Ok(()) => tracing::info!(trigger, "Configuration applied"),
        Err(e) => tracing::warn!(trigger, error = %e, "Configuration not applied"),
    }
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use polystep_engine::config::{EngineConfig, resolve_config_path};
use polystep_engine::{Engine, load_config};
use polystep_server::PolystepHttpServer;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "polystep", version, about = "Event-driven polyglot step engine")]
struct Cli {
    /// Configuration file (defaults to $POLYSTEP_CONFIG_PATH, then ./polystep.yaml).
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine and its HTTP surface until interrupted.
    Start {
        /// Skip the HTTP server.
        #[arg(long)]
        no_server: bool,
    },
    /// Load and validate the configuration.
    Validate,
    /// List configured steps and their subscriptions.
    Steps {
        #[arg(long)]
        json: bool,
    },
    /// Emit one event, wait for its trace to finish and print its logs.
    Emit {
        topic: String,
        /// JSON payload.
        #[arg(long, default_value = "{}")]
        data: String,
        #[arg(long = "flow")]
        flows: Vec<String>,
        /// Seconds to wait for the trace to settle.
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Start { no_server } => run_start(config, no_server).await,
        Command::Validate => {
            let path = resolve_config_path(cli.config.as_deref());
            println!("{} is valid ({} steps)", path.display(), config.steps.len());
            Ok(())
        }
        Command::Steps { json } => print_steps(&config, json),
        Command::Emit {
            topic,
            data,
            flows,
            wait,
        } => run_emit(config, topic, &data, flows, Duration::from_secs(wait)).await,
    }
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_start(config: EngineConfig, no_server: bool) -> Result<()> {
    let engine = Engine::from_config(config).await?;
    let server = if no_server {
        None
    } else {
        Some(PolystepHttpServer::from_engine(engine.clone())?.start().await?)
    };

    info!(steps = engine.config().steps.len(), "Polystep running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    if let Some(server) = server
        && let Err(error) = server.stop().await
    {
        warn!(error = %error, "HTTP server did not stop cleanly");
    }
    engine.shutdown().await;
    Ok(())
}

fn print_steps(config: &EngineConfig, as_json: bool) -> Result<()> {
    if as_json {
        println!("{}", serde_json::to_string_pretty(&config.steps)?);
        return Ok(());
    }
    for step in &config.steps {
        let emits: Vec<&str> = step.emits.iter().map(|emit| emit.topic()).collect();
        println!(
            "{:<32} {:<6} subscribes=[{}] emits=[{}]",
            step.name,
            step.step_type.to_string(),
            step.subscribes.join(", "),
            emits.join(", ")
        );
    }
    Ok(())
}

async fn run_emit(config: EngineConfig, topic: String, data: &str, flows: Vec<String>, wait: Duration) -> Result<()> {
    let data: Value = serde_json::from_str(data).context("--data must be valid JSON")?;
    let engine = Engine::from_config(config).await?;
    let trace = engine.trigger(topic, data, flows);

    let settled = tokio::time::timeout(wait, engine.dispatcher().wait_trace(&trace.trace_id))
        .await
        .is_ok();
    if !settled {
        warn!(trace_id = %trace.trace_id, "Trace still running after {wait:?}");
    }

    let collector = engine.collector();
    for entry in collector.for_trace(&trace.trace_id, usize::MAX) {
        println!("{}", collector.render(&entry));
    }
    let group = engine.trace_store().and_then(|store| store.group(&trace.trace_id));
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({"traceId": trace.trace_id, "group": group}))?
    );

    engine.shutdown().await;
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use threadline_sync::{Engine, SyncConfig, TriggerReason};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[derive(Debug, Parser)]
#[command(name = "threadline")]
#[command(about = "Threadline conversation and profile sync engine")]
struct Cli {
    /// YAML config file. Defaults to `THREADLINE_CONFIG`, then `./threadline.yaml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the local HTTP dispatcher.
    Serve {
        #[arg(long, env = "THREADLINE_WEB_ADDR", default_value = "127.0.0.1:8790")]
        addr: SocketAddr,
    },
    /// Extract and sync one conversation thread now.
    SyncThread { url: String },
    /// Run one profile ingestion pass and flush what it queued.
    Ingest,
    /// Print the effective configuration.
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = match &cli.config {
        Some(path) => SyncConfig::load(Some(path.as_path())),
        None => SyncConfig::from_env(),
    }
    .context("loading threadline config")?;

    match cli.command.unwrap_or(Commands::Serve {
        addr: SocketAddr::from(([127, 0, 0, 1], 8790)),
    }) {
        Commands::Serve { addr } => {
            let engine = Arc::new(Engine::from_config(config)?);
            threadline_web::serve(engine, addr).await?;
        }
        Commands::SyncThread { url } => {
            let engine = Engine::from_config(config)?;
            let outcome = engine.trigger_thread_sync(&url).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            engine.shutdown().await;
        }
        Commands::Ingest => {
            let engine = Engine::from_config(config)?;
            engine.controller().start();
            let trigger = engine.controller().trigger(TriggerReason::Manual).await;
            info!(?trigger, queued = engine.diagnostics().queue_length, "ingestion pass finished");
            let mut flushed = Vec::new();
            while engine.diagnostics().queue_length > 0 {
                let outcome = engine.flush().await;
                let sent = matches!(outcome, threadline_sync::FlushOutcome::Sent { .. });
                flushed.push(outcome);
                if !sent {
                    break;
                }
            }
            let shutdown = engine.shutdown().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "trigger": trigger,
                    "flushes": flushed,
                    "shutdown": shutdown,
                    "diagnostics": engine.diagnostics(),
                }))?
            );
        }
        Commands::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}

fn init_tracing(debug: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(if debug { "debug" } else { "info" })
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

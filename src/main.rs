mod config;
mod engine;
mod ml;
mod server;
mod types;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{EngineConfig, EngineProfile, LoggingSettings};
use server::EngineServer;

#[derive(Parser)]
#[command(name = "regime-engine")]
#[command(author = "Trading Bot")]
#[command(version = "0.1.0")]
#[command(about = "Streaming market-regime classifier for an external trading client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (optional; defaults apply when missing)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine profile, overriding the one in the configuration file
    #[arg(long, value_enum, global = true)]
    profile: Option<EngineProfile>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the line-delimited JSON engine over TCP
    Serve {
        /// Bind address (default from config)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (default from config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Feed a JSONL file of bar requests through a fresh session, printing each response
    Replay {
        /// Input file, one `{"bar": {...}}` request per line
        file: PathBuf,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = EngineConfig::load(&cli.config)?;
    if let Some(profile) = cli.profile {
        cfg.profile = Some(profile);
        cfg.apply_profile();
    }

    init_logging(&cfg.logging, cli.verbose)?;

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                cfg.server.host = host;
            }
            if let Some(port) = port {
                cfg.server.port = port;
            }
            cfg.validate().map_err(|errors| anyhow!("invalid configuration: {}", errors.join(", ")))?;
            run_server(cfg).await?;
        }
        Commands::Replay { file } => {
            let stdout = io::stdout();
            let stats = engine::replay_file(&cfg, &file, BufWriter::new(stdout.lock()))?;
            info!("Replay finished: {} bars, {} errors", stats.bars, stats.errors);
        }
        Commands::ShowConfig => {
            print!("{}", cfg.to_toml()?);
        }
    }

    Ok(())
}

/// Logs go to stderr so replay output on stdout stays machine-readable.
fn init_logging(settings: &LoggingSettings, verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { settings.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if settings.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn run_server(cfg: EngineConfig) -> Result<()> {
    let profile = cfg.profile.unwrap_or(if cfg.filter.enabled {
        EngineProfile::RegimeWithFilter
    } else {
        EngineProfile::RegimeOnly
    });
    info!("Regime engine v0.1.0");
    info!("Profile: {} ({})", profile.name(), profile.description());
    info!(
        "Regime: min_train={} retrain_every={} p_strong={:.2} | filter: enabled={} backend={:?}",
        cfg.regime.min_train,
        cfg.regime.retrain_every,
        cfg.regime.p_strong,
        cfg.filter.enabled,
        cfg.filter.backend
    );

    let server = EngineServer::new(cfg);
    let listener = server.bind().await?;
    server
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c, running until killed: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
}

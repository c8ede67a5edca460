// ABOUTME: CLI entry point for table-relay
// ABOUTME: Parses commands and routes to setup, status, and the polling loop

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use table_relay::config::RelayConfig;
use table_relay::state::WatermarkStore;
use table_relay::tracker::{EntityKind, PollOptions, Poller, TrackedEntityRegistry};

#[derive(Parser)]
#[command(name = "table-relay")]
#[command(
    about = "Relay row-level changes from PostgreSQL change-tracking logs to pluggable sinks",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "TABLE_RELAY_LOG", default_value = "info")]
    log: String,
    /// Override the watermark state file path
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll configured entities and relay change batches to the sink
    Run {
        /// Path to the relay configuration file
        #[arg(long, default_value = "relay.toml")]
        config: PathBuf,
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Run as a background daemon (Unix only)
        #[arg(long)]
        daemon: bool,
        /// Stop a running daemon
        #[arg(long)]
        stop: bool,
        /// Show status of the daemon
        #[arg(long)]
        daemon_status: bool,
    },
    /// Enable change tracking for configured entities without polling
    Setup {
        /// Path to the relay configuration file
        #[arg(long, default_value = "relay.toml")]
        config: PathBuf,
    },
    /// Print per-entity watermarks and last-run timestamps
    Status {
        /// Path to the relay configuration file
        #[arg(long, default_value = "relay.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run {
            config,
            once,
            daemon,
            stop,
            daemon_status,
        } => run(config, once, daemon, stop, daemon_status, cli.state).await,
        Commands::Setup { config } => setup(config, cli.state).await,
        Commands::Status { config } => status(config, cli.state).await,
    }
}

fn load_config(path: &PathBuf, state_override: Option<PathBuf>) -> Result<RelayConfig> {
    let mut config = RelayConfig::load(path)?;
    if state_override.is_some() {
        config.relay.state_path = state_override;
    }
    Ok(config)
}

fn state_path(config: &RelayConfig) -> PathBuf {
    config
        .relay
        .state_path
        .clone()
        .unwrap_or_else(WatermarkStore::default_path)
}

async fn run(
    config_path: PathBuf,
    once: bool,
    daemon: bool,
    stop: bool,
    daemon_status: bool,
    state_override: Option<PathBuf>,
) -> Result<()> {
    // Daemon control commands work without a readable configuration.
    #[cfg(unix)]
    {
        if stop {
            return match table_relay::daemon::stop_daemon()? {
                true => {
                    println!("Daemon stopped successfully");
                    Ok(())
                }
                false => {
                    println!("No daemon was running");
                    Ok(())
                }
            };
        }
        if daemon_status {
            return table_relay::daemon::print_status();
        }
    }

    #[cfg(not(unix))]
    if daemon || stop || daemon_status {
        anyhow::bail!("Daemon mode is only supported on Unix");
    }

    let config = load_config(&config_path, state_override)?;

    #[cfg(unix)]
    if daemon {
        table_relay::daemon::daemonize()?;
    }

    let registry = TrackedEntityRegistry::from_config(&config).await?;
    let sink = table_relay::sink::from_config(&config.sink)?;
    let store = WatermarkStore::open(&state_path(&config)).await?;
    let options = PollOptions::from_config(&config);
    let mut poller = Poller::new(registry, sink, store, options);

    if once {
        let stats = poller.run_once().await;
        println!(
            "Polled {} entities, delivered {} changes in {}ms",
            stats.entities_polled, stats.changes_delivered, stats.duration_ms
        );
        if !stats.is_success() {
            for error in &stats.errors {
                eprintln!("  {}", error);
            }
            anyhow::bail!("{} entity cycles failed", stats.errors.len());
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down after the in-flight cycle");
            let _ = signal_tx.send(());
        }
    });

    poller.run(shutdown_rx).await?;

    #[cfg(unix)]
    if daemon {
        table_relay::daemon::cleanup()?;
    }

    Ok(())
}

async fn setup(config_path: PathBuf, state_override: Option<PathBuf>) -> Result<()> {
    let config = load_config(&config_path, state_override)?;
    let registry = TrackedEntityRegistry::from_config(&config).await?;

    println!("Registered {} entities:", registry.len());
    for entity in registry.entities() {
        let kind = match entity.kind {
            EntityKind::Table => "table",
            EntityKind::Procedure => "procedure",
        };
        println!("  {} ({})", entity.id, kind);
    }

    Ok(())
}

async fn status(config_path: PathBuf, state_override: Option<PathBuf>) -> Result<()> {
    let config = load_config(&config_path, state_override)?;
    let store = WatermarkStore::open(&state_path(&config)).await?;

    if store.entries().count() == 0 {
        println!("No entities have been polled yet.");
        return Ok(());
    }

    println!("{:<45} {:>12}  {}", "ENTITY", "VERSION", "LAST RUN");
    for (name, watermark) in store.entries() {
        let version = watermark
            .version
            .map(|v| v.to_string())
            .unwrap_or_else(|| "never".to_string());
        let last_run = watermark
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!("{:<45} {:>12}  {}", name, version, last_run);
    }

    Ok(())
}

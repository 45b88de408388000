use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sessionpool::clock::SystemClock;
use sessionpool::config::Config;
use sessionpool::control::ControlSurface;
use sessionpool::lifecycle::reconcile::reconcile_offline;
use sessionpool::lifecycle::LifecycleManager;
use sessionpool::network::gateway::GatewayBinding;
use sessionpool::protocol::{serve, LineWriter, ServeExit};
use sessionpool::registry::Registry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sessionpool")]
#[command(about = "Keeps one network session alive per tenant on behalf of paired controllers")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Restore sessions and serve the control channel on stdin/stdout
    Run,
    /// Remove ghost sessions from storage and print what was removed
    Reconcile,
    /// Print previously-active tenants and controller pairings
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;
    let paths = config.storage_paths()?;

    let logs_dir = paths.logs_dir();
    sessionpool::logging::init(
        &config.log_level,
        config.log_to_file.then_some(logs_dir.as_path()),
    )?;
    tracing::debug!(sha = sessionpool::BUILD_SHA, root = %paths.root().display(), "starting");

    let registry = Registry::open(paths, Arc::new(SystemClock))?;

    match cli.command {
        Command::Run => run(config, registry).await,
        Command::Reconcile => {
            let report = reconcile_offline(&registry).await;
            print_json(&report)
        }
        Command::List => {
            let listing = serde_json::json!({
                "active": registry.active().list(),
                "pairings": registry.pairings().entries(),
            });
            print_json(&listing)
        }
    }
}

async fn run(config: Config, registry: Arc<Registry>) -> Result<()> {
    let output = Arc::new(LineWriter::new(tokio::io::stdout()));
    let binding = Arc::new(GatewayBinding::new(config.gateway_addr.clone()));
    let manager = LifecycleManager::new(registry.clone(), binding, output.clone(), config.lifecycle());

    let sweeper_cancel = CancellationToken::new();
    let sweeper = registry
        .entitlements()
        .clone()
        .spawn_sweeper(config.sweep_interval(), sweeper_cancel.clone());

    let restored = manager.restore_all().await;
    tracing::info!(restored, "sessions restored");

    if config.owner().is_none() {
        tracing::warn!("no owner_id configured; owner-only commands are unavailable");
    }
    let surface = Arc::new(ControlSurface::new(
        manager.clone(),
        output.clone(),
        config.owner(),
    ));

    let exit = tokio::select! {
        exit = serve(tokio::io::stdin(), surface, output) => exit?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for shutdown signal")?;
            tracing::info!("interrupted");
            ServeExit::Eof
        }
    };

    if exit == ServeExit::Restart {
        tracing::info!(
            delay_secs = config.restart_delay_secs,
            "ghost sessions removed; restarting"
        );
        tokio::time::sleep(config.restart_delay()).await;
    }

    sweeper_cancel.cancel();
    let _ = sweeper.await;
    manager.shutdown().await;

    if exit == ServeExit::Restart {
        // A supervisor brings the process back with the cleaned tables.
        std::process::exit(0);
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

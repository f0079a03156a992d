//! Patch Surface - one unit of the virtual patching network
//!
//! Runs the control loop of a panel against the multicast patch network.

use anyhow::{Context, Result};
use clap::Parser;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod cli;
mod sniffer;

use patch_surface::config::{AppConfig, ConfigWatcher, LoggingConfig};
use patch_surface::hardware::SimPanel;
use patch_surface::patch::export::{export_csv, import_csv};
use patch_surface::patch::{PatchSnapshot, PersistenceActor, PersistenceHandle};
use patch_surface::paths::AppPaths;
use patch_surface::transport::UdpTransport;
use patch_surface::ControlLoop;

/// Patch Surface - control surface and virtual patching for networked synth units
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (defaults to the platform data directory)
    #[arg(short, long)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Drive a simulated panel from an interactive prompt
    #[arg(long)]
    simulate: bool,

    /// Print every datagram on the patch network and exit on Ctrl+C
    #[arg(long)]
    sniff: bool,

    /// Print the JSON schemas of the config file and patch snapshot
    #[arg(long)]
    print_schema: bool,

    /// Write the stored connections to a CSV file and exit
    #[arg(long, value_name = "PATH")]
    export_csv: Option<PathBuf>,

    /// Replace the stored connections with a CSV file and exit
    #[arg(long, value_name = "PATH")]
    import_csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if args.print_schema {
        print_schemas()?;
        return Ok(());
    }

    let paths = AppPaths::detect();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| paths.config.display().to_string());
    let config = AppConfig::load(&config_path).await?;

    let _log_guard = init_logging(&args.log_level, args.log_json, config.logging.as_ref())?;

    info!("Starting Patch Surface v{}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", config_path);

    if args.sniff {
        return sniffer::run_cli_sniffer(&config.network).await;
    }

    paths.ensure_directories()?;
    let db_path = config
        .persistence
        .path
        .clone()
        .unwrap_or_else(|| paths.patch_db_path(config.unit.id).display().to_string());
    let persistence = PersistenceActor::spawn(
        &db_path,
        config.persistence.debounce_ms,
        config.persistence.export_csv.as_ref().map(PathBuf::from),
    )?;

    if let Some(path) = &args.export_csv {
        return export_stored(&persistence, path).await;
    }
    if let Some(path) = &args.import_csv {
        return import_stored(&persistence, config.unit.id, path).await;
    }

    run_app(args.simulate, config_path, persistence).await?;

    info!("Patch Surface shutdown complete");
    Ok(())
}

async fn run_app(simulate: bool, config_path: String, persistence: PersistenceHandle) -> Result<()> {
    let (config_watcher, initial_config) = ConfigWatcher::new(config_path).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let (transport, inbox) = UdpTransport::bind(&initial_config.network, initial_config.unit.id).await?;

    // No register driver is wired in yet; a headless unit still takes part in
    // the network and answers state inquiries
    let sim = SimPanel::new();
    if !simulate {
        warn!("No panel driver configured, running headless");
    }

    let mut control = ControlLoop::new(
        &initial_config,
        Arc::new(sim.clone()),
        Arc::new(sim.clone()),
        Box::new(transport),
        inbox,
    );

    match persistence.load().await {
        Ok(Some(snapshot)) => control.restore(&snapshot),
        Ok(None) => info!("No stored patch, starting empty"),
        Err(e) => warn!("Failed to load stored patch: {:#}", e),
    }
    let control = control.with_persistence(persistence);

    if simulate {
        let status = control.subscribe_status();
        let reader = control.knob_reader();
        let config = (*initial_config).clone();
        let repl = tokio::task::spawn_blocking(move || cli::run_repl(config, sim, status, reader));

        let shutdown = async {
            tokio::select! {
                result = repl => match result {
                    Ok(Ok(())) => info!("Prompt closed"),
                    Ok(Err(e)) => warn!("Prompt failed: {:#}", e),
                    Err(e) => warn!("Prompt task failed: {}", e),
                },
                _ = shutdown_signal() => {}
            }
        };
        control.run(Some(config_watcher), shutdown).await;
    } else {
        control.run(Some(config_watcher), shutdown_signal()).await;
    }

    Ok(())
}

fn print_schemas() -> Result<()> {
    let config = schemars::schema_for!(AppConfig);
    let snapshot = schemars::schema_for!(PatchSnapshot);
    println!("{}", serde_json::to_string_pretty(&config)?);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn export_stored(persistence: &PersistenceHandle, path: &Path) -> Result<()> {
    let snapshot = persistence
        .load()
        .await?
        .context("No stored patch to export")?;
    export_csv(path, &snapshot.connections).await?;
    println!("Exported {} connections to {}", snapshot.connections.len(), path.display());
    Ok(())
}

async fn import_stored(persistence: &PersistenceHandle, unit: u16, path: &Path) -> Result<()> {
    let connections = import_csv(path).await?;
    let mut snapshot = match persistence.load().await? {
        Some(snapshot) => snapshot,
        None => PatchSnapshot::empty(unit),
    };
    snapshot.connections = connections;
    snapshot.saved_at = chrono::Utc::now();

    let count = snapshot.connections.len();
    persistence.save(snapshot)?;
    persistence.flush().await?;
    persistence.shutdown();
    println!("Imported {} connections from {}", count, path.display());
    Ok(())
}

fn init_logging(level: &str, json: bool, logging: Option<&LoggingConfig>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let console = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    let (file_layer, guard) = match logging.and_then(|l| l.directory.as_ref().map(|d| (d, &l.file_prefix))) {
        Some((directory, prefix)) => {
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory: {}", directory))?;
            let appender = tracing_appender::rolling::daily(directory, prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn shutdown_signal() -> impl Future<Output = ()> {
    async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    }
}

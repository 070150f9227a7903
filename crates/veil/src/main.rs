//! Veil: local VPN connection supervisor
//!
//! Command-line front end for `veil-core`. Connects through a shareable
//! link, keeps the engine supervised until Ctrl+C, then restores the host's
//! proxy settings.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use veil_core::{
    ConnectionDescriptor, ConnectionManager, Settings, StatsStore, TransportConfigBuilder,
    format_bytes,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "veil", version, about = "Local VPN connection supervisor", long_about = None)]
struct Args {
    /// Settings file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides RUST_LOG
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect and stay connected until Ctrl+C
    Connect {
        /// Connection link, e.g. vless://uuid@host:443?security=tls#Name
        uri: String,

        /// Seconds between traffic reports
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },

    /// Print the parsed link and the engine config it produces
    Inspect {
        uri: String,
    },

    /// Print persisted traffic totals
    Stats,

    /// Write a settings file with every default filled in
    InitConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::InitConfig { output, force } = &args.command {
        init_logging(args.log_level.as_deref(), "info");
        return init_config(output.clone(), *force);
    }

    let settings = load_settings(args.config.as_deref())?;
    init_logging(args.log_level.as_deref(), &settings.logging.level);

    match args.command {
        Commands::Connect {
            uri,
            stats_interval,
        } => connect(settings, &uri, Duration::from_secs(stats_interval.max(1))).await,
        Commands::Inspect { uri } => inspect(&settings, &uri),
        Commands::Stats => {
            print_stats(&settings);
            Ok(())
        }
        Commands::InitConfig { .. } => Ok(()),
    }
}

/// CLI flag, then RUST_LOG, then the settings file
fn init_logging(flag: Option<&str>, configured: &str) {
    let filter = match flag {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(configured)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    if let Some(path) = path {
        return Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()));
    }

    match Settings::default_path() {
        Some(path) if path.exists() => Settings::from_file(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        _ => Ok(Settings::default()),
    }
}

async fn connect(settings: Settings, uri: &str, interval: Duration) -> Result<()> {
    let manager = ConnectionManager::with_system_proxy(settings);

    // Subscribed first so a crash right after connecting is not missed
    let mut status = manager.subscribe();

    info!("Veil v{}", env!("CARGO_PKG_VERSION"));
    manager.connect(uri).await.context("Connection failed")?;

    let ports = manager.settings().ports;
    info!(
        "Local proxies: socks5 127.0.0.1:{} | http 127.0.0.1:{}",
        ports.socks, ports.http
    );

    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, disconnecting...");
                break;
            }
            _ = ticker.tick() => {
                let stats = manager.stats().await;
                info!(
                    "Session up {} down {} | total up {} down {}",
                    format_bytes(stats.session_uplink),
                    format_bytes(stats.session_downlink),
                    format_bytes(stats.cumulative_uplink.saturating_add(stats.session_uplink)),
                    format_bytes(stats.cumulative_downlink.saturating_add(stats.session_downlink)),
                );
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.state.is_error() {
                    let reason = current.error.unwrap_or_default();
                    error!("Connection lost: {}", reason);
                    for line in manager.engine_output().iter().rev().take(10).rev() {
                        warn!("engine: {}", line);
                    }
                    manager.disconnect().await;
                    bail!("Connection lost: {}", reason);
                }
            }
        }
    }

    let duration = manager.connection_duration();
    manager.disconnect().await;

    let stats = manager.stats().await;
    info!(
        "Disconnected after {:?} | total up {} down {}",
        duration.unwrap_or_default(),
        format_bytes(stats.cumulative_uplink),
        format_bytes(stats.cumulative_downlink)
    );
    Ok(())
}

fn inspect(settings: &Settings, uri: &str) -> Result<()> {
    let descriptor = ConnectionDescriptor::parse(uri).context("Invalid connection link")?;
    let config = TransportConfigBuilder::new(settings.ports)
        .with_log_level(settings.engine.log_level.clone())
        .build(&descriptor);

    let report = serde_json::json!({
        "descriptor": descriptor,
        "engine_config": config,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_stats(settings: &Settings) {
    let store = StatsStore::new(settings.stats_record_path());
    let totals = store.load();

    println!("Record:   {}", store.path().display());
    println!("Uplink:   {} ({} bytes)", format_bytes(totals.uplink), totals.uplink);
    println!("Downlink: {} ({} bytes)", format_bytes(totals.downlink), totals.downlink);
    println!("Total:    {}", format_bytes(totals.total()));
}

fn init_config(output: Option<PathBuf>, force: bool) -> Result<()> {
    let path = match output.or_else(Settings::default_path) {
        Some(path) => path,
        None => bail!("No config directory on this platform, pass --output"),
    };

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    Settings::default()
        .to_file(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Settings written to {}", path.display());
    Ok(())
}

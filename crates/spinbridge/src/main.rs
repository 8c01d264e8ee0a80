//! spinbridge - BLE fitness sensors to an HTTP metrics endpoint.
//!
//! Run with: `sudo spinbridge` (adapter management needs root).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use spinbridge::{Config, format_radio_table};
use spinbridge_core::{
    AdapterHealthManager, Bridge, BtleplugCentral, HttpSink, SystemHost,
};

/// Timeout for each host command (`systemctl`, `hciconfig`).
const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Bridge BLE cycling and heart-rate sensors to an HTTP metrics endpoint.
#[derive(Parser, Debug)]
#[command(name = "spinbridge")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "SPINBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Radio index to use (overrides config and vendor matching).
    #[arg(long, global = true, env = "SPINBRIDGE_ADAPTER_INDEX")]
    adapter: Option<u32>,

    /// Metrics endpoint (overrides config).
    #[arg(long, global = true, env = "SPINBRIDGE_SINK_URL")]
    sink_url: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge in the foreground (default behavior).
    Run,

    /// Check adapter preconditions and list radios without starting the bridge.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = match args.verbose {
        0 => "spinbridge=info,spinbridge_core=info",
        1 => "spinbridge=debug,spinbridge_core=debug",
        _ => "spinbridge=trace,spinbridge_core=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(&args)?;

    match args.command {
        Some(Command::Check) => check(&config).await,
        Some(Command::Run) | None => run_bridge(&config).await,
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };

    // Override config with CLI args and environment
    if let Some(index) = args.adapter {
        config.adapter.index = Some(index);
    }
    if let Some(url) = &args.sink_url {
        config.sink.url = url.clone();
    }

    config.validate()?;
    Ok(config)
}

async fn check(config: &Config) -> anyhow::Result<()> {
    let host = Arc::new(SystemHost::new(HOST_COMMAND_TIMEOUT));
    let mut health = AdapterHealthManager::new(host, config.adapter_settings());

    let result = health.initialize().await;
    match health.list_radios().await {
        Ok(radios) => println!("{}", format_radio_table(&radios, health.bound_index())),
        Err(e) => eprintln!("Failed to list radios: {}", e),
    }

    let index = result.context("adapter preconditions failed")?;
    println!("Ready: using hci{}", index);
    Ok(())
}

async fn run_bridge(config: &Config) -> anyhow::Result<()> {
    let bridge_config = config.bridge_config()?;

    info!("spinbridge {} starting", env!("CARGO_PKG_VERSION"));
    for device in &bridge_config.devices {
        let characteristics: Vec<String> =
            device.characteristics.iter().map(|c| c.to_string()).collect();
        info!(
            "Device: {} ({}) -> {}",
            device.name,
            device.address,
            characteristics.join(", ")
        );
    }
    info!("Publishing to {} every {:?}", config.sink.url, bridge_config.publish_interval);

    let host = Arc::new(SystemHost::new(HOST_COMMAND_TIMEOUT));
    let mut health = AdapterHealthManager::new(host, config.adapter_settings());
    let index = health
        .initialize()
        .await
        .context("adapter preconditions failed")?;

    let central = BtleplugCentral::bind(index)
        .await
        .with_context(|| format!("failed to bind BLE stack to hci{}", index))?;
    let sink = HttpSink::new(&config.sink.url, config.sink_timeout())?;

    let bridge = Bridge::new(
        bridge_config,
        Arc::new(central),
        Arc::new(sink),
        Arc::new(health),
    )?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("Received shutdown signal");
            shutdown.cancel();
        }
    });

    bridge.run(shutdown).await?;
    info!("spinbridge stopped");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

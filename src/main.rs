// src/main.rs - GPIO-BACnet bridge entry point
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

use gpio_bacnet_bridge::{load_config_or_default, Bridge, HardwareCapability};

#[derive(Parser, Debug)]
#[command(
    name = "gpio-bacnet-bridge",
    version,
    about = "Expose Raspberry Pi GPIO pins as BACnet objects"
)]
struct Args {
    /// Settings file
    #[arg(short, long, default_value = "bridge.toml")]
    config: PathBuf,

    /// Never touch GPIO hardware
    #[arg(long)]
    simulate: bool,

    /// Do not build or start the protocol stack
    #[arg(long)]
    no_stack: bool,

    /// Log level when RUST_LOG is unset (overrides the settings file)
    #[arg(long)]
    log_level: Option<String>,
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let args = Args::parse();

    // Logging starts with a bootstrap level so settings errors are visible; the
    // filter is swapped once the settings file has been read.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let bootstrap = args.log_level.as_deref().unwrap_or("info");
    let initial = env_filter.unwrap_or_else(|| EnvFilter::new(bootstrap));
    let (filter, filter_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let mut settings = load_config_or_default(&args.config)?;
    if args.simulate {
        settings.gpio.simulate = true;
    }

    if !from_env && args.log_level.is_none() {
        if let Err(e) = filter_handle.reload(EnvFilter::new(&settings.logging.level)) {
            tracing::warn!("Failed to apply log level '{}': {}", settings.logging.level, e);
        }
    }

    tracing::info!("Starting GPIO-BACnet bridge {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Device {} ({}) on UDP port {}",
        settings.device.id,
        settings.device.name,
        settings.network.port
    );

    let capability = HardwareCapability::detect(&settings.gpio);
    let bridge = Bridge::open(settings, capability).await?;

    if args.no_stack {
        tracing::info!("Protocol stack disabled on the command line");
    } else if let Err(e) = bridge.start_stack().await {
        tracing::error!("Failed to start protocol stack: {}", e);
        for line in bridge.stack_diagnostics() {
            tracing::error!("  {}", line);
        }
    }

    shutdown_signal().await;
    bridge.shutdown().await;
    tracing::info!("Bridge stopped");
    Ok(())
}

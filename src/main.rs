//! Tunerbridge - HDHomeRun discovery across network boundaries
//!
//! Run `tunerbridge app` on the network with the tuner and `tunerbridge tuner`
//! on the network with the applications.

mod config;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use config::{AppMode, RelayConfig, TunerMode, TEMPLATE_FILE};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunerbridge_relay::{default_capture_ip, AppRelay, ClientRelay, DirectRelay};

/// Tunerbridge - relay HDHomeRun discovery broadcasts between networks
#[derive(Parser, Debug)]
#[command(name = "tunerbridge")]
#[command(about = "Relay HDHomeRun discovery broadcasts between networks")]
#[command(version)]
#[command(long_version = concat!(
    env!("GIT_TAG"),
    "\nCommit: ", env!("GIT_HASH"),
    "\nBuilt: ", env!("BUILD_TIME"),
))]
struct Cli {
    /// Path to config file (JSON)
    #[arg(short, long, global = true, env = "TUNERBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Write a template config file to ./tunerbridge.json and exit
    #[arg(long)]
    template: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run on the tuner's network
    #[command(long_about = r#"
Run on the network with the HDHomeRun. Accepts the tunnel from the tuner-side
relay and broadcasts each forwarded query on the local network.

With an HDHomeRun IP (argument or app.direct_hdhomerun_ip), runs in direct
mode instead: listens for discovery datagrams and unicasts them to that device.

EXAMPLES:
  tunerbridge app
  tunerbridge app 0.0.0.0 192.168.1.50
    "#)]
    App {
        /// Address to bind (default 0.0.0.0)
        bind_address: Option<String>,

        /// HDHomeRun IP for direct mode
        hdhomerun_ip: Option<String>,
    },

    /// Run on the applications' network
    #[command(long_about = r#"
Run on the network with the applications. Captures discovery broadcasts and
forwards them through the tunnel to the app-side relay, reconnecting as needed.

With --direct, HOST is the HDHomeRun itself and no tunnel is used.

EXAMPLES:
  tunerbridge tuner 10.10.10.9
  tunerbridge tuner 10.10.10.50 --direct
    "#)]
    Tuner {
        /// App-side relay host, or the HDHomeRun IP with --direct
        host: Option<String>,

        /// Forward straight to the HDHomeRun without a tunnel
        #[arg(long)]
        direct: bool,
    },
}

fn init_logging(debug: bool) -> Result<()> {
    let log_level = if debug { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.template {
        RelayConfig::write_template(Path::new(TEMPLATE_FILE))?;
        println!("Template config written to {}", TEMPLATE_FILE);
        return Ok(());
    }

    let (mut config, source) = RelayConfig::load(cli.config.as_deref())?;
    config.debug |= cli.debug;

    init_logging(config.debug)?;
    info!("{}", source);

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        std::process::exit(1);
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let result = match command {
        Commands::App {
            bind_address,
            hdhomerun_ip,
        } => {
            let mode = config.app_mode(bind_address, hdhomerun_ip)?;
            run_app(mode, &config, shutdown).await
        }
        Commands::Tuner { host, direct } => {
            let mode = config.tuner_mode(host, direct)?;
            run_tuner(mode, &config, shutdown).await
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("Stopped");
    Ok(())
}

async fn run_app(mode: AppMode, config: &RelayConfig, shutdown: CancellationToken) -> Result<()> {
    match mode {
        AppMode::Tunnel { bind } => {
            let relay = AppRelay::bind(config.app_relay_config(bind))
                .await
                .context("Failed to start app relay")?;
            relay.run(shutdown).await?;
        }
        AppMode::Direct { bind, device } => {
            run_direct(bind, &device, config, shutdown).await?;
        }
    }

    Ok(())
}

async fn run_tuner(
    mode: TunerMode,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    match mode {
        TunerMode::Tunnel { host } => {
            let relay = ClientRelay::bind(config.client_relay_config(host))
                .await
                .context("Failed to start tuner relay")?;
            relay.run(shutdown).await?;
        }
        TunerMode::Direct { device } => {
            run_direct(default_capture_ip().into(), &device, config, shutdown).await?;
        }
    }

    Ok(())
}

async fn run_direct(
    listen_ip: IpAddr,
    device: &str,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let device_addr = resolve_device(device, config.discovery_port()).await?;

    let relay = DirectRelay::bind(config.direct_relay_config(listen_ip, device_addr))
        .await
        .context("Failed to start direct relay")?;
    relay.run(shutdown).await?;

    Ok(())
}

async fn resolve_device(device: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((device.trim(), port))
        .await
        .with_context(|| format!("Failed to resolve HDHomeRun address: {}", device))?
        .next()
        .with_context(|| format!("No addresses found for HDHomeRun: {}", device))
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping...");
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

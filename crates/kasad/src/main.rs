//! Kasa daemon - broker, device daemon and one-shot client
//!
//! # Usage
//!
//! ```bash
//! # Run the broker
//! kasad broker
//!
//! # Run a daemon registered as GATT against a simulated fleet
//! kasad daemon --identity GATT --simulate AA:BB:CC:DD:EE:FF,11:22:33:44:55:66
//!
//! # Send one request and print the reply
//! kasad request GATT connect AA:BB:CC:DD:EE:FF
//!
//! # Print the effective configuration
//! kasad --config ./kasa.toml config
//!
//! # Enable debug logging
//! RUST_LOG=kasad=debug kasad broker
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kasa_core::KasaConfig;
use kasad::broker::BrokerServer;
use kasad::client::{BrokerClient, ClientError};
use kasad::daemon::{spawn_manager, BrokerLink, ManagerOptions};
use kasad::link::sim::SimFleet;

/// Kasa - identity-routed device control
#[derive(Parser, Debug)]
#[command(name = "kasad", version, about)]
struct Args {
    /// Config file (defaults to $KASA_CONFIG, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the broker
    Broker {
        /// Client-facing listen address
        #[arg(long)]
        client_endpoint: Option<String>,
        /// Daemon-facing listen address
        #[arg(long)]
        daemon_endpoint: Option<String>,
    },
    /// Run a device daemon
    Daemon {
        /// Identity to register at the broker
        #[arg(short, long)]
        identity: Option<String>,
        /// Broker daemon endpoint
        #[arg(short, long)]
        broker: Option<String>,
        /// Serve a simulated fleet with these comma-separated device keys
        #[arg(long, value_delimiter = ',')]
        simulate: Option<Vec<String>>,
        /// Spawn sessions on first device command
        #[arg(long)]
        auto_connect: bool,
    },
    /// Send one request and print the reply
    Request {
        /// Broker client endpoint
        #[arg(short, long)]
        broker: Option<String>,
        /// `<identity> <command> <args…>`
        #[arg(required = true, trailing_var_arg = true)]
        payload: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("kasad=info".parse()?)
                .add_directive("kasa_core=info".parse()?)
                .add_directive("kasa_protocol=info".parse()?)
                .add_directive("kasa_actor=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = KasaConfig::load(args.config.as_deref()).context("Failed to load config")?;

    match args.command {
        Command::Broker {
            client_endpoint,
            daemon_endpoint,
        } => {
            if let Some(endpoint) = client_endpoint {
                config.broker.client_endpoint = endpoint;
            }
            if let Some(endpoint) = daemon_endpoint {
                config.broker.daemon_endpoint = endpoint;
            }
            run_broker(config).await
        }
        Command::Daemon {
            identity,
            broker,
            simulate,
            auto_connect,
        } => {
            if let Some(identity) = identity {
                config.daemon.identity = identity;
            }
            if let Some(broker) = broker {
                config.daemon.broker_endpoint = broker;
            }
            config.daemon.auto_connect |= auto_connect;
            config.validate().context("Invalid daemon options")?;
            run_daemon(config, simulate).await
        }
        Command::Request { broker, payload } => {
            let endpoint = broker.unwrap_or_else(|| dial_address(&config.broker.client_endpoint));
            run_request(&endpoint, config.broker.max_message_size, &payload.join(" ")).await
        }
        Command::Config => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

async fn run_broker(config: KasaConfig) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "Kasa broker starting"
    );

    let cancel_token = shutdown_token();
    let server = BrokerServer::bind(&config.broker, cancel_token)
        .await
        .context("Failed to start broker")?;

    server.run().await;

    info!("Kasa broker stopped");
    Ok(())
}

async fn run_daemon(config: KasaConfig, simulate: Option<Vec<String>>) -> Result<()> {
    let Some(keys) = simulate else {
        bail!("no hardware adapter built in; run with --simulate <keys>");
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        identity = %config.daemon.identity,
        devices = keys.len(),
        "Kasa daemon starting"
    );

    let fleet = SimFleet::with_devices(keys.iter().map(String::as_str));
    let cancel_token = shutdown_token();

    let options = ManagerOptions {
        links: Arc::new(fleet.clone()),
        discovery: Arc::new(fleet),
        session: config.session.clone(),
        auto_connect: config.daemon.auto_connect,
        discovery_window: config.daemon.discovery_window(),
    };
    let manager = spawn_manager(options, cancel_token.clone());

    let link = BrokerLink::new(
        &config.daemon,
        config.broker.max_message_size,
        manager,
        cancel_token.clone(),
    );

    let result = link.run().await;
    cancel_token.cancel();

    if let Err(e) = result {
        error!(error = %e, "Broker link failed");
        return Err(e.into());
    }

    info!("Kasa daemon stopped");
    Ok(())
}

async fn run_request(endpoint: &str, max_message_size: usize, payload: &str) -> Result<()> {
    let mut client = BrokerClient::connect(endpoint, max_message_size)
        .await
        .with_context(|| format!("Failed to connect to broker at {endpoint}"))?;

    match client.request(payload).await {
        Ok(reply) => {
            println!("{reply}");
            let _ = client.disconnect().await;
            Ok(())
        }
        Err(ClientError::Remote(failure)) => {
            let _ = client.disconnect().await;
            bail!(failure)
        }
        Err(e) => Err(e.into()),
    }
}

/// Turns a wildcard listen address into one a client can dial.
fn dial_address(endpoint: &str) -> String {
    match endpoint.strip_prefix("0.0.0.0:") {
        Some(port) => format!("127.0.0.1:{port}"),
        None => endpoint.to_string(),
    }
}

/// Creates the process-wide token and cancels it on SIGTERM/SIGINT.
fn shutdown_token() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();

    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    cancel_token
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

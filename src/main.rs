//! Entry point for `ethertunnel`.
//!
//! Parses CLI arguments and dispatches into either **switch** or **endpoint**
//! mode.  All protocol work lives in the library; `main.rs` owns only process
//! setup (logging, signal handling, argument parsing) and the endpoint's
//! reconnect policy.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use ethertunnel::config::{DeviceConfig, EndpointConfig, KeepaliveConfig, SwitchConfig, DEFAULT_PORT};
use ethertunnel::control::{Credentials, Lease, DEFAULT_NETWORK};
use ethertunnel::logging::{self, Logger};
use ethertunnel::pool::Subnet;
use ethertunnel::shutdown::Shutdown;
use ethertunnel::switch::Switch;
use ethertunnel::transport::Listener;

/// Virtual Ethernet overlay over TCP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the central switch.
    Switch {
        /// Local address to bind.
        #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
        bind: SocketAddr,
        /// Shared secret every endpoint must present.
        #[arg(long)]
        secret: Option<String>,
        /// Subnet addresses are leased from, per network.
        #[arg(long, default_value_t = Subnet::default())]
        subnet: Subnet,
        /// Seconds before a learned MAC binding expires (0 = never).
        #[arg(long, default_value_t = 300)]
        mac_max_age: u64,
    },
    /// Run an endpoint attached to a TAP interface.
    Endpoint {
        /// Switch host.
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        #[arg(short, long)]
        username: String,
        /// Broadcast domain to join.
        #[arg(short, long, default_value = DEFAULT_NETWORK)]
        network: String,
        #[arg(long)]
        secret: Option<String>,
        /// TAP interface name.
        #[arg(short, long, default_value = "tap0")]
        device: String,
        #[arg(long, default_value_t = 1400)]
        mtu: u32,
        /// Static address for the interface, e.g. 10.99.0.2/24.
        #[arg(long, conflicts_with = "request_address")]
        address: Option<Lease>,
        /// Ask the switch for an address.
        #[arg(long)]
        request_address: bool,
        /// Seconds between keepalive pings (0 disables).
        #[arg(long, default_value_t = 10)]
        keepalive: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default filter.
    logging::init("info");
    let log = Logger::default();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Switch {
            bind,
            secret,
            subnet,
            mac_max_age,
        } => {
            let config = SwitchConfig {
                bind,
                secret,
                subnet,
                mac_max_age: (mac_max_age > 0).then(|| Duration::from_secs(mac_max_age)),
                ..SwitchConfig::default()
            };
            run_switch(config, log).await
        }
        Mode::Endpoint {
            host,
            port,
            username,
            network,
            secret,
            device,
            mtu,
            address,
            request_address,
            keepalive,
        } => {
            let mut credentials = Credentials::new(username, network);
            if let Some(secret) = secret {
                credentials = credentials.with_secret(secret);
            }
            let config = EndpointConfig {
                host,
                port,
                credentials,
                device: DeviceConfig {
                    name: device,
                    mtu,
                    address,
                },
                request_address,
                keepalive: KeepaliveConfig {
                    interval: Duration::from_secs(keepalive),
                    ..KeepaliveConfig::default()
                },
                ..EndpointConfig::default()
            };
            run_endpoint(config, log).await
        }
    }
}

async fn run_switch(config: SwitchConfig, log: Logger) -> Result<()> {
    let listener = Listener::bind(config.bind)
        .await
        .with_context(|| format!("cannot listen on {}", config.bind))?;
    let switch = Switch::new(config, log.scoped("switch"));
    let shutdown = Shutdown::new();

    let server = {
        let switch = switch.clone();
        let listener_shutdown = shutdown.listener();
        tokio::spawn(async move { switch.serve(listener, listener_shutdown).await })
    };

    tokio::signal::ctrl_c().await.context("installing Ctrl-C handler")?;
    log::info!(target: log.target(), "interrupted; shutting down");
    shutdown.trigger();
    server.await.context("switch task panicked")??;
    log::info!(target: log.target(), "final metrics: {:?}", switch.metrics());
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_endpoint(config: EndpointConfig, log: Logger) -> Result<()> {
    use ethertunnel::endpoint::EndpointWorker;
    use ethertunnel::tap::TapProvider;
    use ethertunnel::transport::TcpConnector;

    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    let worker = EndpointWorker::new(config, TapProvider, TcpConnector::default(), log.scoped("endpoint"));
    let mut backoff = Duration::from_secs(1);

    loop {
        let outcome = tokio::select! {
            r = async {
                worker.start().await?;
                worker.join().await
            } => r,
            _ = tokio::signal::ctrl_c() => {
                log::info!(target: log.target(), "interrupted; leaving");
                worker.deinit().await.ok();
                return Ok(());
            }
        };
        match outcome {
            Err(e) if e.is_recoverable() => {
                log::warn!(target: log.target(), "{e}; reconnecting in {backoff:?}");
                let _ = worker.deinit().await;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e).context("endpoint failed"),
            Ok(()) => {
                log::info!(target: log.target(), "session ended");
                return Ok(());
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn run_endpoint(_config: EndpointConfig, _log: Logger) -> Result<()> {
    anyhow::bail!("endpoint mode needs a Linux TAP device")
}

// Chirp node: tracker service, interactive peer, and the multi-identity web bridge.

mod bridge;
mod cli;
mod client;
mod config;
mod http;
mod runtime;
mod tracker;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chirp_core::Tracker;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::bridge::Bridge;
use crate::runtime::{PeerRuntime, PeerSettings};

#[derive(Parser)]
#[command(name = "chirp", version, about = "Tracker-coordinated peer-to-peer chat")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the tracker HTTP service.
    Tracker {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Start an interactive peer.
    Peer {
        /// Name this peer registers under.
        username: String,
        /// Port for incoming peer connections.
        #[arg(long)]
        peer_port: Option<u16>,
        /// Tracker base URL; takes precedence over --tracker-ip/--tracker-port.
        #[arg(long)]
        tracker_url: Option<String>,
        #[arg(long)]
        tracker_ip: Option<String>,
        #[arg(long)]
        tracker_port: Option<u16>,
        /// IP to advertise to the tracker instead of the detected one.
        #[arg(long)]
        advertise_ip: Option<String>,
    },
    /// Run the HTTP bridge for browser clients.
    Bridge {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    init_logging(args.verbose);
    let cfg = config::load();

    match args.command {
        Command::Tracker { bind, port } => {
            let host = bind.unwrap_or(cfg.tracker_bind);
            let port = port.unwrap_or(cfg.tracker_port);
            let addr: SocketAddr = format!("{}:{}", host, port)
                .parse()
                .with_context(|| format!("invalid tracker bind address {}:{}", host, port))?;
            let shared = Arc::new(tokio::sync::Mutex::new(Tracker::new()));
            tokio::select! {
                res = tracker::run_tracker(addr, shared) => res.context("tracker stopped")?,
                res = shutdown_signal() => res?,
            }
        }
        Command::Peer {
            username,
            peer_port,
            tracker_url,
            tracker_ip,
            tracker_port,
            advertise_ip,
        } => {
            let tracker_url = match (tracker_url, tracker_ip, tracker_port) {
                (Some(url), _, _) => url,
                (None, None, None) => cfg.tracker_url.clone(),
                (None, ip, port) => format!(
                    "http://{}:{}",
                    ip.as_deref().unwrap_or("127.0.0.1"),
                    port.unwrap_or(cfg.tracker_port)
                ),
            };
            let (runtime, events) = PeerRuntime::start(PeerSettings {
                username,
                listen_port: peer_port.unwrap_or(cfg.peer_port),
                advertise_ip: advertise_ip.or(cfg.advertise_ip.clone()),
                tracker_url,
                read_timeout: cfg.read_timeout(),
            })
            .await
            .context("cannot start peer")?;
            cli::run(runtime, events).await?;
        }
        Command::Bridge { port } => {
            let addr = SocketAddr::from(([0, 0, 0, 0], port.unwrap_or(cfg.bridge_port)));
            let bridge = Arc::new(Bridge::new(&cfg.tracker_url, cfg.read_timeout()));
            tokio::select! {
                res = bridge::run_bridge(addr, bridge) => res.context("bridge stopped")?,
                res = shutdown_signal() => res?,
            }
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutting down");
    Ok(())
}

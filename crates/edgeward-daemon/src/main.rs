//! `edgeward` Daemon
//!
//! Keeps a supervised pool of HA connections from this host to the edge
//! until it is told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use edgeward_core::tracing_init::{daemon_filter, init_tracing};
use edgeward_daemon::tunnel::config::parse_edge_addrs;
use edgeward_daemon::tunnel::{
    ConnectedSignal, EdgeAddrs, ReconnectEvent, StaticEdge, Supervisor, TcpAuthenticator, TcpTunnelServer,
    TunnelConfig, TunnelError, reconnect_channel,
};

#[derive(Parser, Debug)]
#[command(name = "edgeward-daemon")]
#[command(version, about = "edgeward daemon - supervised HA connections to the edge")]
struct Args {
    /// Path to a JSON settings file, layered over the global settings.
    #[arg(long, env = "EDGEWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Edge address (host:port). Repeat to build the address pool.
    #[arg(long = "edge", value_name = "ADDR")]
    edge: Vec<String>,

    /// Number of concurrent HA connections to keep.
    #[arg(long)]
    ha_connections: Option<usize>,

    /// Reconnect retries before the backoff stops growing.
    #[arg(long)]
    retries: Option<u32>,

    /// Refresh and present a reconnect token on registration.
    #[arg(long)]
    use_reconnect_token: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = edgeward_core::config::load_config(args.config.as_deref())?;
    if !args.edge.is_empty() {
        config.edge.addrs = parse_edge_addrs(&args.edge)?;
    }
    if let Some(n) = args.ha_connections {
        config.supervisor.ha_connections = n;
    }
    if let Some(n) = args.retries {
        config.supervisor.retries = n;
    }
    if args.use_reconnect_token {
        config.supervisor.use_reconnect_token = true;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.log_json {
        config.logging.json = true;
    }
    config.validate()?;

    init_tracing(&daemon_filter(&config.logging.level), config.logging.json);

    let tunnel_config = TunnelConfig::from(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        client_id = %tunnel_config.client_id,
        ha_connections = tunnel_config.ha_connections,
        edge_addrs = config.edge.addrs.len(),
        "Starting edgeward-daemon"
    );

    let edge: Arc<dyn EdgeAddrs> = Arc::new(StaticEdge::new(config.edge.addrs.iter().copied())?);
    let mut supervisor = Supervisor::new(
        tunnel_config.clone(),
        Arc::clone(&edge),
        Arc::new(TcpTunnelServer),
    );
    if tunnel_config.use_reconnect_token {
        supervisor =
            supervisor.with_authenticator(Arc::new(TcpAuthenticator::new(edge, &tunnel_config)));
    }

    let cancel = CancellationToken::new();
    let connected = ConnectedSignal::new();
    let (reconnect_tx, mut reconnect_rx) = reconnect_channel();

    let ready = connected.clone();
    let ready_handle = tokio::spawn(async move {
        ready.wait().await;
        info!("First connection registered, daemon ready");
        notify_ready();
    });

    let events_handle = tokio::spawn(async move {
        loop {
            match reconnect_rx.recv().await {
                Ok(ReconnectEvent::Connected { index, addr }) => {
                    info!(index, addr = %addr, "Connection up");
                }
                Ok(ReconnectEvent::TokenRefreshed { refresh_after }) => {
                    info!(refresh_after_secs = refresh_after.as_secs(), "Reconnect token refreshed");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Reconnect event observer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let run = supervisor.run(cancel.clone(), connected, reconnect_tx);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
            cancel.cancel();
            run.await
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
            cancel.cancel();
            run.await
        }
    };
    ready_handle.abort();
    events_handle.abort();

    match result {
        Ok(()) | Err(TunnelError::Cancelled) => {
            info!("Daemon stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Supervisor stopped");
            Err(e.into())
        }
    }
}

/// Tell systemd the daemon is up (unix only).
#[cfg(unix)]
fn notify_ready() {
    // `true` unsets $NOTIFY_SOCKET so nothing we spawn notifies systemd.
    if let Err(e) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!(error = %e, "Failed to notify systemd");
    }
}

#[cfg(not(unix))]
const fn notify_ready() {}

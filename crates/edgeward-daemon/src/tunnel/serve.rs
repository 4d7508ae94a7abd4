//! The per-connection serving primitive the supervisor drives.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::BoxFuture;
use super::config::TunnelConfig;
use super::credential::ReconnectCredentialManager;
use super::error::TunnelError;
use super::events::ReconnectEvent;
use super::signal::ConnectedSignal;

/// Everything one serving call needs.
#[derive(Clone)]
pub struct ServeParams {
    pub cancel: CancellationToken,
    pub credentials: Arc<ReconnectCredentialManager>,
    pub config: Arc<TunnelConfig>,
    pub addr: SocketAddr,
    pub index: usize,
    /// Notify once the connection is registered with the edge.
    pub connected: ConnectedSignal,
    pub reconnect_tx: broadcast::Sender<ReconnectEvent>,
}

/// Establishes a connection to `params.addr`, registers it, and serves it
/// until it drops or `params.cancel` fires.
///
/// Must return promptly after cancellation. Returning `Ok(())` means the
/// connection ended without an error worth retrying.
pub trait TunnelServer: Send + Sync {
    fn serve(&self, params: ServeParams) -> BoxFuture<'_, Result<(), TunnelError>>;
}

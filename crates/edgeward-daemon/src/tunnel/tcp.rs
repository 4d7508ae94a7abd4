//! TCP transport to the edge.
//!
//! [`TcpTunnelServer`] dials the edge, registers the connection, and holds
//! the stream open until the edge closes it or the supervisor cancels.
//! Inbound bytes after registration are read and dropped; proxying lives
//! elsewhere. [`TcpAuthenticator`] runs reconnect-token round trips over
//! short-lived connections to any edge address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::BoxFuture;
use super::auth::{AuthOutcome, Authenticator, ReconnectToken};
use super::config::TunnelConfig;
use super::credential::ReconnectCredentialManager;
use super::edge::EdgeAddrs;
use super::error::TunnelError;
use super::events::{self, ReconnectEvent};
use super::serve::{ServeParams, TunnelServer};
use super::wire::{self, ClientFrame, EdgeFrame};

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTunnelServer;

impl TunnelServer for TcpTunnelServer {
    fn serve(&self, params: ServeParams) -> BoxFuture<'_, Result<(), TunnelError>> {
        Box::pin(serve_tcp(params))
    }
}

async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, TunnelError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TunnelError::Dial {
                addr,
                reason: e.to_string(),
            });
        }
        Err(_) => {
            return Err(TunnelError::Dial {
                addr,
                reason: format!("timed out after {}s", timeout.as_secs()),
            });
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(addr = %addr, error = %e, "Failed to set TCP_NODELAY");
    }
    Ok(stream)
}

/// Present the reconnect token only when every piece of the previous
/// session is known; otherwise register afresh.
fn registration_frame(
    credentials: &ReconnectCredentialManager,
    config: &TunnelConfig,
    index: usize,
) -> ClientFrame {
    let client_id = config.client_id.to_string();
    if config.use_reconnect_token {
        let previous = credentials.reconnect_token().and_then(|token| {
            Ok((
                token,
                credentials.event_digest()?,
                credentials.conn_digest(index)?,
            ))
        });
        match previous {
            Ok((token, event_digest, conn_digest)) => {
                debug!(index, "Registering with reconnect token");
                return ClientFrame::Reconnect {
                    client_id,
                    index,
                    token: token.as_str().to_owned(),
                    event_digest: String::from_utf8_lossy(&event_digest).into_owned(),
                    conn_digest: String::from_utf8_lossy(&conn_digest).into_owned(),
                };
            }
            Err(e) => debug!(index, error = %e, "Registering without reconnect token"),
        }
    }
    ClientFrame::Register { client_id, index }
}

async fn register(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    params: &ServeParams,
) -> Result<(), TunnelError> {
    let frame = registration_frame(&params.credentials, &params.config, params.index);
    wire::write_frame(writer, &frame).await?;

    let reply = tokio::time::timeout(params.config.dial_timeout, wire::read_frame(reader))
        .await
        .map_err(|_| TunnelError::Registration("edge did not answer registration".into()))??;
    match reply {
        Some(EdgeFrame::Registered {
            event_digest,
            conn_digest,
        }) => {
            params.credentials.set_event_digest(event_digest.into_bytes());
            params
                .credentials
                .set_conn_digest(params.index, conn_digest.into_bytes());
            Ok(())
        }
        Some(EdgeFrame::Duplicate) => Err(TunnelError::DuplicateRegistration { addr: params.addr }),
        Some(EdgeFrame::Rejected { reason }) => Err(TunnelError::Registration(reason)),
        Some(other) => Err(TunnelError::Protocol(format!(
            "unexpected reply to registration: {other:?}"
        ))),
        None => Err(TunnelError::Serve(format!(
            "edge at {} closed the connection during registration",
            params.addr
        ))),
    }
}

async fn serve_tcp(params: ServeParams) -> Result<(), TunnelError> {
    let (addr, index) = (params.addr, params.index);

    let stream = tokio::select! {
        res = dial(addr, params.config.dial_timeout) => res?,
        () = params.cancel.cancelled() => return Ok(()),
    };
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    tokio::select! {
        res = register(&mut reader, &mut writer, &params) => res?,
        () = params.cancel.cancelled() => return Ok(()),
    }

    info!(index, addr = %addr, "Connection registered");
    params.connected.notify();
    events::publish(&params.reconnect_tx, ReconnectEvent::Connected { index, addr });

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            () = params.cancel.cancelled() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    return Err(TunnelError::Serve(format!("edge at {addr} closed the connection")));
                }
                Ok(n) => trace!(index, bytes = n, "Discarding inbound bytes"),
                Err(e) => return Err(TunnelError::Serve(e.to_string())),
            },
        }
    }
}

/// Authenticates against whichever edge address [`EdgeAddrs::addr_for_rpc`]
/// hands out, one connection per round trip.
pub struct TcpAuthenticator {
    edge: Arc<dyn EdgeAddrs>,
    client_id: String,
    dial_timeout: Duration,
}

impl TcpAuthenticator {
    pub fn new(edge: Arc<dyn EdgeAddrs>, config: &TunnelConfig) -> Self {
        Self {
            edge,
            client_id: config.client_id.to_string(),
            dial_timeout: config.dial_timeout,
        }
    }

    async fn round_trip(&self, previous_attempts: u32) -> Result<AuthOutcome, TunnelError> {
        let addr = self.edge.addr_for_rpc()?;
        debug!(addr = %addr, previous_attempts, "Authenticating with edge");
        let (read_half, mut writer) = dial(addr, self.dial_timeout).await?.into_split();
        let mut reader = BufReader::new(read_half);

        let frame = ClientFrame::Authenticate {
            client_id: self.client_id.clone(),
            previous_attempts,
        };
        wire::write_frame(&mut writer, &frame).await?;

        let outcome = match wire::read_frame(&mut reader).await? {
            Some(EdgeFrame::AuthSuccess {
                token,
                refresh_after_secs,
            }) => AuthOutcome::Success {
                token: ReconnectToken::new(token),
                refresh_after: Duration::from_secs(refresh_after_secs),
            },
            Some(EdgeFrame::AuthUnknown {
                reason,
                refresh_after_secs,
            }) => AuthOutcome::Unknown {
                reason,
                refresh_after: Duration::from_secs(refresh_after_secs),
            },
            Some(EdgeFrame::AuthFail { reason }) => AuthOutcome::Fail { reason },
            Some(other) => {
                return Err(TunnelError::Protocol(format!(
                    "unexpected reply to authenticate: {other:?}"
                )));
            }
            None => return Err(TunnelError::Auth(format!("edge at {addr} hung up"))),
        };
        let _ = writer.shutdown().await;
        Ok(outcome)
    }
}

impl Authenticator for TcpAuthenticator {
    fn authenticate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        previous_attempts: u32,
    ) -> BoxFuture<'a, Result<AuthOutcome, TunnelError>> {
        Box::pin(async move {
            tokio::select! {
                res = self.round_trip(previous_attempts) => res,
                () = cancel.cancelled() => Err(TunnelError::Cancelled),
            }
        })
    }
}

//! Connection workers.
//!
//! Each worker is a detached task that owns one connection index until the
//! connection ends, then reports exactly one [`TunnelOutcome`]. The report
//! is sent from a drop guard so it also happens on panic or abort.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TunnelConfig;
use super::credential::ReconnectCredentialManager;
use super::edge::EdgeAddrs;
use super::error::TunnelError;
use super::events::ReconnectEvent;
use super::serve::{ServeParams, TunnelServer};
use super::signal::ConnectedSignal;

/// Index of the connection that is started first and retries on its own.
pub const FIRST_CONN_INDEX: usize = 0;

/// Edge errors the first connection tolerates on one address before
/// moving to another.
const MAX_EDGE_ERRORS_PER_ADDR: u32 = 2;

/// Final result of one worker.
#[derive(Debug)]
pub struct TunnelOutcome {
    pub index: usize,
    /// Last address tried, if one was obtained.
    pub addr: Option<SocketAddr>,
    pub error: Option<TunnelError>,
}

/// Sends the outcome when dropped.
struct OutcomeReporter {
    tx: mpsc::UnboundedSender<TunnelOutcome>,
    index: usize,
    addr: Option<SocketAddr>,
    error: Option<TunnelError>,
}

impl OutcomeReporter {
    const fn new(tx: mpsc::UnboundedSender<TunnelOutcome>, index: usize) -> Self {
        Self {
            tx,
            index,
            addr: None,
            // Overwritten by `finish`; survives only if the task dies early.
            error: Some(TunnelError::WorkerLost(index)),
        }
    }

    fn finish(mut self, result: Result<(), TunnelError>) {
        self.error = result.err();
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        let _ = self.tx.send(TunnelOutcome {
            index: self.index,
            addr: self.addr,
            error: self.error.take(),
        });
    }
}

/// Shared handles every worker needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub(crate) cancel: CancellationToken,
    pub(crate) edge: Arc<dyn EdgeAddrs>,
    pub(crate) server: Arc<dyn TunnelServer>,
    pub(crate) credentials: Arc<ReconnectCredentialManager>,
    pub(crate) config: Arc<TunnelConfig>,
    pub(crate) outcome_tx: mpsc::UnboundedSender<TunnelOutcome>,
    pub(crate) reconnect_tx: broadcast::Sender<ReconnectEvent>,
}

impl WorkerContext {
    /// Start the first connection. It retries edge errors itself.
    pub(crate) fn spawn_first_tunnel(&self, connected: ConnectedSignal) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut reporter = OutcomeReporter::new(ctx.outcome_tx.clone(), FIRST_CONN_INDEX);
            let result = ctx.run_first_tunnel(&mut reporter.addr, connected).await;
            reporter.finish(result);
        });
    }

    /// Start connection `index`. Its retries are the supervisor's job.
    pub(crate) fn spawn_tunnel(&self, index: usize, connected: ConnectedSignal) {
        let ctx = self.clone();
        tokio::spawn(async move {
            let mut reporter = OutcomeReporter::new(ctx.outcome_tx.clone(), index);
            let result = ctx.run_tunnel(index, &mut reporter.addr, connected).await;
            reporter.finish(result);
        });
    }

    async fn run_first_tunnel(
        &self,
        addr_slot: &mut Option<SocketAddr>,
        connected: ConnectedSignal,
    ) -> Result<(), TunnelError> {
        let mut addr = self.edge.addr_for(FIRST_CONN_INDEX)?;
        *addr_slot = Some(addr);
        info!(index = FIRST_CONN_INDEX, addr = %addr, "Starting first connection");

        let mut result = self.serve(addr, FIRST_CONN_INDEX, connected.clone()).await;
        let mut edge_errors = 0u32;
        while self.unused_addrs() {
            if self.cancel.is_cancelled() {
                return result;
            }
            match &result {
                Ok(()) => return result,
                Err(e) if e.is_edge_error() => edge_errors += 1,
                Err(_) => return result,
            }
            if edge_errors >= MAX_EDGE_ERRORS_PER_ADDR {
                addr = self.edge.different_addr_for(FIRST_CONN_INDEX)?;
                *addr_slot = Some(addr);
            }
            if let Err(e) = &result {
                warn!(
                    index = FIRST_CONN_INDEX,
                    addr = %addr,
                    edge_errors,
                    error = %e,
                    "First connection failed, retrying"
                );
            }
            result = self.serve(addr, FIRST_CONN_INDEX, connected.clone()).await;
        }
        result
    }

    async fn run_tunnel(
        &self,
        index: usize,
        addr_slot: &mut Option<SocketAddr>,
        connected: ConnectedSignal,
    ) -> Result<(), TunnelError> {
        let addr = self.edge.different_addr_for(index)?;
        *addr_slot = Some(addr);
        debug!(index, addr = %addr, "Starting connection");
        self.serve(addr, index, connected).await
    }

    async fn serve(
        &self,
        addr: SocketAddr,
        index: usize,
        connected: ConnectedSignal,
    ) -> Result<(), TunnelError> {
        self.server
            .serve(ServeParams {
                cancel: self.cancel.clone(),
                credentials: Arc::clone(&self.credentials),
                config: Arc::clone(&self.config),
                addr,
                index,
                connected,
                reconnect_tx: self.reconnect_tx.clone(),
            })
            .await
    }

    /// Whether the pool has spare addresses beyond one per connection.
    fn unused_addrs(&self) -> bool {
        self.edge.available_addrs() > self.config.ha_connections
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn reporter_sends_finished_result_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = OutcomeReporter::new(tx, 3);
        reporter.addr = Some("127.0.0.1:7844".parse().unwrap());
        reporter.finish(Err(TunnelError::Serve("eof".into())));

        let outcome = rx.recv().await.unwrap();
        assert_eq!(outcome.index, 3);
        assert!(outcome.addr.is_some());
        assert!(matches!(outcome.error, Some(TunnelError::Serve(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reporter_sends_success_as_no_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        OutcomeReporter::new(tx, 1).finish(Ok(()));
        let outcome = rx.recv().await.unwrap();
        assert!(outcome.error.is_none());
        assert!(outcome.addr.is_none());
    }

    #[tokio::test]
    async fn aborted_task_still_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(async move {
            let reporter = OutcomeReporter::new(tx, 2);
            let _ = started_tx.send(());
            std::future::pending::<()>().await;
            reporter.finish(Ok(()));
        });
        started_rx.await.unwrap();
        handle.abort();

        let outcome = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("outcome after abort")
            .unwrap();
        assert_eq!(outcome.index, 2);
        assert!(matches!(outcome.error, Some(TunnelError::WorkerLost(2))));
    }
}

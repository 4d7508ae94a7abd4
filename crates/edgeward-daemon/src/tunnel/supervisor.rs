//! Connection supervisor.
//!
//! Keeps `ha_connections` connections to the edge alive. The first
//! connection must come up before the rest are started one registration
//! interval apart. After that a single event loop reacts to worker
//! outcomes, the shared reconnect backoff timer, the reconnect token
//! refresh timer, and connected signals. All bookkeeping lives inside that
//! loop and is never shared with the workers.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Sleep, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::auth::Authenticator;
use super::backoff::BackoffHandler;
use super::config::TunnelConfig;
use super::credential::{ReconnectCredentialManager, RefreshStatus};
use super::edge::EdgeAddrs;
use super::error::TunnelError;
use super::events::{self, ReconnectEvent};
use super::serve::TunnelServer;
use super::signal::ConnectedSignal;
use super::worker::{TunnelOutcome, WorkerContext};

type Timer = Option<Pin<Box<Sleep>>>;

/// Supervises the pool of edge connections.
pub struct Supervisor {
    config: TunnelConfig,
    edge: Arc<dyn EdgeAddrs>,
    server: Arc<dyn TunnelServer>,
    authenticator: Option<Arc<dyn Authenticator>>,
    credentials: Arc<ReconnectCredentialManager>,
}

impl Supervisor {
    pub fn new(
        config: TunnelConfig,
        edge: Arc<dyn EdgeAddrs>,
        server: Arc<dyn TunnelServer>,
    ) -> Self {
        let credentials = Arc::new(ReconnectCredentialManager::new(
            config.ha_connections,
            &config.refresh_auth,
        ));
        Self {
            config,
            edge,
            server,
            authenticator: None,
            credentials,
        }
    }

    /// Use `authenticator` to keep a reconnect token fresh. Only takes
    /// effect when `use_reconnect_token` is set in the config.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Credential store shared with every connection.
    pub fn credentials(&self) -> Arc<ReconnectCredentialManager> {
        Arc::clone(&self.credentials)
    }

    /// Run until `cancel` fires or the pool can no longer be maintained.
    ///
    /// `connected` fires once the first connection is registered. Returns
    /// `Ok(())` after a clean shutdown, with every worker drained. Fails
    /// only if the first connection cannot be established. Once running,
    /// every lost connection is retried, including ones that found no
    /// free edge address.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        connected: ConnectedSignal,
        reconnect_tx: broadcast::Sender<ReconnectEvent>,
    ) -> Result<(), TunnelError> {
        // Workers hang off a child token so they never outlive this run,
        // even when the run future is dropped.
        let cancel = cancel.child_token();
        let _stop_workers = cancel.clone().drop_guard();
        self.clamp_ha_connections();

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let workers = WorkerContext {
            cancel: cancel.clone(),
            edge: Arc::clone(&self.edge),
            server: Arc::clone(&self.server),
            credentials: Arc::clone(&self.credentials),
            config: Arc::new(self.config.clone()),
            outcome_tx,
            reconnect_tx: reconnect_tx.clone(),
        };
        let mut tunnels = TunnelSet::default();
        let mut tunnels_active = self
            .initialize(&workers, &mut outcome_rx, &mut tunnels, connected)
            .await?;

        let mut backoff =
            BackoffHandler::new(self.config.retries, self.config.tunnel_retry_duration, true);
        let mut backoff_timer: Timer = None;

        let policy = self.config.refresh_auth.clone();
        let mut refresh_backoff =
            BackoffHandler::new(policy.max_backoff, policy.retry_duration, false);
        let mut refresh_timer: Timer = None;

        if self.config.use_reconnect_token
            && let Some(auth) = &self.authenticator
        {
            match self
                .refresh(&cancel, &mut refresh_backoff, auth.as_ref(), &reconnect_tx)
                .await
            {
                Ok(after) => refresh_timer = Some(Box::pin(sleep(after))),
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = policy.retry_duration.as_secs(),
                        "Initial reconnect token refresh failed"
                    );
                    refresh_timer = Some(Box::pin(sleep(policy.retry_duration)));
                }
            }
        }

        loop {
            let next_connected = tunnels.next_connected();
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(tunnels_active, "Shutting down, waiting for connections to close");
                    drain(&mut outcome_rx, tunnels_active).await;
                    return Ok(());
                }
                Some(outcome) = outcome_rx.recv() => {
                    tunnels_active = tunnels_active.saturating_sub(1);
                    let TunnelOutcome { index, addr, error } = outcome;
                    let Some(err) = error else {
                        debug!(index, "Connection closed without error");
                        continue;
                    };
                    // Exhaustion is retried too: the failed lookup gave the
                    // index's address back, so a later round can take it.
                    warn!(index, addr = ?addr, error = %err, "Tunnel disconnected");
                    tunnels.queue_retry(index);
                    if backoff_timer.is_none() {
                        // The connection backoff retries forever, so this
                        // fallback is never taken.
                        let delay = backoff
                            .next_delay()
                            .unwrap_or(self.config.tunnel_retry_duration);
                        info!(
                            delay_ms = delay.as_millis(),
                            retries = backoff.retries(),
                            at_ceiling = backoff.reached_max_retries(),
                            "Reconnecting after backoff"
                        );
                        backoff_timer = Some(Box::pin(sleep(delay)));
                    }
                }
                () = wait_timer(&mut backoff_timer) => {
                    backoff_timer = None;
                    let waiting = tunnels.take_waiting();
                    info!(count = waiting.len(), "Relaunching disconnected tunnels");
                    for index in waiting {
                        let signal = tunnels.launch(index);
                        workers.spawn_tunnel(index, signal);
                        tunnels_active += 1;
                    }
                }
                () = wait_timer(&mut refresh_timer) => {
                    refresh_timer = None;
                    let Some(auth) = &self.authenticator else { continue };
                    match self
                        .refresh(&cancel, &mut refresh_backoff, auth.as_ref(), &reconnect_tx)
                        .await
                    {
                        Ok(after) => refresh_timer = Some(Box::pin(sleep(after))),
                        // Leaving the timer unset disables refresh for good.
                        Err(e) => error!(
                            error = %e,
                            "Reconnect token refresh failed permanently, disabling refresh"
                        ),
                    }
                }
                index = wait_connected(next_connected) => {
                    if tunnels.mark_connected(index) {
                        debug!(index, "All tunnels connected, resetting backoff");
                        backoff.set_grace_period();
                    }
                }
            }
        }
    }

    fn clamp_ha_connections(&mut self) {
        let available = self.edge.available_addrs();
        if self.config.ha_connections > available {
            info!(
                requested = self.config.ha_connections,
                available,
                "Fewer edge addresses than requested HA connections, clamping"
            );
            self.config.ha_connections = available;
        }
    }

    /// Start the first connection, wait for it, then stage the rest.
    /// Returns how many workers were launched.
    async fn initialize(
        &self,
        workers: &WorkerContext,
        outcome_rx: &mut mpsc::UnboundedReceiver<TunnelOutcome>,
        tunnels: &mut TunnelSet,
        connected: ConnectedSignal,
    ) -> Result<usize, TunnelError> {
        workers.spawn_first_tunnel(connected.clone());
        tokio::select! {
            () = workers.cancel.cancelled() => {
                let _ = outcome_rx.recv().await;
                return Err(TunnelError::Cancelled);
            }
            Some(outcome) = outcome_rx.recv() => {
                return Err(outcome.error.unwrap_or_else(|| {
                    if workers.cancel.is_cancelled() {
                        TunnelError::Cancelled
                    } else {
                        TunnelError::Serve("first connection closed before registering".into())
                    }
                }));
            }
            () = connected.wait() => {}
        }

        let ha_connections = self.config.ha_connections;
        info!(ha_connections, "First connection established, starting the rest");
        let mut launched = 1;
        for index in 1..ha_connections {
            let signal = tunnels.launch(index);
            workers.spawn_tunnel(index, signal);
            launched += 1;
            if index + 1 < ha_connections {
                tokio::select! {
                    () = sleep(self.config.registration_interval) => {}
                    () = workers.cancel.cancelled() => break,
                }
            }
        }
        Ok(launched)
    }

    async fn refresh(
        &self,
        cancel: &CancellationToken,
        backoff: &mut BackoffHandler,
        authenticator: &dyn Authenticator,
        reconnect_tx: &broadcast::Sender<ReconnectEvent>,
    ) -> Result<Duration, TunnelError> {
        let schedule = self
            .credentials
            .refresh_auth(cancel, backoff, authenticator)
            .await?;
        match schedule.status {
            RefreshStatus::Renewed => events::publish(
                reconnect_tx,
                ReconnectEvent::TokenRefreshed {
                    refresh_after: schedule.after,
                },
            ),
            RefreshStatus::Deferred { reason } => warn!(
                reason = %reason,
                retry_in_secs = schedule.after.as_secs(),
                "Edge deferred reconnect token refresh"
            ),
            RefreshStatus::Failed(e) => warn!(
                error = %e,
                retry_in_ms = schedule.after.as_millis(),
                "Reconnect token refresh failed"
            ),
        }
        Ok(schedule.after)
    }
}

/// Index bookkeeping owned by the event loop.
///
/// Only one connecting index is watched at a time (`next_connected`).
/// Whenever an index leaves `connecting`, an arbitrary remaining one takes
/// its place. Signals latch, so a connection that registered while not
/// watched is noticed once it is designated; the backoff grace period is
/// therefore reached only after each connecting index has been observed.
#[derive(Debug, Default)]
struct TunnelSet {
    connecting: HashMap<usize, ConnectedSignal>,
    next_connected: Option<usize>,
    waiting: Vec<usize>,
}

impl TunnelSet {
    /// Track a freshly launched worker and watch its signal.
    fn launch(&mut self, index: usize) -> ConnectedSignal {
        let signal = ConnectedSignal::new();
        self.connecting.insert(index, signal.clone());
        self.next_connected = Some(index);
        signal
    }

    /// Stop tracking `index`. Returns whether another index is still
    /// connecting.
    fn wait_for_next(&mut self, index: usize) -> bool {
        self.connecting.remove(&index);
        self.next_connected = self.connecting.keys().next().copied();
        self.next_connected.is_some()
    }

    fn queue_retry(&mut self, index: usize) {
        self.waiting.push(index);
        self.wait_for_next(index);
    }

    fn take_waiting(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.waiting)
    }

    /// Record that `index` registered. Returns `true` when nothing is
    /// connecting or waiting any more.
    fn mark_connected(&mut self, index: usize) -> bool {
        !self.wait_for_next(index) && self.waiting.is_empty()
    }

    fn next_connected(&self) -> Option<(usize, ConnectedSignal)> {
        let index = self.next_connected?;
        self.connecting.get(&index).map(|s| (index, s.clone()))
    }
}

async fn wait_timer(timer: &mut Timer) {
    match timer {
        Some(t) => t.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn wait_connected(next: Option<(usize, ConnectedSignal)>) -> usize {
    match next {
        Some((index, signal)) => {
            signal.wait().await;
            index
        }
        None => std::future::pending().await,
    }
}

/// Collect exactly `active` outcomes.
async fn drain(outcome_rx: &mut mpsc::UnboundedReceiver<TunnelOutcome>, mut active: usize) {
    while active > 0 {
        if outcome_rx.recv().await.is_none() {
            break;
        }
        active -= 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn launch_designates_newest_index() {
        let mut set = TunnelSet::default();
        set.launch(1);
        set.launch(2);
        assert_eq!(set.next_connected().map(|(i, _)| i), Some(2));
        assert_eq!(set.connecting.len(), 2);
    }

    #[test]
    fn failure_moves_index_to_waiting_and_redesignates() {
        let mut set = TunnelSet::default();
        set.launch(1);
        set.launch(2);
        set.queue_retry(2);

        assert_eq!(set.waiting, vec![2]);
        assert!(!set.connecting.contains_key(&2));
        assert_eq!(set.next_connected().map(|(i, _)| i), Some(1));
    }

    #[test]
    fn simultaneous_failures_batch_into_waiting() {
        let mut set = TunnelSet::default();
        for i in 1..4 {
            set.launch(i);
        }
        set.queue_retry(3);
        set.queue_retry(1);

        assert_eq!(set.take_waiting(), vec![3, 1]);
        assert!(set.waiting.is_empty());
    }

    #[test]
    fn stable_only_when_nothing_connecting_or_waiting() {
        let mut set = TunnelSet::default();
        set.launch(1);
        set.launch(2);

        assert!(!set.mark_connected(2));
        assert!(set.mark_connected(1));
        assert!(set.next_connected().is_none());
    }

    #[test]
    fn pending_retry_blocks_stability() {
        let mut set = TunnelSet::default();
        set.launch(1);
        set.launch(2);
        set.queue_retry(2);

        assert!(!set.mark_connected(1));
    }

    #[test]
    fn relaunch_after_retry_tracks_new_signal() {
        let mut set = TunnelSet::default();
        let old = set.launch(3);
        set.queue_retry(3);
        for index in set.take_waiting() {
            set.launch(index);
        }

        let (index, signal) = set.next_connected().unwrap();
        assert_eq!(index, 3);
        old.notify();
        assert!(!signal.is_notified());
    }

    #[tokio::test]
    async fn drain_collects_exact_count() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        for index in 0..3 {
            tx.send(TunnelOutcome {
                index,
                addr: None,
                error: None,
            })
            .unwrap();
        }
        drain(&mut rx, 2).await;
        assert_eq!(rx.try_recv().unwrap().index, 2);
    }
}

//! Reconnect notifications published to observers outside the supervisor.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::broadcast;

/// Capacity of the reconnect event channel. Slow subscribers lag and drop
/// old events rather than stalling connections.
pub const RECONNECT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// A connection registered with the edge.
    Connected { index: usize, addr: SocketAddr },
    /// A fresh reconnect token was stored.
    TokenRefreshed { refresh_after: Duration },
}

/// Create the broadcast channel connections publish [`ReconnectEvent`]s on.
pub fn reconnect_channel() -> (
    broadcast::Sender<ReconnectEvent>,
    broadcast::Receiver<ReconnectEvent>,
) {
    broadcast::channel(RECONNECT_EVENT_CAPACITY)
}

/// Publish without caring whether anyone is listening.
pub(crate) fn publish(tx: &broadcast::Sender<ReconnectEvent>, event: ReconnectEvent) {
    let _ = tx.send(event);
}

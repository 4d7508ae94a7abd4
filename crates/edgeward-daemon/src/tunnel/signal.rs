//! One-shot "connected" latch shared between a connection and its watcher.

use std::sync::Arc;

use tokio::sync::watch;

/// Fires once when a connection finishes registering with the edge.
///
/// Clones share the same latch. Once notified it stays notified, so a
/// watcher that starts waiting late still sees the event.
#[derive(Debug, Clone)]
pub struct ConnectedSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectedSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the connection as connected. Later calls are no-ops.
    pub fn notify(&self) {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        });
    }

    pub fn is_notified(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until [`notify`](Self::notify) has been called on any clone.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for ConnectedSignal {
    fn default() -> Self {
        Self::new()
    }
}

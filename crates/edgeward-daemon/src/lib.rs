//! edgeward Daemon Library
//!
//! Keeps a pool of long-lived connections from this host to the edge:
//! - Staged startup gated on the first connection
//! - Shared exponential backoff for reconnecting dropped connections
//! - Periodic reconnect token refresh
//! - Static edge address pool and a TCP serving primitive

pub mod tunnel;

//! Tunnel supervisor error types.

use std::net::SocketAddr;

/// Errors that can occur while supervising edge connections.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Failed to dial edge at {addr}: {reason}")]
    Dial { addr: SocketAddr, reason: String },

    #[error("Connection with edge at {addr} already registered")]
    DuplicateRegistration { addr: SocketAddr },

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    /// The edge refused to issue a reconnect token. Not retried.
    #[error("Authentication rejected by edge: {0}")]
    AuthRejected(String),

    #[error("Reconnect token refresh gave up after {retries} retries: {source}")]
    RefreshExhausted {
        retries: u32,
        #[source]
        source: Box<TunnelError>,
    },

    #[error("No edge addresses left")]
    NoAddressesLeft,

    #[error("Reconnect token unset")]
    ReconnectTokenUnset,

    #[error("Event digest unset")]
    EventDigestUnset,

    #[error("Connection digest unset for connection {0}")]
    ConnDigestUnset(usize),

    /// The edge sent something we could not understand.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serve error: {0}")]
    Serve(String),

    #[error("Connection {0} exited without reporting a result")]
    WorkerLost(usize),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TunnelError {
    /// Errors that mean "try again, probably somewhere else" rather than a
    /// permanent condition.
    pub const fn is_edge_error(&self) -> bool {
        matches!(self, Self::Dial { .. } | Self::DuplicateRegistration { .. })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dial_and_duplicate_registration_are_edge_errors() {
        let addr: SocketAddr = "127.0.0.1:7844".parse().unwrap();
        assert!(
            TunnelError::Dial {
                addr,
                reason: "refused".into()
            }
            .is_edge_error()
        );
        assert!(TunnelError::DuplicateRegistration { addr }.is_edge_error());
    }

    #[test]
    fn other_errors_are_not_edge_errors() {
        assert!(!TunnelError::Registration("bad".into()).is_edge_error());
        assert!(!TunnelError::Serve("eof".into()).is_edge_error());
        assert!(!TunnelError::NoAddressesLeft.is_edge_error());
        assert!(!TunnelError::Cancelled.is_edge_error());
    }

    #[test]
    fn refresh_exhausted_keeps_cause() {
        let err = TunnelError::RefreshExhausted {
            retries: 10,
            source: Box::new(TunnelError::Auth("timeout".into())),
        };
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "Authentication error: timeout");
    }
}

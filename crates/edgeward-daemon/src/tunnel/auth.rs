//! Authentication round trip consumed by the reconnect credential manager.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::BoxFuture;
use super::error::TunnelError;

/// Opaque token that lets a connection re-register without a full
/// authentication handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct ReconnectToken(Arc<str>);

impl ReconnectToken {
    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReconnectToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReconnectToken(<redacted>)")
    }
}

/// What the edge said about an authentication request.
#[derive(Debug, Clone)]
pub enum AuthOutcome {
    /// New token issued; refresh again after `refresh_after`.
    Success {
        token: ReconnectToken,
        refresh_after: Duration,
    },
    /// The edge could not decide. Keep the current token, ask again later.
    Unknown {
        reason: String,
        refresh_after: Duration,
    },
    /// The edge refused. Retrying will not help.
    Fail { reason: String },
}

/// Performs one authentication round trip against the edge.
///
/// Implementations dial a fresh transport per call and must be safe to
/// retry. `previous_attempts` is the number of consecutive failures so far.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        previous_attempts: u32,
    ) -> BoxFuture<'a, Result<AuthOutcome, TunnelError>>;
}

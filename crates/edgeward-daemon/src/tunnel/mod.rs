//! Supervised HA connections to the edge.
//!
//! Provides the connection supervisor with its backoff policy, reconnect
//! credential refresh, edge address pool, and the worker tasks that drive
//! each connection.

use std::future::Future;
use std::pin::Pin;

pub mod auth;
pub mod backoff;
pub mod config;
pub mod credential;
pub mod edge;
pub mod error;
pub mod events;
pub mod serve;
pub mod signal;
pub mod supervisor;
pub mod tcp;
pub mod wire;
pub(crate) mod worker;

pub use auth::{AuthOutcome, Authenticator, ReconnectToken};
pub use backoff::BackoffHandler;
pub use config::{RefreshAuthPolicy, TunnelConfig};
pub use credential::{ReconnectCredentialManager, RefreshSchedule, RefreshStats, RefreshStatus};
pub use edge::{EdgeAddrs, StaticEdge};
pub use error::TunnelError;
pub use events::{ReconnectEvent, reconnect_channel};
pub use serve::{ServeParams, TunnelServer};
pub use signal::ConnectedSignal;
pub use supervisor::Supervisor;
pub use tcp::{TcpAuthenticator, TcpTunnelServer};
pub use worker::{FIRST_CONN_INDEX, TunnelOutcome};

/// Boxed future returned by the object-safe collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

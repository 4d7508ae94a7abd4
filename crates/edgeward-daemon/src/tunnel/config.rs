//! Tunnel supervisor configuration.

use std::net::SocketAddr;
use std::time::Duration;

use uuid::Uuid;

/// Waiting time before retrying a failed tunnel connection.
pub const TUNNEL_RETRY_DURATION: Duration = Duration::from_secs(10);

/// Interval between registering new tunnels.
pub const REGISTRATION_INTERVAL: Duration = Duration::from_secs(1);

/// Runtime configuration handed to the supervisor and every connection.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Identifies this client process to the edge across all connections.
    pub client_id: Uuid,

    /// Desired number of concurrent connections.
    pub ha_connections: usize,

    /// Exponent cap for the reconnect backoff.
    pub retries: u32,

    /// Base delay for the reconnect backoff.
    pub tunnel_retry_duration: Duration,

    /// Pause between staged connection launches.
    pub registration_interval: Duration,

    /// Timeout for dialing a single edge address.
    pub dial_timeout: Duration,

    /// Whether connections re-register with a reconnect token.
    pub use_reconnect_token: bool,

    /// Reconnect token refresh policy.
    pub refresh_auth: RefreshAuthPolicy,
}

/// Backoff and timing for reconnect token refresh.
#[derive(Debug, Clone)]
pub struct RefreshAuthPolicy {
    /// Maximum exponent for the refresh backoff. Refresh is disabled once
    /// this many retries have failed in a row.
    pub max_backoff: u32,
    /// Base delay for the refresh backoff.
    pub retry_duration: Duration,
    /// Upper bound on a single authenticate round trip.
    pub auth_timeout: Duration,
    /// Used when the edge does not say when to refresh.
    pub default_refresh_interval: Duration,
}

impl Default for RefreshAuthPolicy {
    fn default() -> Self {
        Self {
            max_backoff: 10,
            retry_duration: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(30),
            default_refresh_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl TunnelConfig {
    /// Create a config for `ha_connections` connections with defaults.
    pub fn new(ha_connections: usize) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            ha_connections,
            retries: 5,
            tunnel_retry_duration: TUNNEL_RETRY_DURATION,
            registration_interval: REGISTRATION_INTERVAL,
            dial_timeout: Duration::from_secs(15),
            use_reconnect_token: false,
            refresh_auth: RefreshAuthPolicy::default(),
        }
    }
}

impl From<&edgeward_core::Config> for TunnelConfig {
    fn from(config: &edgeward_core::Config) -> Self {
        let sup = &config.supervisor;
        let auth = &config.refresh_auth;
        Self {
            client_id: Uuid::new_v4(),
            ha_connections: sup.ha_connections,
            retries: sup.retries,
            tunnel_retry_duration: Duration::from_secs(sup.retry_base_secs),
            registration_interval: Duration::from_millis(sup.registration_interval_ms),
            dial_timeout: Duration::from_secs(sup.dial_timeout_secs),
            use_reconnect_token: sup.use_reconnect_token,
            refresh_auth: RefreshAuthPolicy {
                max_backoff: auth.max_backoff,
                retry_duration: Duration::from_secs(auth.retry_base_secs),
                auth_timeout: Duration::from_secs(auth.auth_timeout_secs),
                default_refresh_interval: Duration::from_secs(auth.default_refresh_secs),
            },
        }
    }
}

/// Parse edge addresses given on the command line.
pub fn parse_edge_addrs(raw: &[String]) -> Result<Vec<SocketAddr>, std::net::AddrParseError> {
    raw.iter().map(|s| s.trim().parse()).collect()
}

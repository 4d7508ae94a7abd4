//! Configuration resolution for edgeward.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/edgeward/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Complete edgeward configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub refresh_auth: RefreshAuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Edge addresses to connect to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EdgeConfig {
    /// Static edge addresses. Each HA connection uses a distinct one.
    #[serde(default)]
    pub addrs: Vec<SocketAddr>,
}

/// Connection supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Number of concurrent HA connections to keep open.
    pub ha_connections: usize,
    /// Exponent cap for the reconnect backoff.
    pub retries: u32,
    /// Base delay for reconnect backoff (seconds).
    pub retry_base_secs: u64,
    /// Pause between staged connection launches (milliseconds).
    pub registration_interval_ms: u64,
    /// Timeout for dialing an edge address (seconds).
    pub dial_timeout_secs: u64,
    /// Whether connections re-register with a reconnect token.
    pub use_reconnect_token: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            ha_connections: 4,
            retries: 5,
            retry_base_secs: 10,
            registration_interval_ms: 1000,
            dial_timeout_secs: 15,
            use_reconnect_token: false,
        }
    }
}

/// Reconnect token refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshAuthConfig {
    /// Consecutive failed refreshes tolerated before refresh is disabled.
    pub max_backoff: u32,
    /// Base delay for refresh backoff (seconds).
    pub retry_base_secs: u64,
    /// Upper bound on a single authenticate round trip (seconds).
    pub auth_timeout_secs: u64,
    /// Refresh interval used when the edge does not provide one (seconds).
    pub default_refresh_secs: u64,
}

impl Default for RefreshAuthConfig {
    fn default() -> Self {
        Self {
            max_backoff: 10,
            retry_base_secs: 10,
            auth_timeout_secs: 30,
            default_refresh_secs: 60 * 60,
        }
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject settings the supervisor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.ha_connections == 0 {
            return Err(Error::Config(
                "supervisor.ha_connections must be at least 1".into(),
            ));
        }
        if self.edge.addrs.is_empty() {
            return Err(Error::Config("no edge addresses configured".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// `explicit` must exist when given; the global file is optional. Files
/// are merged field by field, so a later file only overrides the keys it
/// actually sets.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        debug!(path = %global_path.display(), "Loading global settings");
        layers.push(global_path);
    }

    if let Some(path) = explicit {
        debug!(path = %path.display(), "Loading settings file");
        layers.push(path.to_path_buf());
    }

    let mut config = resolve_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".edgeward").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/edgeward/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("edgeward").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

/// Merge settings files, lowest priority first, over the defaults.
fn resolve_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        merge_values(&mut merged, load_config_layer(path)?);
    }
    Ok(serde_json::from_value(merged)?)
}

/// Read one settings file as raw JSON, checking it against [`Config`].
fn load_config_layer(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let layer: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    Config::deserialize(&layer).map_err(|e| {
        Error::Config(format!("Invalid config file {}: {}", path.display(), e))
    })?;
    Ok(layer)
}

/// Objects merge key by key; anything else in `overlay` replaces `base`.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("EDGEWARD_HA_CONNECTIONS").and_then(|v| v.parse().ok()) {
        config.supervisor.ha_connections = n;
    }
    if let Some(n) = lookup("EDGEWARD_RETRIES").and_then(|v| v.parse().ok()) {
        config.supervisor.retries = n;
    }
    if let Some(val) = lookup("EDGEWARD_EDGE_ADDRS") {
        let addrs: Vec<SocketAddr> = val
            .split(',')
            .filter_map(|a| a.trim().parse().ok())
            .collect();
        if !addrs.is_empty() {
            config.edge.addrs = addrs;
        }
    }
    if let Some(b) = lookup("EDGEWARD_USE_RECONNECT_TOKEN").and_then(|v| v.parse().ok()) {
        config.supervisor.use_reconnect_token = b;
    }
    if let Some(val) = lookup("EDGEWARD_LOG_LEVEL") {
        config.logging.level = val;
    }
    if let Some(b) = lookup("EDGEWARD_LOG_JSON").and_then(|v| v.parse().ok()) {
        config.logging.json = b;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_supervisor_constants() {
        let config = Config::default();
        assert_eq!(config.supervisor.ha_connections, 4);
        assert_eq!(config.supervisor.retries, 5);
        assert_eq!(config.supervisor.retry_base_secs, 10);
        assert_eq!(config.supervisor.registration_interval_ms, 1000);
        assert_eq!(config.refresh_auth.max_backoff, 10);
        assert_eq!(config.refresh_auth.auth_timeout_secs, 30);
        assert!(!config.supervisor.use_reconnect_token);
    }

    fn write_settings(dir: &Path, name: &str, json: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, json).unwrap();
        path
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(
            dir.path(),
            "settings.json",
            r#"{"edge":{"addrs":["10.0.0.1:7844"]},"supervisor":{"ha_connections":2}}"#,
        );

        let config = resolve_layers(&[path]).unwrap();
        assert_eq!(config.edge.addrs.len(), 1);
        assert_eq!(config.supervisor.ha_connections, 2);
        assert_eq!(config.supervisor.retries, 5);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_layers(&[dir.path().join("nope.json")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn mistyped_field_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(
            dir.path(),
            "bad.json",
            r#"{"supervisor":{"ha_connections":"many"}}"#,
        );
        let err = resolve_layers(&[path]).unwrap_err();
        assert!(err.to_string().contains("bad.json"), "got {err}");
    }

    #[test]
    fn later_file_overrides_only_the_fields_it_sets() {
        let dir = tempfile::tempdir().unwrap();
        let global = write_settings(
            dir.path(),
            "global.json",
            r#"{
                "edge": {"addrs": ["10.0.0.1:7844"]},
                "supervisor": {"ha_connections": 2},
                "logging": {"level": "debug"}
            }"#,
        );
        let explicit = write_settings(
            dir.path(),
            "explicit.json",
            r#"{"supervisor": {"retries": 3}, "logging": {"json": true}}"#,
        );

        let config = resolve_layers(&[global, explicit]).unwrap();
        assert_eq!(config.supervisor.ha_connections, 2);
        assert_eq!(config.supervisor.retries, 3);
        assert_eq!(config.edge.addrs.len(), 1);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn later_file_addrs_replace_earlier_list() {
        let dir = tempfile::tempdir().unwrap();
        let global = write_settings(
            dir.path(),
            "global.json",
            r#"{"edge": {"addrs": ["10.0.0.1:7844", "10.0.0.2:7844"]}}"#,
        );
        let explicit = write_settings(
            dir.path(),
            "explicit.json",
            r#"{"edge": {"addrs": ["10.0.0.9:7844"]}}"#,
        );

        let config = resolve_layers(&[global, explicit]).unwrap();
        assert_eq!(config.edge.addrs, vec!["10.0.0.9:7844".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("EDGEWARD_HA_CONNECTIONS", "3"),
            ("EDGEWARD_EDGE_ADDRS", "10.0.0.1:7844, 10.0.0.2:7844,garbage"),
            ("EDGEWARD_USE_RECONNECT_TOKEN", "true"),
            ("EDGEWARD_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.supervisor.ha_connections, 3);
        assert_eq!(config.edge.addrs.len(), 2);
        assert!(config.supervisor.use_reconnect_token);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn validate_rejects_zero_connections_and_empty_edge() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.edge.addrs = vec!["10.0.0.1:7844".parse().unwrap()];
        assert!(config.validate().is_ok());

        config.supervisor.ha_connections = 0;
        assert!(config.validate().is_err());
    }
}

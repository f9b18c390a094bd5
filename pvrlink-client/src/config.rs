//! Connection configuration.

use std::time::Duration;

use log::debug;

use pvrlink_protocol::DEFAULT_PORT;

/// Configuration for a backend connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Backend address, `host:port`.
    pub server_addr: String,
    /// Name this client announces itself under.
    pub client_name: String,
    /// Bound on TCP connect plus one handshake round trip.
    pub connect_timeout: Duration,
    /// Bound on a single socket read.
    pub read_timeout: Duration,
    /// Overall idle budget for the event-mode reader: how long the reader
    /// keeps retrying timed-out reads before it gives up. `None` makes the
    /// first read timeout fatal.
    pub event_read_budget: Option<Duration>,
    /// Highest protocol version to offer. `None` offers the newest known.
    pub start_version: Option<u32>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{DEFAULT_PORT}"),
            client_name: "pvrlink".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(5),
            event_read_budget: Some(Duration::from_secs(60)),
            start_version: None,
        }
    }
}

impl ConnectionConfig {
    /// Build a config for `addr` with defaults for everything else.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            server_addr: addr.into(),
            ..Self::default()
        }
    }
}

/// Load configuration from environment variables (`PVRLINK_*`), falling
/// back to defaults for anything unset.
pub fn load_from_env() -> ConnectionConfig {
    let defaults = ConnectionConfig::default();

    let server_addr =
        std::env::var("PVRLINK_SERVER").unwrap_or(defaults.server_addr);

    let client_name =
        std::env::var("PVRLINK_CLIENT_NAME").unwrap_or(defaults.client_name);

    let connect_timeout = std::env::var("PVRLINK_CONNECT_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.connect_timeout);

    let read_timeout = std::env::var("PVRLINK_READ_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(defaults.read_timeout);

    let event_read_budget = std::env::var("PVRLINK_EVENT_READ_BUDGET_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .or(defaults.event_read_budget);

    let start_version = std::env::var("PVRLINK_PROTO_VERSION")
        .ok()
        .and_then(|s| s.parse().ok());

    debug!("using environment/default config: server={server_addr}, client={client_name}");

    ConnectionConfig {
        server_addr,
        client_name,
        connect_timeout,
        read_timeout,
        event_read_budget,
        start_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert!(config.server_addr.ends_with(":6543"));
        assert!(config.start_version.is_none());
    }

    #[test]
    fn test_load_from_env() {
        let config = load_from_env();
        assert!(!config.server_addr.is_empty());
    }
}

//! # Client Configuration
//!
//! Plain structs with `Default` values; every field except the pub/sub
//! callbacks can be deserialized with serde.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::notify::PubSubHandlers;

/// Default client-side cache budget for each connection (128 MiB).
pub const DEFAULT_CACHE_SIZE: usize = 128 * (1 << 20);

/// Default ceiling of dedicated connections per destination.
pub const DEFAULT_DEDICATED_POOL_SIZE: usize = 1000;

/// Default number of redirects followed before surfacing the reply.
pub const DEFAULT_MAX_REDIRECTS: usize = 3;

/// Per-destination connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Client-side cache budget in bytes for each connection; 0 disables it.
    pub cache_size: usize,
    /// Maximum dedicated connections checked out at once.
    pub dedicated_pool_size: usize,
    /// Connections that always stay in shared rotation.
    pub shared_connections: usize,
    /// ACL user for `HELLO AUTH`; defaults to `default` when only a password is set.
    pub username: Option<String>,
    /// Password for `HELLO AUTH`.
    pub password: Option<String>,
    /// Name announced through `HELLO SETNAME`.
    pub client_name: Option<String>,
    /// Logical database selected after the handshake.
    pub select_db: u32,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Encrypt the stream when set.
    pub tls: Option<TlsConfig>,
    /// Push message callbacks.
    #[serde(skip)]
    pub pubsub: PubSubHandlers,
}

impl Default for ConnConfig {
    fn default() -> Self {
        ConnConfig {
            cache_size: DEFAULT_CACHE_SIZE,
            dedicated_pool_size: DEFAULT_DEDICATED_POOL_SIZE,
            shared_connections: 1,
            username: None,
            password: None,
            client_name: None,
            select_db: 0,
            connect_timeout: None,
            tls: None,
            pubsub: PubSubHandlers::default(),
        }
    }
}

/// TLS settings for encrypted streams.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Server name for SNI and certificate checks; defaults to the dialed host.
    pub domain: Option<String>,
    /// Extra PEM root certificate.
    pub ca_cert: Option<PathBuf>,
    /// Accept invalid certificates and host names.
    pub skip_verify: bool,
}

/// Configuration for a single-node client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Connection settings.
    pub conn: ConnConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            addr: "127.0.0.1:6379".to_string(),
            conn: ConnConfig::default(),
        }
    }
}

/// Configuration for a cluster client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Nodes used to discover the topology.
    pub seeds: Vec<String>,
    /// Connection settings applied to every node.
    pub conn: ConnConfig,
    /// Redirects followed per command before the reply is surfaced.
    pub max_redirects: usize,
    /// Interval of the background topology refresh; `None` disables it.
    pub refresh_interval: Option<Duration>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            seeds: vec!["127.0.0.1:7000".to_string()],
            conn: ConnConfig::default(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            refresh_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ConnConfig::default();
        assert_eq!(config.cache_size, 128 * 1024 * 1024);
        assert_eq!(config.dedicated_pool_size, 1000);
        assert_eq!(config.shared_connections, 1);
        assert!(config.tls.is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let json = r#"{
            "seeds": ["10.0.0.1:7000", "10.0.0.2:7000"],
            "conn": { "cache_size": 0, "password": "hunter2", "tls": { "skip_verify": true } },
            "refresh_interval": { "secs": 30, "nanos": 0 }
        }"#;
        let config: ClusterConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.seeds.len(), 2);
        assert_eq!(config.max_redirects, DEFAULT_MAX_REDIRECTS);
        assert_eq!(config.refresh_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.conn.cache_size, 0);
        assert_eq!(config.conn.dedicated_pool_size, DEFAULT_DEDICATED_POOL_SIZE);
        assert_eq!(config.conn.password.as_deref(), Some("hunter2"));
        assert!(config.conn.tls.unwrap().skip_verify);
    }
}

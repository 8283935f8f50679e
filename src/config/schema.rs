//! Configuration schema definitions.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind host: a literal IP, a wildcard ("0.0.0.0"), or a hostname
    /// resolved at start.
    pub host: String,

    /// Bind port. Must be non-zero.
    pub port: u16,

    /// Advertise `wss` instead of `ws`. Scheme selection only; TLS
    /// termination happens outside the server.
    pub secure: bool,

    /// Initial allow-list of peer addresses. Empty means allow all.
    /// Mutable at runtime through the server API.
    pub permitted_addresses: Vec<IpAddr>,

    /// Wait between retries when accepting a connection fails transiently.
    pub accept_retry_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 8080,
            secure: false,
            permitted_addresses: Vec::new(),
            accept_retry_delay_ms: 100,
        }
    }
}

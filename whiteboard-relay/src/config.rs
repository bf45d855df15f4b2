//! Relay configuration.

use std::time::Duration;

/// Environment variable holding the listen port.
pub const PORT_ENV: &str = "WS_PORT";

pub const DEFAULT_PORT: u16 = 1234;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Frames buffered per connection before the peer is evicted
    pub outbound_capacity: usize,
    /// Consecutive malformed frames tolerated before closing a connection
    pub max_decode_failures: u32,
    /// Presence entries not renewed within this window expire
    pub awareness_timeout: Duration,
    /// How often rooms are swept for expired presence
    pub sweep_interval: Duration,
    /// Awareness tombstones older than this are forgotten by the sweeper
    pub tombstone_ttl: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            outbound_capacity: 256,
            max_decode_failures: 8,
            awareness_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(3),
            tombstone_ttl: Duration::from_secs(300),
        }
    }
}

impl ServerConfig {
    /// Defaults, with the port taken from `WS_PORT` when it parses.
    pub fn from_env() -> Self {
        Self {
            port: parse_port(std::env::var(PORT_ENV).ok().as_deref()),
            ..Self::default()
        }
    }

    /// Address to bind to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_port(raw: Option<&str>) -> u16 {
    match raw.map(str::trim) {
        Some(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("Ignoring unparsable {PORT_ENV}={value:?}, using {DEFAULT_PORT}");
            DEFAULT_PORT
        }),
        None => DEFAULT_PORT,
    }
}

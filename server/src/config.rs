//! Environment-driven configuration for the FdxTunnel server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use fdxtunnel_shared::protocol::{DEFAULT_CALL_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use tracing::warn;

use crate::controller::ServerOptions;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP front-end listens on
    pub bind: SocketAddr,
    pub options: ServerOptions,
}

impl ServerConfig {
    /// Read `PORT`, `FDX_BIND`, `FDX_CALL_TIMEOUT_SECS` and `FDX_QUEUE_CAPACITY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let host: IpAddr = parse_or(&lookup, "FDX_BIND", IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port: u16 = parse_or(&lookup, "PORT", 8080);
        let timeout_secs: u64 = parse_or(&lookup, "FDX_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT.as_secs());
        let mut queue_capacity: usize = parse_or(&lookup, "FDX_QUEUE_CAPACITY", DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            warn!("FDX_QUEUE_CAPACITY must be positive, using {}", DEFAULT_QUEUE_CAPACITY);
            queue_capacity = DEFAULT_QUEUE_CAPACITY;
        }

        Self {
            bind: SocketAddr::new(host, port),
            options: ServerOptions {
                call_timeout: Duration::from_secs(timeout_secs),
                queue_capacity,
            },
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

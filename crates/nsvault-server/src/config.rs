//! Server configuration for `nsvault`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `NSVAULT_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use nsvault_core::CoreConfig;

const DEFAULT_PORT: u16 = 8200;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Fixed root token value used when initializing a fresh engine.
    pub dev_root_token: Option<String>,
    /// How long a request waits for a new namespace to become ready.
    pub namespace_ready_timeout: Duration,
    /// Upper bound on requests served concurrently.
    pub max_concurrent_requests: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on, on `0.0.0.0`
    /// - `NSVAULT_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8200`)
    /// - `NSVAULT_LOG_LEVEL`: log filter (default: `info`)
    /// - `NSVAULT_DEV_ROOT_TOKEN`: root token value for a fresh engine (optional)
    /// - `NSVAULT_NAMESPACE_READY_TIMEOUT_MS`: namespace readiness wait (default: `5000`)
    /// - `NSVAULT_MAX_CONCURRENT_REQUESTS`: concurrency limit (default: `256`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        // Priority: NSVAULT_BIND_ADDR > PORT > default 127.0.0.1:8200
        let bind_addr = if let Some(addr) = lookup("NSVAULT_BIND_ADDR") {
            addr.parse()
                .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)))
        } else if let Some(port) = lookup("PORT") {
            SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(DEFAULT_PORT)))
        } else {
            SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT))
        };

        let log_level = lookup("NSVAULT_LOG_LEVEL").unwrap_or_else(|| "info".to_owned());

        let dev_root_token = lookup("NSVAULT_DEV_ROOT_TOKEN").filter(|t| !t.trim().is_empty());

        let namespace_ready_timeout = lookup("NSVAULT_NAMESPACE_READY_TIMEOUT_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .map_or(Duration::from_secs(5), Duration::from_millis);

        let max_concurrent_requests = lookup("NSVAULT_MAX_CONCURRENT_REQUESTS")
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(256);

        Self {
            bind_addr,
            log_level,
            dev_root_token,
            namespace_ready_timeout,
            max_concurrent_requests,
        }
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            namespace_ready_timeout: self.namespace_ready_timeout,
            ..CoreConfig::default()
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field("dev_root_token", &self.dev_root_token.as_ref().map(|_| "[redacted]"))
            .field("namespace_ready_timeout", &self.namespace_ready_timeout)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind_addr, "127.0.0.1:8200".parse().unwrap());
        assert_eq!(cfg.log_level, "info");
        assert!(cfg.dev_root_token.is_none());
        assert_eq!(cfg.namespace_ready_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_concurrent_requests, 256);
    }

    #[test]
    fn bind_addr_wins_over_port() {
        let cfg = config(&[("PORT", "9000"), ("NSVAULT_BIND_ADDR", "10.0.0.1:8300")]);
        assert_eq!(cfg.bind_addr, "10.0.0.1:8300".parse().unwrap());

        let cfg = config(&[("PORT", "9000")]);
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000".parse().unwrap());
    }

    #[test]
    fn malformed_values_fall_back() {
        let cfg = config(&[
            ("NSVAULT_BIND_ADDR", "not-an-addr"),
            ("NSVAULT_NAMESPACE_READY_TIMEOUT_MS", "soon"),
            ("NSVAULT_MAX_CONCURRENT_REQUESTS", "0"),
            ("NSVAULT_DEV_ROOT_TOKEN", "  "),
        ]);
        assert_eq!(cfg.bind_addr, "127.0.0.1:8200".parse().unwrap());
        assert_eq!(cfg.namespace_ready_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_concurrent_requests, 256);
        assert!(cfg.dev_root_token.is_none());
    }

    #[test]
    fn core_config_carries_timeout() {
        let cfg = config(&[("NSVAULT_NAMESPACE_READY_TIMEOUT_MS", "250")]);
        assert_eq!(
            cfg.core_config().namespace_ready_timeout,
            Duration::from_millis(250)
        );
    }

    #[test]
    fn debug_redacts_root_token() {
        let cfg = config(&[("NSVAULT_DEV_ROOT_TOKEN", "s.devroot")]);
        let shown = format!("{cfg:?}");
        assert!(!shown.contains("s.devroot"));
        assert!(shown.contains("[redacted]"));
    }
}

use crate::error::{FusionError, Result};
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Uplinks selected by the operator, in rotation order
    pub uplinks: Vec<UplinkConfig>,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyServerConfig {
    /// Loopback port for the proxy (default: 8080, 0 = ephemeral)
    pub port: u16,
    /// Resolve + bound connect timeout in seconds
    pub connect_timeout: u64,
    /// Hard timeout for one upstream fetch in seconds
    pub request_timeout: u64,
    /// How long stop() waits for in-flight requests, in seconds
    pub shutdown_grace: u64,
    /// Largest upstream body buffered for a client
    pub max_body_bytes: usize,
    /// Answer 200 for every successful fetch instead of the upstream status
    pub normalize_status: bool,
    /// Relay CONNECT tunnels instead of answering 501
    pub allow_connect: bool,
}

/// One `label=ip` entry from NETFUSION_UPLINKS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkConfig {
    pub label: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            connect_timeout: 10,
            request_timeout: 30,
            shutdown_grace: 5,
            max_body_bytes: 64 * 1024 * 1024,
            normalize_status: false,
            allow_connect: false,
        }
    }
}

impl ProxyServerConfig {
    /// The proxy only ever listens on loopback
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace)
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                port: get_env_or("PROXY_PORT", "8080").parse().map_err(|_| {
                    FusionError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                connect_timeout: parse_secs("PROXY_CONNECT_TIMEOUT", "10")?,
                request_timeout: parse_secs("PROXY_REQUEST_TIMEOUT", "30")?,
                shutdown_grace: parse_secs("PROXY_SHUTDOWN_GRACE", "5")?,
                max_body_bytes: get_env_or("PROXY_MAX_BODY_BYTES", "67108864")
                    .parse()
                    .map_err(|_| {
                        FusionError::InvalidConfig(
                            "PROXY_MAX_BODY_BYTES must be a valid number".into(),
                        )
                    })?,
                normalize_status: get_env_or("PROXY_NORMALIZE_STATUS", "false")
                    .parse()
                    .unwrap_or(false),
                allow_connect: get_env_or("PROXY_ALLOW_CONNECT", "false")
                    .parse()
                    .unwrap_or(false),
            },
            uplinks: parse_uplinks(&get_env_or("NETFUSION_UPLINKS", ""))?,
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        self.proxy.listen_addr().to_string()
    }
}

/// Parse a comma-separated `label=ip` list; a bare `ip` uses the address as label
pub fn parse_uplinks(raw: &str) -> Result<Vec<UplinkConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|item| {
            let (label, address) = match item.split_once('=') {
                Some((label, address)) => (label.trim(), address.trim()),
                None => ("", item),
            };
            if address.is_empty() {
                return Err(FusionError::InvalidConfig(format!(
                    "NETFUSION_UPLINKS entry '{}' has no address",
                    item
                )));
            }
            Ok(UplinkConfig {
                label: label.to_string(),
                address: address.to_string(),
            })
        })
        .collect()
}

/// Parse a positive number of seconds
fn parse_secs(key: &str, default: &str) -> Result<u64> {
    match get_env_or(key, default).parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(FusionError::InvalidConfig(format!(
            "{} must be a positive number of seconds",
            key
        ))),
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

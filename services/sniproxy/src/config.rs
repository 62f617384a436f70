//! Proxy configuration.
//!
//! Routes are read from a TOML file once at startup and compiled into an
//! immutable [`RouteTable`].
//!
//! ```toml
//! bind = "[::]:443"
//!
//! [timeouts]
//! handshake_ms = 3000
//! dial_ms = 3000
//!
//! [[routes]]
//! domains = ["svc\\.example\\.com", ".*\\.internal\\.example"]
//! backend = "127.0.0.1:9000"
//! send_proxy = "v2"
//! allow = ["10.0.0.0/8"]
//! deny = ["10.1.0.0/16"]
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;
use thiserror::Error;

use crate::proxy::{
    AccessList, DispatchConfig, HostnamePattern, ProxyProtocol, Route, RouteTable,
    SharedRouteTable, DEFAULT_ALERT_TIMEOUT, DEFAULT_DIAL_TIMEOUT, DEFAULT_HANDSHAKE_TIMEOUT,
    DEFAULT_KEEPALIVE_PERIOD,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no routes defined")]
    NoRoutes,

    #[error("route {index}: no domains defined")]
    NoDomains { index: usize },

    #[error("route {index}: invalid domain pattern '{pattern}': {source}")]
    InvalidPattern {
        index: usize,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("route {index}: invalid backend address '{backend}' (expected host:port)")]
    InvalidBackend { index: usize, backend: String },

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),
}

/// Proxy configuration (file-driven).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen address; the command line takes precedence.
    #[serde(default)]
    pub bind: Option<String>,

    /// Connection timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Routes, in matching order.
    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    /// Routes compiled when the configuration was validated.
    #[serde(skip)]
    compiled: SharedRouteTable,
}

/// A single route as written in the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Hostname patterns (regular expressions matched against the whole SNI).
    pub domains: Vec<String>,

    /// Backend address (host:port).
    pub backend: String,

    /// PROXY protocol header to send to the backend.
    #[serde(default)]
    pub send_proxy: ProxyProtocol,

    /// Subnets allowed to use the route.
    #[serde(default)]
    pub allow: Vec<IpNet>,

    /// Subnets denied from using the route.
    #[serde(default)]
    pub deny: Vec<IpNet>,
}

/// Timeouts, in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub handshake_ms: u64,
    pub dial_ms: u64,
    pub alert_ms: u64,
    pub keepalive_secs: u64,
    /// Relay idle timeout; 0 disables it.
    pub idle_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            handshake_ms: DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64,
            dial_ms: DEFAULT_DIAL_TIMEOUT.as_millis() as u64,
            alert_ms: DEFAULT_ALERT_TIMEOUT.as_millis() as u64,
            keepalive_secs: DEFAULT_KEEPALIVE_PERIOD.as_secs(),
            idle_ms: 0,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(contents)?;
        config.compiled = Arc::new(config.validate()?);
        Ok(config)
    }

    /// Check the configuration and compile its routes in declaration order.
    pub fn validate(&self) -> Result<RouteTable, ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        let routes = self
            .routes
            .iter()
            .enumerate()
            .map(|(index, route)| route.compile(index))
            .collect::<Result<Vec<_>, _>>()?;

        let timeouts = &self.timeouts;
        for (name, value) in [
            ("handshake_ms", timeouts.handshake_ms),
            ("dial_ms", timeouts.dial_ms),
            ("alert_ms", timeouts.alert_ms),
            ("keepalive_secs", timeouts.keepalive_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }

        Ok(RouteTable::new(routes))
    }

    /// The compiled route table.
    pub fn route_table(&self) -> SharedRouteTable {
        Arc::clone(&self.compiled)
    }

    /// Timeouts for the connection dispatcher.
    pub fn dispatch_config(&self) -> DispatchConfig {
        let timeouts = &self.timeouts;

        DispatchConfig {
            handshake_timeout: Duration::from_millis(timeouts.handshake_ms),
            dial_timeout: Duration::from_millis(timeouts.dial_ms),
            alert_timeout: Duration::from_millis(timeouts.alert_ms),
            keepalive_period: Duration::from_secs(timeouts.keepalive_secs),
            idle_timeout: (timeouts.idle_ms > 0).then(|| Duration::from_millis(timeouts.idle_ms)),
        }
    }
}

impl RouteConfig {
    fn compile(&self, index: usize) -> Result<Route, ConfigError> {
        if self.domains.is_empty() {
            return Err(ConfigError::NoDomains { index });
        }

        let domains = self
            .domains
            .iter()
            .map(|pattern| {
                HostnamePattern::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                    index,
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if !is_host_port(&self.backend) {
            return Err(ConfigError::InvalidBackend {
                index,
                backend: self.backend.clone(),
            });
        }

        Ok(Route {
            domains,
            backend: self.backend.clone(),
            send_proxy: self.send_proxy,
            acl: AccessList::new(self.allow.clone(), self.deny.clone()),
        })
    }
}

/// Check for a non-empty host followed by a numeric port.
fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

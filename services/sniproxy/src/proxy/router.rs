//! Route table and routing decisions.
//!
//! Routes are loaded once at startup and never change afterwards. The table
//! is shared by reference between all connection tasks, so lookups need no
//! locking.
//!
//! Matching rules:
//! - Routes are tried in declaration order, first match wins
//! - Within a route, hostname patterns are tried in order
//! - A pattern must match the whole SNI hostname (case-insensitive)

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::acl::AccessList;

/// Routing errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// No route matches the requested hostname.
    #[error("no route matching the requested domain ({hostname})")]
    NoMatch { hostname: String },
}

/// PROXY protocol configuration for a route.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// PROXY protocol disabled.
    #[default]
    None,
    /// PROXY protocol v1 (text).
    V1,
    /// PROXY protocol v2 (binary).
    V2,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::V1 => "v1",
            Self::V2 => "v2",
        };
        f.write_str(name)
    }
}

/// A hostname pattern anchored to match the whole name.
///
/// Matching ignores case. A pattern that starts with `(?-i)` matches
/// case-sensitively.
#[derive(Debug, Clone)]
pub struct HostnamePattern {
    source: String,
    regex: Regex,
}

impl HostnamePattern {
    /// Compile a pattern. The expression is anchored at both ends.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(&format!("^(?:{})$", pattern))
            .case_insensitive(true)
            .build()?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, hostname: &str) -> bool {
        self.regex.is_match(hostname)
    }
}

impl PartialEq for HostnamePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for HostnamePattern {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub domains: Vec<HostnamePattern>,
    pub backend: String,
    pub send_proxy: ProxyProtocol,
    pub acl: AccessList,
}

impl Route {
    /// Check whether any of the route's patterns matches the hostname.
    pub fn matches(&self, hostname: &str) -> bool {
        self.domains.iter().any(|domain| domain.matches(hostname))
    }

    /// Check a client address against the route's allow/deny rules.
    pub fn allows(&self, ip: IpAddr) -> bool {
        self.acl.allows(ip)
    }
}

/// Ordered, immutable set of routes.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Create a route table; declaration order is preserved.
    pub fn new(routes: Vec<Route>) -> Self {
        Self {
            routes: routes.into_iter().map(Arc::new).collect(),
        }
    }

    /// Find the first route matching the SNI hostname.
    pub fn find(&self, hostname: &str) -> Result<&Arc<Route>, RouteError> {
        let route = self
            .routes
            .iter()
            .find(|route| route.matches(hostname))
            .ok_or_else(|| RouteError::NoMatch {
                hostname: hostname.to_string(),
            })?;

        debug!(hostname = %hostname, backend = %route.backend, "Route matched by SNI");
        Ok(route)
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Get the total number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the route table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Shared route table reference.
pub type SharedRouteTable = Arc<RouteTable>;

//! L4 TLS routing proxy.
//!
//! This module provides:
//! - TCP listener management
//! - SNI extraction from the TLS ClientHello
//! - Ordered hostname routing
//! - Per-route allow/deny subnet checks
//! - PROXY protocol v1/v2 injection
//! - Connection relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Dispatcher -> SNI Extractor -> Router -> ACL -> Backend
//!                           |                                             |
//!                      TLS alert (on rejection)          PROXY header (if enabled)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{DispatchConfig, Dispatcher, Listener, RouteTable};
//!
//! let routes = Arc::new(RouteTable::new(routes));
//! let dispatcher = Dispatcher::new(routes, DispatchConfig::default());
//! let listener = Listener::bind("[::]:443", dispatcher).await?;
//! listener.run().await?;
//! ```

mod acl;
mod alert;
mod dispatch;
mod listener;
mod proxy_protocol;
mod router;
mod sni;

pub use acl::AccessList;
pub use alert::{send_alert, AlertDescription, ALERT_RECORD_LEN, DEFAULT_ALERT_TIMEOUT};
pub use dispatch::{
    relay, DispatchConfig, DispatchError, Dispatcher, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_KEEPALIVE_PERIOD,
};
pub use listener::Listener;
pub use proxy_protocol::{write_proxy_header, ProxyHeader};
pub use router::{HostnamePattern, ProxyProtocol, Route, RouteError, RouteTable, SharedRouteTable};
pub use sni::{
    extract_sni, sniff_client_hello, SniError, TeeReader, DEFAULT_HANDSHAKE_TIMEOUT,
    MAX_RECORD_LEN,
};

pub mod config;
pub mod proxy;

pub use config::{Config, ConfigError};
pub use proxy::{
    AccessList, AlertDescription, DispatchConfig, Dispatcher, HostnamePattern, Listener,
    ProxyHeader, ProxyProtocol, Route, RouteTable, SharedRouteTable, SniError,
};

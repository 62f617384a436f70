//! Per-connection pipeline.
//!
//! Every accepted connection goes through the same phases, in order:
//!
//! ```text
//! sniff ClientHello -> keepalive -> route -> authorize -> dial backend
//!     -> PROXY header (optional) -> replay ClientHello -> relay
//! ```
//!
//! A failing phase ends the connection with a TLS fatal alert. Nothing is
//! retried and nothing is reported to the caller. Both sockets are owned by
//! the dispatch call and are closed when it returns.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::alert::{send_alert, AlertDescription, DEFAULT_ALERT_TIMEOUT};
use super::proxy_protocol::write_proxy_header;
use super::router::{RouteError, SharedRouteTable};
use super::sni::{sniff_client_hello, SniError, DEFAULT_HANDSHAKE_TIMEOUT};

/// Default connect timeout for backend connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default TCP keepalive period on client connections.
pub const DEFAULT_KEEPALIVE_PERIOD: Duration = Duration::from_secs(60);

/// Copy buffer size for each relay direction.
const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Timeouts applied while dispatching a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Maximum time to receive the ClientHello record.
    pub handshake_timeout: Duration,
    /// Maximum time to connect to the backend.
    pub dial_timeout: Duration,
    /// Maximum time to write an alert record.
    pub alert_timeout: Duration,
    /// TCP keepalive period on the client socket.
    pub keepalive_period: Duration,
    /// Idle timeout for each relay direction (none by default).
    pub idle_timeout: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            alert_timeout: DEFAULT_ALERT_TIMEOUT,
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            idle_timeout: None,
        }
    }
}

/// Reasons a connection is rejected before relaying.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Sniff(#[from] SniError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error("denied {client} / {hostname} access to {backend}")]
    Denied {
        client: IpAddr,
        hostname: String,
        backend: String,
    },

    #[error("failed to connect to {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {backend}")]
    DialTimeout { backend: String },

    #[error("failed to send PROXY header to {backend}: {source}")]
    ProxyHeader {
        backend: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to replay handshake to {backend}: {source}")]
    Replay {
        backend: String,
        #[source]
        source: io::Error,
    },
}

impl DispatchError {
    /// Alert sent to the client for this rejection.
    pub fn alert(&self) -> AlertDescription {
        match self {
            Self::Route(_) => AlertDescription::UnrecognizedName,
            Self::Denied { .. } => AlertDescription::AccessDenied,
            _ => AlertDescription::InternalError,
        }
    }
}

/// Runs the connection pipeline against a fixed route table.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    routes: SharedRouteTable,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(routes: SharedRouteTable, config: DispatchConfig) -> Self {
        Self { routes, config }
    }

    /// Dispatch a client connection. This cannot fail.
    pub async fn dispatch(&self, mut client: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.handle_connection(&mut client, peer_addr).await {
            let alert = e.alert();
            match &e {
                DispatchError::Denied { .. } => warn!(peer_addr = %peer_addr, "{}", e),
                DispatchError::Route(_) => info!(peer_addr = %peer_addr, alert = %alert, "{}", e),
                _ => warn!(peer_addr = %peer_addr, alert = %alert, error = %e, "Connection aborted"),
            }
            send_alert(&mut client, alert, self.config.alert_timeout).await;
        }
    }

    async fn handle_connection(
        &self,
        client: &mut TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), DispatchError> {
        // The deadline covers the ClientHello only; no deadline remains once it is read.
        let (hostname, handshake) =
            sniff_client_hello(client, self.config.handshake_timeout).await?;

        if let Err(e) = set_keepalive(client, self.config.keepalive_period) {
            debug!(error = %e, "Failed to enable TCP keepalive");
        }

        let route = self.routes.find(&hostname)?;

        if !route.allows(peer_addr.ip()) {
            return Err(DispatchError::Denied {
                client: peer_addr.ip(),
                hostname,
                backend: route.backend.clone(),
            });
        }

        let mut upstream = match timeout(
            self.config.dial_timeout,
            TcpStream::connect(route.backend.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(DispatchError::Dial {
                    backend: route.backend.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(DispatchError::DialTimeout {
                    backend: route.backend.clone(),
                })
            }
        };

        debug!(backend = %route.backend, "Connected to backend");

        let proxy_header = async {
            let client_local = client.local_addr()?;
            write_proxy_header(route.send_proxy, peer_addr, client_local, &mut upstream).await
        };
        proxy_header
            .await
            .map_err(|source| DispatchError::ProxyHeader {
                backend: route.backend.clone(),
                source,
            })?;

        upstream
            .write_all(&handshake)
            .await
            .map_err(|source| DispatchError::Replay {
                backend: route.backend.clone(),
                source,
            })?;

        info!(
            peer_addr = %peer_addr,
            hostname = %hostname,
            backend = %route.backend,
            "Routing connection"
        );

        let (to_backend, from_backend) =
            relay(client, &mut upstream, self.config.idle_timeout).await;

        debug!(
            bytes_to_backend = to_backend.as_ref().copied().unwrap_or(0),
            bytes_from_backend = from_backend.as_ref().copied().unwrap_or(0),
            "Connection closed"
        );
        if let Err(e) = to_backend {
            debug!(error = %e, "Client to backend copy ended with error");
        }
        if let Err(e) = from_backend {
            debug!(error = %e, "Backend to client copy ended with error");
        }

        Ok(())
    }
}

/// Enable TCP keepalive probes with the given idle period.
fn set_keepalive(stream: &TcpStream, period: Duration) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(period);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Relay data in both directions until both are finished.
///
/// Returns the results of (a -> b, b -> a). When one direction ends, the
/// write side it was feeding is shut down so the peer observes the close.
pub async fn relay(
    a: &mut TcpStream,
    b: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> (io::Result<u64>, io::Result<u64>) {
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();

    tokio::join!(
        copy_half(a_read, b_write, idle_timeout),
        copy_half(b_read, a_write, idle_timeout),
    )
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    idle_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

    let result = loop {
        let read_result = match idle_timeout {
            Some(idle) => match timeout(idle, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await,
        };

        match read_result {
            Ok(0) => break Ok(total),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_dispatch_config_default() {
        let config = DispatchConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.alert_timeout, Duration::from_secs(3));
        assert_eq!(config.keepalive_period, Duration::from_secs(60));
        assert!(config.idle_timeout.is_none());
    }

    #[test]
    fn test_alert_for_error() {
        let route = DispatchError::Route(RouteError::NoMatch {
            hostname: "a.com".to_string(),
        });
        assert_eq!(route.alert(), AlertDescription::UnrecognizedName);

        let denied = DispatchError::Denied {
            client: "10.0.0.1".parse().unwrap(),
            hostname: "a.com".to_string(),
            backend: "127.0.0.1:9000".to_string(),
        };
        assert_eq!(denied.alert(), AlertDescription::AccessDenied);
        assert_eq!(
            denied.to_string(),
            "denied 10.0.0.1 / a.com access to 127.0.0.1:9000"
        );

        let sniff = DispatchError::Sniff(SniError::NoServerName);
        assert_eq!(sniff.alert(), AlertDescription::InternalError);

        let dial = DispatchError::DialTimeout {
            backend: "127.0.0.1:9000".to_string(),
        };
        assert_eq!(dial.alert(), AlertDescription::InternalError);
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, mut client_side) = tcp_pair().await;
        let (mut upstream_side, mut backend) = tcp_pair().await;

        let relay_task = tokio::spawn(async move {
            relay(&mut client_side, &mut upstream_side, None).await
        });

        client.write_all(b"hello backend").await.unwrap();
        let mut buf = [0u8; 13];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello backend");

        backend.write_all(b"hello client").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello client");

        // Client closes; the backend sees EOF, then closes its side too.
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        drop(backend);

        let (to_backend, from_backend) = timeout(Duration::from_secs(2), relay_task)
            .await
            .expect("relay should finish once both sides are closed")
            .unwrap();
        assert_eq!(to_backend.unwrap(), 13);
        assert_eq!(from_backend.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client, mut client_side) = tcp_pair().await;
        let (mut upstream_side, _backend) = tcp_pair().await;

        let (to_backend, from_backend) = timeout(
            Duration::from_secs(2),
            relay(
                &mut client_side,
                &mut upstream_side,
                Some(Duration::from_millis(50)),
            ),
        )
        .await
        .expect("idle relay should time out");

        assert_eq!(to_backend.unwrap_err().kind(), io::ErrorKind::TimedOut);
        assert_eq!(from_backend.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_set_keepalive() {
        let (client, _server) = tcp_pair().await;
        set_keepalive(&client, DEFAULT_KEEPALIVE_PERIOD).unwrap();
    }
}

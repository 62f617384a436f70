//! TCP listener and connection handling.
//!
//! The listener accepts connections and hands each one to the dispatcher in
//! its own task, then goes straight back to accepting. A slow or stuck
//! connection never delays the next accept.
//!
//! An accept error ends [`Listener::run`]: it usually means the listening
//! socket itself is unusable, so the caller is expected to exit.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error, info, Instrument};

use super::dispatch::Dispatcher;

/// A TCP listener for the SNI proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Shared connection dispatcher.
    dispatcher: Arc<Dispatcher>,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind<A: ToSocketAddrs>(addr: A, dispatcher: Dispatcher) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        info!(bind_addr = %local_addr, "Listener bound");

        Ok(Self {
            listener,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting and dispatching connections.
    ///
    /// Only returns on an accept failure.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(bind_addr = %local_addr, error = %e, "Accept error");
                    return Err(e);
                }
            };

            debug!(peer_addr = %peer_addr, "Connection accepted");

            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(
                async move { dispatcher.dispatch(stream, peer_addr).await }
                    .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }
    }
}

//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which is a [`tower::Service`] that connects to
//! a [`Destination`] using TCP, and the [`TcpTransportConfig`] type, which is used to configure
//! the sockets it opens.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{Instrument, trace, warn};

use crate::client::pool::Destination;

/// A TCP connector for client connections.
///
/// The destination host is resolved, and each resolved address is tried in turn
/// until one accepts the connection.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        TcpTransport::new(TcpTransportConfig::default())
    }
}

impl TcpTransport {
    /// Create a new TCP transport
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    /// Get a mutable reference to the configuration. Clones of this transport made
    /// earlier keep their configuration.
    pub fn config_mut(&mut self) -> &mut TcpTransportConfig {
        Arc::make_mut(&mut self.config)
    }
}

type BoxFuture<'a, T, E> = crate::BoxFuture<'a, Result<T, E>>;

impl tower::Service<Destination> for TcpTransport {
    type Response = TcpStream;
    type Error = TcpConnectionError;
    type Future = BoxFuture<'static, Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, destination: Destination) -> Self::Future {
        let config = self.config.clone();
        let span = tracing::trace_span!("tcp", host = %destination.host(), port = destination.port());

        Box::pin(
            async move {
                let (host, port) = destination.address();
                let addrs = tokio::net::lookup_host((host.as_str(), port))
                    .await
                    .map_err(|source| TcpConnectionError::Resolve {
                        host: host.clone(),
                        source,
                    })?;

                let mut last_error = None;
                for addr in addrs {
                    match connect(addr, &config).await {
                        Ok(stream) => {
                            trace!(peer.addr = %addr, "tcp connected");
                            return Ok(stream);
                        }
                        Err(error) => {
                            trace!(peer.addr = %addr, %error, "tcp connection attempt failed");
                            last_error = Some(error);
                        }
                    }
                }

                Err(last_error.unwrap_or(TcpConnectionError::NoAddresses { host }))
            }
            .instrument(span),
        )
    }
}

/// Open a socket for `addr` with the configured options applied.
fn socket(addr: SocketAddr, config: &TcpTransportConfig) -> io::Result<TcpSocket> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if config.reuse_address {
        apply("SO_REUSEADDR", socket.set_reuseaddr(true));
    }
    if let Some(size) = config.send_buffer_size {
        apply("SO_SNDBUF", socket.set_send_buffer_size(clamp(size)));
    }
    if let Some(size) = config.recv_buffer_size {
        apply("SO_RCVBUF", socket.set_recv_buffer_size(clamp(size)));
    }

    Ok(socket)
}

/// Socket options are best effort. A failure is logged and the connection proceeds.
fn apply(option: &'static str, result: io::Result<()>) {
    if let Err(error) = result {
        warn!(%option, %error, "unable to set socket option");
    }
}

fn clamp(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

async fn connect(
    addr: SocketAddr,
    config: &TcpTransportConfig,
) -> Result<TcpStream, TcpConnectionError> {
    let connecting = socket(addr, config)
        .map_err(TcpConnectionError::Socket)?
        .connect(addr);

    let stream = match config.connect_timeout {
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| TcpConnectionError::Timeout { addr, timeout })?,
        None => connecting.await,
    }
    .map_err(|source| TcpConnectionError::Connect { addr, source })?;

    if config.nodelay {
        apply("TCP_NODELAY", stream.set_nodelay(true));
    }

    Ok(stream)
}

/// Error type for TCP connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TcpConnectionError {
    /// The destination host could not be resolved.
    #[error("unable to resolve {host}")]
    Resolve {
        /// The host name.
        host: String,
        /// The resolver error.
        #[source]
        source: io::Error,
    },

    /// The destination host resolved to no addresses.
    #[error("{host} resolved to no addresses")]
    NoAddresses {
        /// The host name.
        host: String,
    },

    /// A socket could not be opened.
    #[error("unable to open socket")]
    Socket(#[source] io::Error),

    /// The connection attempt to one address did not finish in time.
    #[error("connecting to {addr} timed out after {timeout:?}")]
    Timeout {
        /// The address being connected to.
        addr: SocketAddr,
        /// The configured per-address timeout.
        timeout: Duration,
    },

    /// The connection attempt to one address failed.
    #[error("unable to connect to {addr}")]
    Connect {
        /// The address being connected to.
        addr: SocketAddr,
        /// The socket error.
        #[source]
        source: io::Error,
    },
}

impl From<TcpConnectionError> for io::Error {
    fn from(error: TcpConnectionError) -> Self {
        let kind = match &error {
            TcpConnectionError::Resolve { source, .. }
            | TcpConnectionError::Connect { source, .. }
            | TcpConnectionError::Socket(source) => source.kind(),
            TcpConnectionError::NoAddresses { .. } => io::ErrorKind::NotFound,
            TcpConnectionError::Timeout { .. } => io::ErrorKind::TimedOut,
        };
        io::Error::new(kind, error)
    }
}

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TcpTransportConfig {
    /// The timeout for a single connection attempt to one resolved address.
    pub connect_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

impl TcpTransportConfig {
    /// Set the per-address connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Request a socket send buffer size.
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Request a socket receive buffer size.
    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }
}

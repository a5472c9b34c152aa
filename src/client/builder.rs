//! Builder pattern for clients

use super::Dispatcher;
use super::conn::{Protocol, Transport};
use super::dispatch::ConnectionOf;
use super::pool::{Config, PoolableConnection};

#[cfg(feature = "h2")]
use super::conn::protocol::http2::Http2Protocol;
#[cfg(feature = "h2")]
use super::conn::transport::TcpTransport;

/// Sentinel indicating a client needs to pick a transport.
#[derive(Debug, Clone, Copy)]
pub struct NeedsTransport;

/// Sentinel indicating a client needs to pick a protocol.
#[derive(Debug, Clone, Copy)]
pub struct NeedsProtocol;

/// Builder-pattern for clients
#[derive(Debug)]
pub struct ClientBuilder<T, P> {
    transport: T,
    protocol: P,
    config: Config,
}

impl ClientBuilder<NeedsTransport, NeedsProtocol> {
    /// Create a new builder struct
    pub fn new() -> Self {
        ClientBuilder {
            transport: NeedsTransport,
            protocol: NeedsProtocol,
            config: Config::default(),
        }
    }

    /// A builder for HTTP/2 over TCP, with default settings.
    #[cfg(feature = "h2")]
    pub fn http2() -> ClientBuilder<TcpTransport, Http2Protocol> {
        Self::new()
            .with_transport(TcpTransport::default())
            .with_protocol(Http2Protocol::default())
    }
}

impl Default for ClientBuilder<NeedsTransport, NeedsProtocol> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> ClientBuilder<NeedsTransport, P> {
    /// Set the selected transport
    pub fn with_transport<T>(self, transport: T) -> ClientBuilder<T, P> {
        ClientBuilder {
            transport,
            protocol: self.protocol,
            config: self.config,
        }
    }
}

impl<T> ClientBuilder<T, NeedsProtocol> {
    /// Set the selected protocol
    pub fn with_protocol<P>(self, protocol: P) -> ClientBuilder<T, P> {
        ClientBuilder {
            transport: self.transport,
            protocol,
            config: self.config,
        }
    }
}

impl<T, P> ClientBuilder<T, P> {
    /// Set the pool configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Access the pool configuration in place
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Access the transport in place
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Access the protocol in place
    pub fn protocol_mut(&mut self) -> &mut P {
        &mut self.protocol
    }
}

impl<T, P> ClientBuilder<T, P>
where
    T: Transport + Clone + Sync + 'static,
{
    /// Build a dispatcher for requests of type `R`.
    pub fn build<R>(self) -> Dispatcher<T, P, R>
    where
        P: Protocol<T::IO, R> + Clone + Send + Sync + 'static,
        ConnectionOf<T, P, R>: PoolableConnection<R>,
        R: Send + 'static,
    {
        Dispatcher::new(self.transport, self.protocol, self.config)
    }
}

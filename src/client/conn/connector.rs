//! Connectors couple a transport with a protocol to dial a destination.
//!
//! A dial is the transport connect followed by the protocol handshake, bounded as a whole
//! by the dial timeout. The pool drives at most one dial per destination at a time, and
//! always outside of its lock.

use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use tracing::Instrument as _;
use tracing::{debug, trace};

use super::protocol::{Protocol, ProtocolExt};
use super::transport::{Transport, TransportExt as _};
use crate::client::error::{DialError, cause};
use crate::client::pool::Destination;

/// Tracing spans for one dial.
struct ConnectorMeta {
    overall_span: tracing::Span,
}

impl ConnectorMeta {
    fn new(destination: &Destination) -> Self {
        Self {
            overall_span: tracing::debug_span!("dial", %destination),
        }
    }

    fn transport(&self) -> tracing::Span {
        tracing::trace_span!(parent: &self.overall_span, "transport")
    }

    fn protocol(&self) -> tracing::Span {
        tracing::trace_span!(parent: &self.overall_span, "protocol")
    }
}

/// A connector holds everything needed to dial one destination.
pub struct Connector<T, P, R> {
    transport: T,
    protocol: P,
    destination: Destination,
    timeout: Option<Duration>,
    _request: PhantomData<fn(R)>,
}

impl<T, P, R> fmt::Debug for Connector<T, P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("destination", &self.destination)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T, P, R> Connector<T, P, R>
where
    T: Transport + 'static,
    P: Protocol<T::IO, R> + Send + 'static,
    P::Connection: Send + 'static,
    R: Send + 'static,
{
    /// Create a connector which dials `destination`.
    pub fn new(
        transport: T,
        protocol: P,
        destination: Destination,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            protocol,
            destination,
            timeout,
            _request: PhantomData,
        }
    }

    /// The destination this connector dials.
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Connect the transport and complete the protocol handshake.
    pub fn connect(
        self,
    ) -> impl Future<Output = Result<P::Connection, DialError>> + Send + 'static {
        let meta = ConnectorMeta::new(&self.destination);
        let span = meta.overall_span.clone();
        let Connector {
            transport,
            protocol,
            destination,
            timeout,
            ..
        } = self;

        async move {
            let dial = async {
                let stream = transport
                    .oneshot(destination.clone())
                    .instrument(meta.transport())
                    .await
                    .map_err(|error| DialError::Connect {
                        destination: destination.clone(),
                        source: cause(error),
                    })?;
                trace!("transport connected");

                let connection = ProtocolExt::<T::IO, R>::handshake(protocol, stream)
                    .instrument(meta.protocol())
                    .await
                    .map_err(|error| DialError::Handshake {
                        destination: destination.clone(),
                        source: cause(error),
                    })?;
                trace!("handshake complete");
                Ok(connection)
            };

            let result = match timeout {
                Some(timeout) => match tokio::time::timeout(timeout, dial).await {
                    Ok(result) => result,
                    Err(_) => Err(DialError::Timeout {
                        destination: destination.clone(),
                        timeout,
                    }),
                },
                None => dial.await,
            };

            if let Err(error) = &result {
                debug!(%error, "dial failed");
            }
            result
        }
        .instrument(span)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    use crate::client::conn::protocol::mock::{MockProtocol, MockRequest};
    use crate::client::conn::transport::mock::MockTransport;

    fn destination() -> Destination {
        "http://mock.local".parse().unwrap()
    }

    fn connector(
        transport: MockTransport,
        protocol: MockProtocol,
        timeout: Option<Duration>,
    ) -> Connector<MockTransport, MockProtocol, MockRequest> {
        Connector::new(transport, protocol, destination(), timeout)
    }

    #[tokio::test]
    async fn connects() {
        let transport = MockTransport::new();
        let connection = connector(transport.clone(), MockProtocol::default(), None)
            .connect()
            .await;
        assert!(connection.is_ok());
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn transport_error() {
        let error = connector(MockTransport::error(), MockProtocol::default(), None)
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(error, DialError::Connect { .. }));
        assert_eq!(error.destination(), &destination());
    }

    #[tokio::test]
    async fn handshake_error() {
        let error = connector(MockTransport::new(), MockProtocol::failing(), None)
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(error, DialError::Handshake { .. }));
    }

    #[tokio::test]
    async fn timeout() {
        let error = connector(
            MockTransport::stalled(),
            MockProtocol::default(),
            Some(Duration::from_millis(10)),
        )
        .connect()
        .await
        .unwrap_err();
        assert!(error.is_timeout());
    }

    #[test]
    fn debug() {
        let connector = connector(MockTransport::new(), MockProtocol::default(), None);
        let debug = format!("{connector:?}");
        assert!(debug.starts_with("Connector { destination: "));
    }
}

//! Request dispatch over pooled connections.
//!
//! Every send follows the same path: acquire the destination's connection from the pool,
//! open a stream on it, move the request and response over that stream, and release the
//! lease. The lease and the stream are released on every path out of a send, including
//! when the caller drops the send future.

use std::fmt;
use std::task::{Context, Poll};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::conn::{Connection, Connector, Protocol, Transport};
use super::error::{Error, StreamOpenError};
use super::pool::{
    Checkout, Config, Destination, Lease, Pool, PoolableConnection, Routable, Stream,
};
use crate::{BoxFuture, DebugLiteral};

/// The connection type produced by protocol `P` over transport `T`.
pub type ConnectionOf<T, P, R> = <P as Protocol<<T as Transport>::IO, R>>::Connection;

/// The response type of a [`Dispatcher`].
pub type ResponseOf<T, P, R> = <ConnectionOf<T, P, R> as Connection<R>>::Response;

/// Sends requests to destinations over a shared pool of multiplexed connections.
///
/// Cloning a dispatcher is cheap, and clones share the same pool.
pub struct Dispatcher<T, P, R>
where
    T: Transport,
    P: Protocol<T::IO, R>,
    ConnectionOf<T, P, R>: PoolableConnection<R>,
    R: Send + 'static,
{
    transport: T,
    protocol: P,
    pool: Pool<ConnectionOf<T, P, R>, R>,
}

impl<T, P, R> Clone for Dispatcher<T, P, R>
where
    T: Transport + Clone,
    P: Protocol<T::IO, R> + Clone,
    ConnectionOf<T, P, R>: PoolableConnection<R>,
    R: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            protocol: self.protocol.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl<T, P, R> fmt::Debug for Dispatcher<T, P, R>
where
    T: Transport,
    P: Protocol<T::IO, R>,
    ConnectionOf<T, P, R>: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &DebugLiteral(std::any::type_name::<T>()))
            .field("protocol", &DebugLiteral(std::any::type_name::<P>()))
            .field("pool", &self.pool)
            .finish()
    }
}

impl<T, P, R> Dispatcher<T, P, R>
where
    T: Transport + Clone + Sync + 'static,
    P: Protocol<T::IO, R> + Clone + Send + Sync + 'static,
    ConnectionOf<T, P, R>: PoolableConnection<R>,
    R: Send + 'static,
{
    /// Create a dispatcher with an empty pool.
    pub fn new(transport: T, protocol: P, config: Config) -> Self {
        Self {
            transport,
            protocol,
            pool: Pool::new(config),
        }
    }

    /// The connection pool shared by this dispatcher and its clones.
    pub fn pool(&self) -> &Pool<ConnectionOf<T, P, R>, R> {
        &self.pool
    }

    /// The pool configuration.
    pub fn config(&self) -> &Config {
        self.pool.config()
    }

    /// Acquire a lease on the connection for `destination`, dialing it if needed.
    pub fn acquire(&self, destination: &Destination) -> Checkout<ConnectionOf<T, P, R>, R> {
        let connector = Connector::new(
            self.transport.clone(),
            self.protocol.clone(),
            destination.clone(),
            self.pool.config().dial_timeout,
        );
        self.pool.checkout(destination.clone(), connector)
    }

    /// Acquire a lease and open a stream on it.
    ///
    /// A lease whose connection turns out to be closed is replaced by one fresh
    /// checkout. Any other stream-open failure, including a connection at its stream
    /// limit, is returned to the caller.
    async fn open(
        &self,
        destination: &Destination,
    ) -> Result<
        (
            Lease<ConnectionOf<T, P, R>, R>,
            Stream<ConnectionOf<T, P, R>, R>,
        ),
        Error,
    > {
        let lease = self.acquire(destination).await?;
        match lease.open_stream() {
            Ok(stream) => Ok((lease, stream)),
            Err(StreamOpenError::Closed { id }) => {
                debug!(%id, "leased connection closed, retrying with a fresh checkout");
                drop(lease);

                let lease = self.acquire(destination).await?;
                let stream = lease.open_stream()?;
                Ok((lease, stream))
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Send `request` to `destination` and wait for its response.
    ///
    /// With a request timeout configured, a send which runs past it returns
    /// [`Error::Timeout`]. The lease and stream are released and the connection stays in
    /// the pool.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%destination), level = "debug"))]
    pub async fn send(
        &self,
        destination: &Destination,
        request: R,
    ) -> Result<ResponseOf<T, P, R>, Error> {
        let Some(timeout) = self.pool.config().request_timeout else {
            return self.dispatch(destination, request).await;
        };

        match tokio::time::timeout(timeout, self.dispatch(destination, request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(?timeout, "request timed out");
                Err(Error::Timeout { timeout })
            }
        }
    }

    async fn dispatch(
        &self,
        destination: &Destination,
        request: R,
    ) -> Result<ResponseOf<T, P, R>, Error> {
        let (lease, stream) = self.open(destination).await?;
        trace!(id = %lease.id(), "stream open, sending request");

        let result = stream.send(request).await;
        lease.release();
        Ok(result?)
    }

    /// Send `request` to `destination`, giving up when `token` is cancelled.
    ///
    /// Cancelling releases whatever the send held. A dial this send started keeps
    /// running for any other caller waiting on it, and the connection stays usable.
    pub async fn send_cancellable(
        &self,
        destination: &Destination,
        request: R,
        token: &CancellationToken,
    ) -> Result<ResponseOf<T, P, R>, Error> {
        tokio::select! {
            biased;

            () = token.cancelled() => {
                debug!(%destination, "request cancelled");
                Err(Error::Cancelled)
            }
            result = self.send(destination, request) => result,
        }
    }
}

impl<T, P, R> tower::Service<R> for Dispatcher<T, P, R>
where
    T: Transport + Clone + Sync + 'static,
    P: Protocol<T::IO, R> + Clone + Send + Sync + 'static,
    ConnectionOf<T, P, R>: PoolableConnection<R>,
    R: Routable + Send + 'static,
{
    type Response = ResponseOf<T, P, R>;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut request: R) -> Self::Future {
        let dispatcher = self.clone();
        Box::pin(async move {
            let destination = request.destination()?;
            request.route(&destination);
            dispatcher.send(&destination, request).await
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use static_assertions::assert_impl_all;

    use super::*;

    use crate::client::conn::protocol::mock::{MockProtocol, MockRequest, MockResponse};
    use crate::client::conn::transport::mock::MockTransport;
    use crate::client::error::{DialError, TransferError};
    use crate::client::pool::Readiness;

    type TestDispatcher = Dispatcher<MockTransport, MockProtocol, MockRequest>;

    assert_impl_all!(TestDispatcher: Clone, Send, Sync, fmt::Debug);

    fn destination(name: &str) -> Destination {
        format!("http://{name}").parse().unwrap()
    }

    fn dispatcher(transport: &MockTransport, config: Config) -> TestDispatcher {
        Dispatcher::new(transport.clone(), MockProtocol::default(), config)
    }

    #[tokio::test]
    async fn send_releases_lease() {
        crate::fixtures::subscribe();
        let transport = MockTransport::new();
        let client = dispatcher(&transport, Config::default());
        let dest = destination("a.local");

        let response = client.send(&dest, MockRequest::echo("one")).await.unwrap();
        assert_eq!(response, MockResponse::new("one"));

        let stats = client.pool().stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.leases, 0);
        assert_eq!(stats.streams, 0);

        client.send(&dest, MockRequest::echo("two")).await.unwrap();
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn errors_release_lease() {
        let transport = MockTransport::new();
        let client = dispatcher(&transport, Config::default());
        let dest = destination("a.local");

        let error = client.send(&dest, MockRequest::fail(false)).await.unwrap_err();
        assert!(matches!(error, Error::Transfer(TransferError::Stream(_))));
        assert_eq!(client.pool().stats().leases, 0);
        assert_eq!(client.pool().readiness(&dest), Some(Readiness::Ready));

        let error = client.send(&dest, MockRequest::fail(true)).await.unwrap_err();
        assert!(matches!(error, Error::Transfer(TransferError::Transport(_))));
        assert_eq!(client.pool().readiness(&dest), None);

        client.send(&dest, MockRequest::echo("again")).await.unwrap();
        assert_eq!(transport.dials(), 2);
    }

    #[tokio::test]
    async fn dial_failure() {
        let client = dispatcher(&MockTransport::error(), Config::default());
        let error = client
            .send(&destination("a.local"), MockRequest::echo("x"))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Dial(DialError::Connect { .. })));
    }

    #[tokio::test]
    async fn dial_timeout() {
        let config = Config::default().with_dial_timeout(Some(Duration::from_millis(10)));
        let client = dispatcher(&MockTransport::stalled(), config);
        let error = client
            .send(&destination("a.local"), MockRequest::echo("x"))
            .await
            .unwrap_err();
        match error {
            Error::Dial(error) => assert!(error.is_timeout()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_limit_rejects() {
        let transport = MockTransport::new();
        let client = dispatcher(
            &transport,
            Config::default().with_max_streams_per_connection(1),
        );
        let dest = destination("a.local");

        let stalled = tokio::spawn({
            let client = client.clone();
            let dest = dest.clone();
            async move { client.send(&dest, MockRequest::Stall).await }
        });
        while client.pool().stats().streams == 0 {
            tokio::task::yield_now().await;
        }

        let error = client.send(&dest, MockRequest::echo("x")).await.unwrap_err();
        assert!(matches!(
            error,
            Error::StreamOpen(StreamOpenError::AtCapacity { limit: 1, .. })
        ));

        stalled.abort();
        let _ = stalled.await;
        assert_eq!(client.pool().stats().streams, 0);
        client.send(&dest, MockRequest::echo("x")).await.unwrap();
    }

    #[tokio::test]
    async fn request_timeout_keeps_connection() {
        let transport = MockTransport::new();
        let timeout = Duration::from_millis(20);
        let client = dispatcher(
            &transport,
            Config::default().with_request_timeout(Some(timeout)),
        );
        let dest = destination("a.local");

        let error = client.send(&dest, MockRequest::Stall).await.unwrap_err();
        assert!(matches!(error, Error::Timeout { timeout: t } if t == timeout));
        assert!(error.is_timeout());

        let stats = client.pool().stats();
        assert_eq!(stats.leases, 0);
        assert_eq!(stats.streams, 0);
        assert_eq!(client.pool().readiness(&dest), Some(Readiness::Ready));

        client.send(&dest, MockRequest::echo("after")).await.unwrap();
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn request_timeout_covers_dial() {
        let (transport, gate) = MockTransport::gated();
        let client = dispatcher(
            &transport,
            Config::default().with_request_timeout(Some(Duration::from_millis(20))),
        );
        let dest = destination("a.local");

        let error = client.send(&dest, MockRequest::echo("x")).await.unwrap_err();
        assert!(matches!(error, Error::Timeout { .. }));

        // The dial keeps running in the background and is installed once it completes.
        gate.open();
        let response = client.send(&dest, MockRequest::echo("later")).await.unwrap();
        assert_eq!(response.body(), "later");
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn many_concurrent_sends_share_one_dial() {
        let (transport, gate) = MockTransport::gated();
        let client = dispatcher(&transport, Config::default());
        let dest = destination("a.local");

        let sends = (0..20).map(|i| {
            let client = client.clone();
            let dest = dest.clone();
            tokio::spawn(async move { client.send(&dest, MockRequest::echo(i.to_string())).await })
        });
        let sends: Vec<_> = sends.collect();

        tokio::task::yield_now().await;
        gate.open();

        for (i, send) in join_all(sends).await.into_iter().enumerate() {
            assert_eq!(send.unwrap().unwrap().body(), i.to_string());
        }
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn cancellation_does_not_close_connection() {
        let transport = MockTransport::new();
        let client = dispatcher(&transport, Config::default());
        let dest = destination("a.local");
        let token = CancellationToken::new();

        let pending = tokio::spawn({
            let client = client.clone();
            let dest = dest.clone();
            let token = token.clone();
            async move {
                client
                    .send_cancellable(&dest, MockRequest::Stall, &token)
                    .await
            }
        });
        while client.pool().stats().streams == 0 {
            tokio::task::yield_now().await;
        }

        token.cancel();
        let error = pending.await.unwrap().unwrap_err();
        assert!(error.is_cancelled());

        let stats = client.pool().stats();
        assert_eq!(stats.streams, 0);
        assert_eq!(stats.leases, 0);
        assert_eq!(client.pool().readiness(&dest), Some(Readiness::Ready));

        client.send(&dest, MockRequest::echo("after")).await.unwrap();
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn cancelled_dialer_leaves_dial_for_others() {
        let (transport, gate) = MockTransport::gated();
        let client = dispatcher(&transport, Config::default());
        let dest = destination("a.local");
        let token = CancellationToken::new();

        let cancelled = tokio::spawn({
            let client = client.clone();
            let dest = dest.clone();
            let token = token.clone();
            async move {
                client
                    .send_cancellable(&dest, MockRequest::echo("first"), &token)
                    .await
            }
        });
        while transport.dials() == 0 {
            tokio::task::yield_now().await;
        }

        let waiting = tokio::spawn({
            let client = client.clone();
            let dest = dest.clone();
            async move { client.send(&dest, MockRequest::echo("second")).await }
        });
        tokio::task::yield_now().await;

        token.cancel();
        assert!(cancelled.await.unwrap().unwrap_err().is_cancelled());

        gate.open();
        let response = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(response.body(), "second");
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn broken_connection_is_redialed() {
        let transport = MockTransport::new();
        let client = dispatcher(&transport, Config::default().with_idle_timeout(None));
        let dest = destination("a.local");

        let lease = client.acquire(&dest).await.unwrap();
        let stream = lease.open_stream().unwrap();
        drop(lease);

        let _ = stream.send(MockRequest::fail(true)).await;
        assert_eq!(client.pool().readiness(&dest), None);

        let response = client.send(&dest, MockRequest::echo("fresh")).await.unwrap();
        assert_eq!(response.body(), "fresh");
        assert_eq!(transport.dials(), 2);
    }

    #[test]
    fn debug_names_parts() {
        let client = dispatcher(&MockTransport::new(), Config::default());
        let debug = format!("{client:?}");
        assert!(debug.contains("MockTransport"));
        assert!(debug.contains("MockProtocol"));
    }
}

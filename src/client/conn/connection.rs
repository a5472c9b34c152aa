//! Connections carry logical request/response streams over an established byte stream.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A handle onto an established connection which can send a request and wait for its
/// response on a new logical stream.
///
/// For multiplexed protocols, many handles may refer to the same connection; each call
/// to [`Connection::send_request`] occupies one stream on it.
pub trait Connection<Req> {
    /// The response type for this connection
    type Response: Send + 'static;

    /// The error type for this connection
    type Error: std::error::Error + Send + Sync + 'static;

    /// The future which drives one request/response exchange.
    type Future: Future<Output = Result<Self::Response, Self::Error>> + Send + 'static;

    /// Send a request on a new stream and return the response.
    fn send_request(&mut self, request: Req) -> Self::Future;

    /// Poll the connection to see if it can open another stream.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

/// Extension trait for `Connection` providing additional methods.
pub trait ConnectionExt<R>: Connection<R> {
    /// Future which resolves when the connection is ready to accept a new request.
    fn when_ready(&mut self) -> WhenReady<'_, Self, R> {
        WhenReady {
            conn: self,
            _request: PhantomData,
        }
    }
}

impl<T, R> ConnectionExt<R> for T where T: Connection<R> {}

/// A future which resolves when the connection can open another stream.
#[derive(Debug)]
pub struct WhenReady<'a, C, R>
where
    C: Connection<R> + ?Sized,
{
    conn: &'a mut C,
    _request: PhantomData<fn(R)>,
}

impl<C, R> Future for WhenReady<'_, C, R>
where
    C: Connection<R> + ?Sized,
{
    type Output = Result<(), C::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.conn.poll_ready(cx)
    }
}

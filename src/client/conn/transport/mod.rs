//! Transports establish the byte streams that connections run over.
//!
//! A transport is any [`tower::Service`] which accepts a [`Destination`] and returns an
//! async byte stream. TCP is provided in [`tcp`].

use std::future::Future;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite};
use tower::Service;

use crate::client::pool::Destination;

#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod tcp;

pub use self::tcp::{TcpConnectionError, TcpTransport, TcpTransportConfig};

/// A transport provides data transmission between two endpoints.
///
/// To implement a transport, implement a [`tower::Service`] which accepts a [`Destination`]
/// and returns an IO stream, which must be compatible with a [`super::Protocol`].
pub trait Transport: Send {
    /// The type of IO stream used by this transport
    type IO: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Error returned when connection fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// The future type returned by this service
    type Future: Future<Output = Result<Self::IO, Self::Error>> + Send + 'static;

    /// Connect to a remote destination and return a stream.
    fn connect(&mut self, destination: &Destination) -> Self::Future;

    /// Poll the transport to see if it is ready to accept a new connection.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>>;
}

impl<T, IO, F, E> Transport for T
where
    T: Service<Destination, Response = IO, Future = F, Error = E>,
    T: Clone + Send + Sync + 'static,
    E: std::error::Error + Send + Sync + 'static,
    F: Future<Output = Result<IO, E>> + Send + 'static,
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type IO = IO;
    type Error = E;
    type Future = F;

    fn connect(&mut self, destination: &Destination) -> Self::Future {
        self.call(destination.clone())
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Service::poll_ready(self, cx)
    }
}

/// Extension trait for Transports to provide additional methods.
pub trait TransportExt: Transport {
    /// Create a future which uses the given transport to connect after calling poll_ready.
    fn oneshot(self, destination: Destination) -> Oneshot<Self>
    where
        Self: Sized,
    {
        Oneshot::new(self, destination)
    }
}

impl<T> TransportExt for T where T: Transport {}

mod oneshot {
    use std::fmt;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll, ready};

    use super::Transport;
    use crate::client::pool::Destination;

    #[pin_project::pin_project(project = OneshotStateProj)]
    enum OneshotState<T>
    where
        T: Transport,
    {
        Pending {
            transport: T,
            destination: Destination,
        },
        Connecting(#[pin] T::Future),
    }

    impl<T> fmt::Debug for OneshotState<T>
    where
        T: Transport,
    {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                OneshotState::Pending { destination, .. } => f
                    .debug_struct("Pending")
                    .field("destination", destination)
                    .finish(),
                OneshotState::Connecting(_) => f.debug_struct("Connecting").finish(),
            }
        }
    }

    /// Future returned by [`TransportExt::oneshot`][super::TransportExt::oneshot].
    #[derive(Debug)]
    #[pin_project::pin_project]
    pub struct Oneshot<T>
    where
        T: Transport,
    {
        #[pin]
        state: OneshotState<T>,
    }

    impl<T> Oneshot<T>
    where
        T: Transport,
    {
        pub(super) fn new(transport: T, destination: Destination) -> Self {
            Self {
                state: OneshotState::Pending {
                    transport,
                    destination,
                },
            }
        }
    }

    impl<T> Future for Oneshot<T>
    where
        T: Transport,
    {
        type Output = Result<T::IO, T::Error>;

        fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
            let mut this = self.project();
            loop {
                match this.state.as_mut().project() {
                    OneshotStateProj::Pending {
                        transport,
                        destination,
                    } => {
                        ready!(transport.poll_ready(cx))?;
                        let future = transport.connect(destination);
                        this.state.set(OneshotState::Connecting(future));
                    }
                    OneshotStateProj::Connecting(future) => {
                        return future.poll(cx);
                    }
                }
            }
        }
    }
}

pub use self::oneshot::Oneshot;

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    use self::mock::MockTransport;

    assert_impl_all!(TcpTransport: Transport, Clone);
    assert_impl_all!(MockTransport: Transport, Clone);

    #[tokio::test]
    async fn oneshot_connects() {
        let transport = MockTransport::new();
        let destination: Destination = "http://mock.local".parse().unwrap();

        let stream = transport.clone().oneshot(destination).await;
        assert!(stream.is_ok());
        assert_eq!(transport.dials(), 1);
    }
}

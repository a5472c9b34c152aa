//! Protocols turn an established byte stream into a [`Connection`].
//!
//! The protocol performs whatever handshake is needed on the raw stream and hands back a
//! connection which can open logical streams. HTTP/2 is provided in [`http2`] with the
//! `h2` feature.

use std::future::Future;
use std::task::{Context, Poll};

use tower::Service;

use super::Connection;

#[cfg(feature = "h2")]
pub mod http2;
#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Protocols (like HTTP/2) define how requests are carried over a byte stream.
///
/// A protocol is a service which accepts the transport's IO stream and returns a
/// connection once the handshake has completed.
pub trait Protocol<IO, Req>
where
    Self: Service<IO, Response = Self::Connection>,
{
    /// Error returned when the handshake fails
    type Error: std::error::Error + Send + Sync + 'static;

    /// The type of connection returned by this service
    type Connection: Connection<Req>;

    /// The type of the handshake future
    type Future: Future<Output = Result<Self::Connection, <Self as Protocol<IO, Req>>::Error>>
        + Send
        + 'static;

    /// Perform the protocol handshake over `transport` and return a connection.
    fn connect(&mut self, transport: IO) -> <Self as Protocol<IO, Req>>::Future;

    /// Poll the protocol to see if it is ready to accept a new connection.
    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Protocol<IO, Req>>::Error>>;
}

impl<T, C, IO, Req> Protocol<IO, Req> for T
where
    T: Service<IO, Response = C> + Send + 'static,
    T::Error: std::error::Error + Send + Sync + 'static,
    T::Future: Send + 'static,
    C: Connection<Req>,
{
    type Error = T::Error;
    type Connection = C;
    type Future = T::Future;

    fn connect(&mut self, transport: IO) -> <Self as Protocol<IO, Req>>::Future {
        self.call(transport)
    }

    fn poll_ready(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), <Self as Protocol<IO, Req>>::Error>> {
        Service::poll_ready(self, cx)
    }
}

/// Extension trait for protocols.
pub trait ProtocolExt<IO, Req>: Protocol<IO, Req> {
    /// Wait for the protocol to be ready, then handshake over `transport`.
    fn handshake(self, transport: IO) -> Handshake<Self, IO, Req>
    where
        Self: Sized,
    {
        Handshake {
            state: HandshakeState::Pending {
                protocol: self,
                transport: Some(transport),
            },
        }
    }
}

impl<P, IO, Req> ProtocolExt<IO, Req> for P where P: Protocol<IO, Req> {}

#[pin_project::pin_project(project = HandshakeStateProj)]
enum HandshakeState<P, IO, Req>
where
    P: Protocol<IO, Req>,
{
    Pending {
        protocol: P,
        transport: Option<IO>,
    },
    Handshaking(#[pin] <P as Protocol<IO, Req>>::Future),
}

/// Future returned by [`ProtocolExt::handshake`].
#[pin_project::pin_project]
pub struct Handshake<P, IO, Req>
where
    P: Protocol<IO, Req>,
{
    #[pin]
    state: HandshakeState<P, IO, Req>,
}

impl<P, IO, Req> std::fmt::Debug for Handshake<P, IO, Req>
where
    P: Protocol<IO, Req>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            HandshakeState::Pending { .. } => "Pending",
            HandshakeState::Handshaking(_) => "Handshaking",
        };
        f.debug_tuple("Handshake")
            .field(&crate::DebugLiteral(state))
            .finish()
    }
}

impl<P, IO, Req> Future for Handshake<P, IO, Req>
where
    P: Protocol<IO, Req>,
{
    type Output = Result<P::Connection, <P as Protocol<IO, Req>>::Error>;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.state.as_mut().project() {
                HandshakeStateProj::Pending {
                    protocol,
                    transport,
                } => {
                    std::task::ready!(<P as Protocol<IO, Req>>::poll_ready(protocol, cx))?;
                    let Some(io) = transport.take() else {
                        panic!("handshake polled after its transport was consumed");
                    };
                    let future = <P as Protocol<IO, Req>>::connect(protocol, io);
                    this.state.set(HandshakeState::Handshaking(future));
                }
                HandshakeStateProj::Handshaking(future) => return future.poll(cx),
            }
        }
    }
}

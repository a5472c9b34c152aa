//! A transport with scripted behavior, suitable for testing pool and dispatch logic.

use std::future::ready;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::DuplexStream;
use tokio::sync::watch;

use crate::BoxFuture;
use crate::client::pool::Destination;

/// The byte stream produced by [`MockTransport`]. Nothing listens on the other end.
pub type MockStream = DuplexStream;

/// An error that can occur when creating a mock transport.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection error")]
pub struct MockConnectionError;

#[derive(Debug)]
enum TransportMode {
    Immediate,
    ConnectionError,
    Gated(watch::Receiver<bool>),
    Stall,
}

#[derive(Debug)]
struct MockTransportInner {
    mode: TransportMode,
    dials: AtomicUsize,
}

/// A mock transport that can be used to test connection behavior.
///
/// Clones share their mode and their dial counter.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    fn with_mode(mode: TransportMode) -> Self {
        Self {
            inner: Arc::new(MockTransportInner {
                mode,
                dials: AtomicUsize::new(0),
            }),
        }
    }

    /// Transport which connects immediately.
    pub fn new() -> Self {
        Self::with_mode(TransportMode::Immediate)
    }

    /// Transport which returns an error during connection attempts
    pub fn error() -> Self {
        Self::with_mode(TransportMode::ConnectionError)
    }

    /// Transport whose connection attempts never complete.
    pub fn stalled() -> Self {
        Self::with_mode(TransportMode::Stall)
    }

    /// Transport whose connection attempts complete once the returned gate is opened.
    ///
    /// Dropping the gate without opening it fails every pending attempt.
    pub fn gated() -> (Self, MockGate) {
        let (tx, rx) = watch::channel(false);
        (Self::with_mode(TransportMode::Gated(rx)), MockGate(tx))
    }

    /// The number of connection attempts started so far.
    pub fn dials(&self) -> usize {
        self.inner.dials.load(Ordering::SeqCst)
    }
}

/// Releases the connection attempts of a gated [`MockTransport`].
#[derive(Debug)]
pub struct MockGate(watch::Sender<bool>);

impl MockGate {
    /// Let pending and future connection attempts complete.
    pub fn open(&self) {
        self.0.send_replace(true);
    }
}

fn stream() -> MockStream {
    let (stream, _) = tokio::io::duplex(64);
    stream
}

impl tower::Service<Destination> for MockTransport {
    type Response = MockStream;
    type Error = MockConnectionError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, destination: Destination) -> Self::Future {
        let attempt = self.inner.dials.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::trace!(%destination, %attempt, "mock dial");

        match &self.inner.mode {
            TransportMode::Immediate => Box::pin(ready(Ok(stream()))),
            TransportMode::ConnectionError => Box::pin(ready(Err(MockConnectionError))),
            TransportMode::Stall => Box::pin(std::future::pending()),
            TransportMode::Gated(gate) => {
                let mut gate = gate.clone();
                Box::pin(async move {
                    match gate.wait_for(|open| *open).await {
                        Ok(_) => Ok(stream()),
                        Err(_) => Err(MockConnectionError),
                    }
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt as _;
    use tower::ServiceExt as _;

    use super::*;

    fn destination() -> Destination {
        "http://mock.local".parse().unwrap()
    }

    #[tokio::test]
    async fn immediate() {
        let transport = MockTransport::new();
        let result = transport.clone().oneshot(destination()).await;
        assert!(result.is_ok());
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn error() {
        let transport = MockTransport::error();
        let result = transport.clone().oneshot(destination()).await;
        assert_eq!(result.unwrap_err(), MockConnectionError);
        assert_eq!(transport.dials(), 1);
    }

    #[tokio::test]
    async fn stalled() {
        let transport = MockTransport::stalled();
        let result =
            tokio::time::timeout(Duration::from_millis(20), transport.oneshot(destination())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn gated() {
        let (transport, gate) = MockTransport::gated();
        let mut pending = transport.clone().oneshot(destination());
        assert!((&mut pending).now_or_never().is_none());

        gate.open();
        assert!(pending.await.is_ok());

        // Attempts started after the gate opened complete immediately.
        assert!(transport.clone().oneshot(destination()).await.is_ok());
        assert_eq!(transport.dials(), 2);
    }

    #[tokio::test]
    async fn gate_dropped() {
        let (transport, gate) = MockTransport::gated();
        drop(gate);
        let result = transport.oneshot(destination()).await;
        assert_eq!(result.unwrap_err(), MockConnectionError);
    }
}

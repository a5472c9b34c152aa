//! Mock protocol implementation for testing purposes.
//!
//! [`MockConnection`] behaves like a multiplexed connection: every handle derived from it
//! shares its open/closed state and request counter, and the request type scripts how
//! each exchange ends.

use std::future::{pending, ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::task::{Context, Poll};

use thiserror::Error;

use crate::BoxFuture;
use crate::client::conn::Connection;
use crate::client::conn::transport::mock::MockStream;
use crate::client::pool::PoolableConnection;

/// Scripted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    /// Respond with the given body.
    Echo(String),

    /// Fail the exchange. A transport failure also closes the connection.
    Fail {
        /// Should the failure be attributed to the connection rather than the stream?
        transport: bool,
    },

    /// Never respond.
    Stall,
}

impl MockRequest {
    /// A request which is answered with `body`.
    pub fn echo<S: Into<String>>(body: S) -> Self {
        MockRequest::Echo(body.into())
    }

    /// A request which fails.
    pub fn fail(transport: bool) -> Self {
        MockRequest::Fail { transport }
    }
}

/// Fake response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockResponse(String);

impl MockResponse {
    /// A response carrying `body`.
    pub fn new<S: Into<String>>(body: S) -> Self {
        MockResponse(body.into())
    }

    /// The response body.
    pub fn body(&self) -> &str {
        &self.0
    }
}

/// Error type for the mock protocol.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub struct MockProtocolError {
    transport: bool,
}

impl std::fmt::Display for MockProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.transport { "transport" } else { "stream" };
        write!(f, "mock {kind} error")
    }
}

impl MockProtocolError {
    /// An error scoped to one stream.
    pub fn stream() -> Self {
        Self { transport: false }
    }

    /// An error which breaks the connection.
    pub fn transport() -> Self {
        Self { transport: true }
    }
}

#[derive(Debug)]
struct MockConnectionState {
    open: AtomicBool,
    requests: AtomicUsize,
}

/// A connection handle for the mock protocol.
#[derive(Debug, Clone)]
pub struct MockConnection {
    state: Arc<MockConnectionState>,
}

impl Default for MockConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnection {
    /// Create an open connection.
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockConnectionState {
                open: AtomicBool::new(true),
                requests: AtomicUsize::new(0),
            }),
        }
    }

    /// Close the connection, as if the peer went away.
    pub fn close(&self) {
        self.state.open.store(false, Ordering::SeqCst);
    }

    /// The number of requests sent over any handle of this connection.
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Do two handles refer to the same connection?
    pub fn same_connection(&self, other: &MockConnection) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Connection<MockRequest> for MockConnection {
    type Response = MockResponse;
    type Error = MockProtocolError;
    type Future = BoxFuture<'static, Result<MockResponse, MockProtocolError>>;

    fn send_request(&mut self, request: MockRequest) -> Self::Future {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        match request {
            MockRequest::Echo(body) => Box::pin(ready(Ok(MockResponse(body)))),
            MockRequest::Fail { transport: true } => {
                self.close();
                Box::pin(ready(Err(MockProtocolError::transport())))
            }
            MockRequest::Fail { transport: false } => {
                Box::pin(ready(Err(MockProtocolError::stream())))
            }
            MockRequest::Stall => Box::pin(pending()),
        }
    }

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if PoolableConnection::<MockRequest>::is_open(self) {
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(MockProtocolError::transport()))
        }
    }
}

impl PoolableConnection<MockRequest> for MockConnection {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    fn reuse(&mut self) -> Option<Self> {
        Some(self.clone())
    }

    fn is_transport_error(error: &MockProtocolError) -> bool {
        error.transport
    }
}

/// A protocol whose handshake produces a [`MockConnection`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockProtocol {
    fail: bool,
}

impl MockProtocol {
    /// A protocol whose handshakes always fail.
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl tower::Service<MockStream> for MockProtocol {
    type Response = MockConnection;
    type Error = MockProtocolError;
    type Future = std::future::Ready<Result<MockConnection, MockProtocolError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _stream: MockStream) -> Self::Future {
        if self.fail {
            ready(Err(MockProtocolError::transport()))
        } else {
            ready(Ok(MockConnection::new()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    use crate::client::conn::{ConnectionExt as _, Protocol, ProtocolExt as _};

    assert_impl_all!(MockConnection: Connection<MockRequest>, PoolableConnection<MockRequest>, Send, Sync);
    assert_impl_all!(MockProtocol: Protocol<MockStream, MockRequest>);
    assert_impl_all!(MockRequest: Send, Sync);
    assert_impl_all!(MockResponse: Send, Sync);
    assert_impl_all!(MockProtocolError: std::error::Error, Send, Sync);

    fn stream() -> MockStream {
        tokio::io::duplex(8).0
    }

    #[tokio::test]
    async fn echo() {
        let mut conn = MockConnection::new();
        conn.when_ready().await.unwrap();
        let response = conn.send_request(MockRequest::echo("ping")).await.unwrap();
        assert_eq!(response.body(), "ping");
        assert_eq!(conn.requests(), 1);
    }

    #[tokio::test]
    async fn failures() {
        let mut conn = MockConnection::new();

        let error = conn.send_request(MockRequest::fail(false)).await.unwrap_err();
        assert!(!MockConnection::is_transport_error(&error));
        assert!(conn.is_open());

        let error = conn.send_request(MockRequest::fail(true)).await.unwrap_err();
        assert!(MockConnection::is_transport_error(&error));
        assert!(!conn.is_open());
        assert_eq!(conn.when_ready().await.unwrap_err(), error);
    }

    #[test]
    fn reuse_shares_state() {
        let mut conn = MockConnection::new();
        let other = conn.reuse().unwrap();
        assert!(conn.same_connection(&other));
        assert!(!conn.same_connection(&MockConnection::new()));

        other.close();
        assert!(!conn.is_open());
    }

    #[test]
    fn error_display() {
        assert_eq!(MockProtocolError::stream().to_string(), "mock stream error");
        assert_eq!(
            MockProtocolError::transport().to_string(),
            "mock transport error"
        );
    }

    #[tokio::test]
    async fn handshake() {
        let conn = MockProtocol::default().handshake(stream()).await.unwrap();
        assert!(conn.is_open());

        let error = MockProtocol::failing()
            .handshake(stream())
            .await
            .unwrap_err();
        assert_eq!(error, MockProtocolError::transport());
    }
}

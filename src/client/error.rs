//! Errors returned while acquiring connections and dispatching requests.
//!
//! Each failure mode has its own type so that callers can tell apart failures which
//! affect every caller of a destination (a failed dial), failures scoped to a single
//! connection (it closed, or is saturated), and failures scoped to a single request.
//! Sources are shared through [`Arc`] so that one failure can be handed to every caller
//! which was waiting on it.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use super::pool::{ConnectionId, Destination, DestinationError};

/// A shareable underlying error.
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) fn cause<E>(error: E) -> Cause
where
    E: Into<crate::BoxError>,
{
    Arc::from(error.into())
}

/// Establishing a connection to a destination failed.
///
/// Every caller coalesced onto the same dial receives a clone of the same error.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum DialError {
    /// Connecting and handshaking did not finish within the dial timeout.
    #[error("dial to {destination} timed out after {timeout:?}")]
    Timeout {
        /// Where the dial was headed.
        destination: Destination,
        /// The configured dial timeout.
        timeout: Duration,
    },

    /// The transport could not establish a byte stream.
    #[error("unable to connect to {destination}")]
    Connect {
        /// Where the dial was headed.
        destination: Destination,
        /// The transport error.
        #[source]
        source: Cause,
    },

    /// The byte stream was established, but the protocol handshake failed.
    #[error("handshake with {destination} failed")]
    Handshake {
        /// Where the dial was headed.
        destination: Destination,
        /// The protocol error.
        #[source]
        source: Cause,
    },

    /// The dial was abandoned before it resolved, because the pool or the task
    /// driving the dial went away.
    #[error("dial to {destination} was abandoned")]
    Abandoned {
        /// Where the dial was headed.
        destination: Destination,
    },
}

impl DialError {
    /// The destination the failed dial was for.
    pub fn destination(&self) -> &Destination {
        match self {
            DialError::Timeout { destination, .. }
            | DialError::Connect { destination, .. }
            | DialError::Handshake { destination, .. }
            | DialError::Abandoned { destination } => destination,
        }
    }

    /// Was this error caused by the dial timeout?
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout { .. })
    }
}

/// A new stream could not be opened on an acquired connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum StreamOpenError {
    /// The connection is closed, and will not be handed out again. A fresh acquire
    /// will dial a new connection.
    #[error("connection {id} is closed")]
    Closed {
        /// The closed connection.
        id: ConnectionId,
    },

    /// The connection already carries its maximum number of concurrent streams.
    #[error("connection {id} is at its limit of {limit} concurrent streams")]
    AtCapacity {
        /// The saturated connection.
        id: ConnectionId,
        /// The configured stream limit.
        limit: usize,
    },
}

/// Moving a request or its response over an open stream failed.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TransferError {
    /// The stream failed, but the connection carrying it is still usable.
    #[error("stream failed")]
    Stream(#[source] Cause),

    /// The connection failed underneath the stream and has been invalidated.
    #[error("connection failed")]
    Transport(#[source] Cause),

    /// Another user invalidated the connection while this stream was in flight.
    #[error("connection was invalidated")]
    Invalidated(#[source] Cause),
}

impl TransferError {
    /// Did this failure take the whole connection down?
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TransferError::Transport(_) | TransferError::Invalidated(_)
        )
    }

    /// The underlying error.
    pub fn cause(&self) -> &Cause {
        match self {
            TransferError::Stream(cause)
            | TransferError::Transport(cause)
            | TransferError::Invalidated(cause) => cause,
        }
    }
}

/// Errors returned by the [`Dispatcher`][super::Dispatcher].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No connection could be established.
    #[error(transparent)]
    Dial(#[from] DialError),

    /// A connection was acquired, but no stream could be opened on it.
    #[error(transparent)]
    StreamOpen(#[from] StreamOpenError),

    /// The request or response failed in transit.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The request did not finish within the request timeout.
    #[error("request timed out after {timeout:?}")]
    Timeout {
        /// The configured request timeout.
        timeout: Duration,
    },

    /// The request did not name a destination.
    #[error(transparent)]
    Destination(#[from] DestinationError),
}

impl Error {
    /// Was the request cancelled by the caller?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Did the request or its dial run out of time?
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Dial(error) => error.is_timeout(),
            _ => false,
        }
    }
}

/// Error raised when a connection is invalidated without a more specific cause.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub(crate) struct Reason(pub(crate) &'static str);

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    assert_impl_all!(DialError: std::error::Error, Send, Sync, Clone);
    assert_impl_all!(StreamOpenError: std::error::Error, Send, Sync, Clone);
    assert_impl_all!(TransferError: std::error::Error, Send, Sync, Clone);
    assert_impl_all!(Error: std::error::Error, Send, Sync, Into<crate::BoxError>);

    fn destination() -> Destination {
        "http://example.com".parse().unwrap()
    }

    #[test]
    fn dial_error_source_survives_clone() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = DialError::Connect {
            destination: destination(),
            source: cause(io),
        };
        let clone = error.clone();

        assert_eq!(clone.destination(), &destination());
        assert_eq!(error.to_string(), "unable to connect to http://example.com");

        let source = std::error::Error::source(&clone).expect("source is kept");
        assert_eq!(source.to_string(), "refused");
    }

    #[test]
    fn timeout_display() {
        let error = DialError::Timeout {
            destination: destination(),
            timeout: Duration::from_secs(3),
        };
        assert!(error.is_timeout());
        assert_eq!(
            error.to_string(),
            "dial to http://example.com timed out after 3s"
        );
    }

    #[test]
    fn transfer_error_classification() {
        let stream = TransferError::Stream(cause(Reason("reset")));
        let transport = TransferError::Transport(cause(Reason("eof")));
        let invalidated = TransferError::Invalidated(cause(Reason("eof")));

        assert!(!stream.is_transport());
        assert!(transport.is_transport());
        assert!(invalidated.is_transport());
        assert_eq!(invalidated.cause().to_string(), "eof");
    }

    #[test]
    fn dispatcher_error_is_transparent() {
        let error: Error = StreamOpenError::AtCapacity {
            id: ConnectionId::from_raw(7),
            limit: 2,
        }
        .into();
        assert_eq!(
            error.to_string(),
            "connection conn-7 is at its limit of 2 concurrent streams"
        );
        assert!(!error.is_cancelled());
        assert!(Error::Cancelled.is_cancelled());
    }

    #[test]
    fn dispatcher_timeouts() {
        let error = Error::Timeout {
            timeout: Duration::from_secs(60),
        };
        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "request timed out after 60s");

        let dial: Error = DialError::Timeout {
            destination: destination(),
            timeout: Duration::from_secs(1),
        }
        .into();
        assert!(dial.is_timeout());
        assert!(!Error::Cancelled.is_timeout());
    }
}

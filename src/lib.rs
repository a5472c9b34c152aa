//! # Switchyard: per-destination connection pooling for multiplexed clients
//!
//! Switchyard is the connection-pool and dispatch layer of a client transport which speaks
//! a multiplexed protocol (HTTP/2 out of the box). It keeps at most one connection per
//! destination, shares that connection between every caller sending to the same
//! destination, and makes sure that a connection wedged on a slow or unresponsive peer
//! never holds up requests bound for any other destination.
//!
//! ## Architecture Overview
//!
//! The crate is built on Tower's `Service` trait, and splits a client into three layers:
//!
//! - **Transport**: establishes a byte stream to a [`Destination`][client::pool::Destination]
//!   (TCP is provided).
//! - **Protocol**: performs the handshake on a byte stream and returns a
//!   [`Connection`][client::conn::Connection] capable of opening logical streams
//!   (HTTP/2 via [`h2`] is provided with the `h2` feature).
//! - **Pool and dispatcher**: the [`Pool`][client::pool::Pool] tracks one connection record
//!   per destination and coalesces concurrent dials, and the
//!   [`Dispatcher`][client::Dispatcher] drives a request through
//!   acquire, open stream, transfer and release.
//!
//! ### Locking discipline
//!
//! The pool is guarded by a single lock which is only ever held to read or mutate the
//! destination map. Dialing, handshakes and stream I/O all happen with the lock released,
//! so an acquire for one destination never waits on network progress for another. A
//! second, per-connection lock is held only while a new stream handle is derived from a
//! connection. Writes that stall because a peer stops reading only stall the stream that
//! issued them.
//!
//! ### Dial coalescing
//!
//! When several callers ask for a destination which has no connection yet, exactly one
//! of them dials. The others register as waiters on the pending dial and receive the
//! same connection, or the same error, when it resolves. Cancelling the caller which is
//! dialing does not abort the dial; it finishes in the background on behalf of the
//! remaining waiters.
//!
//! ## Feature Flags
//!
//! - `h2` (default): HTTP/2 protocol support using the `h2` crate.
//! - `mock`: mock transports and protocols, for testing code built on this crate.

use std::{fmt, pin::Pin};

pub mod body;
pub mod client;
mod notify;

pub use self::body::Body;
pub use self::client::error::Error;
pub use self::client::pool::Destination;
pub use self::client::{ClientBuilder, Config, Dispatcher};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed error which is safe to share between threads.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Utility struct for formatting a `Display` type in a `Debug` context.
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Test fixtures
#[cfg(test)]
pub(crate) mod fixtures {

    use std::sync::Once;

    /// Registers a global default tracing subscriber when called for the first time. This is intended
    /// for use in tests.
    pub fn subscribe() {
        static INSTALL_TRACING_SUBSCRIBER: Once = Once::new();
        INSTALL_TRACING_SUBSCRIBER.call_once(|| {
            let subscriber = tracing_subscriber::FmtSubscriber::builder()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .finish();
            tracing::subscriber::set_global_default(subscriber).unwrap();
        });
    }
}

//! Building blocks for dialing destinations and speaking a protocol over the result.
//!
//! - [`Transport`] establishes a byte stream to a destination.
//! - [`Protocol`] performs a handshake over that stream and returns a [`Connection`].
//! - [`Connection`] sends requests on logical streams.
//! - [`Connector`] chains a transport and a protocol into a single dial.

pub mod connection;
pub mod connector;
pub mod protocol;
pub mod transport;

pub use self::connection::{Connection, ConnectionExt, WhenReady};
pub use self::connector::Connector;
pub use self::protocol::{Handshake, Protocol, ProtocolExt};
pub use self::transport::{Transport, TransportExt};

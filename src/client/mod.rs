//! Client implementations
//!
//! A client is a [`Dispatcher`]: a transport, a protocol and a connection pool shared by
//! every request. Build one with [`ClientBuilder`].

pub mod builder;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod pool;

pub use self::builder::ClientBuilder;
pub use self::dispatch::Dispatcher;
pub use self::pool::Config;

/// A dispatcher sending HTTP/2 requests over TCP.
#[cfg(feature = "h2")]
pub type Http2Dispatcher = Dispatcher<
    conn::transport::TcpTransport,
    conn::protocol::http2::Http2Protocol,
    http::Request<crate::Body>,
>;

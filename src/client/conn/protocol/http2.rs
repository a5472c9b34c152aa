//! HTTP/2 protocol support, built on the [`h2`] crate.
//!
//! The handshake spawns a driver task which owns the connection's IO. Handles returned
//! by [`Http2Protocol`] are cheap clones of the `h2` request sender, each of which opens
//! streams over the same connection. When the driver task exits, for any reason, the
//! connection reports itself closed and the pool stops handing it out.

use std::fmt;
use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;
use h2::SendStream;
use h2::client::SendRequest;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{Instrument as _, debug, trace};

use crate::body::{Body, Kind};
use crate::client::conn::Connection;
use crate::client::pool::PoolableConnection;
use crate::{BoxFuture, notify};

/// Error on an HTTP/2 connection or one of its streams.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Http2Error {
    /// The `h2` protocol layer failed.
    #[error(transparent)]
    Protocol(#[from] h2::Error),

    /// The request body stream failed.
    #[error("request body failed")]
    Body(#[source] io::Error),
}

/// Settings for HTTP/2 connections. Unset fields use the `h2` defaults.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Http2Config {
    /// Initial flow-control window of each stream.
    pub initial_window_size: Option<u32>,

    /// Initial flow-control window of the connection.
    pub initial_connection_window_size: Option<u32>,

    /// Maximum number of concurrent streams the peer may open towards us.
    pub max_concurrent_streams: Option<u32>,

    /// Maximum number of locally initiated streams before the peer's settings arrive.
    pub initial_max_send_streams: Option<usize>,
}

impl Http2Config {
    fn builder(&self) -> h2::client::Builder {
        let mut builder = h2::client::Builder::new();
        if let Some(size) = self.initial_window_size {
            builder.initial_window_size(size);
        }
        if let Some(size) = self.initial_connection_window_size {
            builder.initial_connection_window_size(size);
        }
        if let Some(max) = self.max_concurrent_streams {
            builder.max_concurrent_streams(max);
        }
        if let Some(max) = self.initial_max_send_streams {
            builder.initial_max_send_streams(max);
        }
        builder
    }
}

/// The HTTP/2 protocol, for use over any byte stream.
#[derive(Debug, Clone, Default)]
pub struct Http2Protocol {
    config: Http2Config,
}

impl Http2Protocol {
    /// Create a protocol using `config` for every connection.
    pub fn new(config: Http2Config) -> Self {
        Self { config }
    }

    /// The connection settings.
    pub fn config(&self) -> &Http2Config {
        &self.config
    }

    /// Set the initial per-stream flow-control window.
    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.config.initial_window_size = Some(size);
        self
    }

    /// Set the initial connection flow-control window.
    pub fn with_initial_connection_window_size(mut self, size: u32) -> Self {
        self.config.initial_connection_window_size = Some(size);
        self
    }

    /// Set the maximum number of streams the peer may open.
    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.config.max_concurrent_streams = Some(max);
        self
    }
}

impl<IO> tower::Service<IO> for Http2Protocol
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Response = Http2Connection;
    type Error = Http2Error;
    type Future = BoxFuture<'static, Result<Http2Connection, Http2Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, io: IO) -> Self::Future {
        let builder = self.config.builder();
        Box::pin(async move {
            let (send, connection) = builder.handshake::<_, Bytes>(io).await?;
            let (trigger, closed) = notify::channel();

            let span = tracing::debug_span!("h2 driver");
            tokio::spawn(
                async move {
                    match connection.await {
                        Ok(()) => trace!("connection finished"),
                        Err(error) => debug!(%error, "connection failed"),
                    }
                    trigger.fire();
                }
                .instrument(span),
            );

            Ok(Http2Connection {
                send,
                driver: closed,
            })
        })
    }
}

/// A handle to an HTTP/2 connection.
#[derive(Clone)]
pub struct Http2Connection {
    send: SendRequest<Bytes>,
    driver: notify::Closed,
}

impl fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Http2Connection")
            .field("closed", &self.driver.is_closed())
            .finish()
    }
}

impl Connection<http::Request<Body>> for Http2Connection {
    type Response = http::Response<Bytes>;
    type Error = Http2Error;
    type Future = BoxFuture<'static, Result<http::Response<Bytes>, Http2Error>>;

    fn send_request(&mut self, request: http::Request<Body>) -> Self::Future {
        let (parts, body) = request.into_parts();
        let end_of_stream = body.is_end_stream();

        // Open the stream on the handle which `poll_ready` reserved capacity on.
        let opened = self
            .send
            .send_request(http::Request::from_parts(parts, ()), end_of_stream);

        Box::pin(async move {
            let (response, mut stream) = opened?;
            if !end_of_stream {
                write_body(&mut stream, body).await?;
            }

            let (parts, mut recv) = response.await?.into_parts();
            let mut data = BytesMut::new();
            while let Some(chunk) = recv.data().await {
                let chunk = chunk?;
                let _ = recv.flow_control().release_capacity(chunk.len());
                data.extend_from_slice(&chunk);
            }

            Ok(http::Response::from_parts(parts, data.freeze()))
        })
    }

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.send.poll_ready(cx).map_err(Http2Error::from)
    }
}

impl PoolableConnection<http::Request<Body>> for Http2Connection {
    fn is_open(&self) -> bool {
        !self.driver.is_closed()
    }

    fn reuse(&mut self) -> Option<Self> {
        Some(self.clone())
    }

    fn is_transport_error(error: &Http2Error) -> bool {
        match error {
            Http2Error::Protocol(error) => error.is_io() || error.is_go_away(),
            Http2Error::Body(_) => false,
        }
    }
}

async fn write_body(stream: &mut SendStream<Bytes>, body: Body) -> Result<(), Http2Error> {
    match body.into_kind() {
        Kind::Empty => stream.send_data(Bytes::new(), true)?,
        Kind::Full(data) => write_chunk(stream, data, true).await?,
        Kind::Stream(mut chunks) => {
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(Http2Error::Body)?;
                write_chunk(stream, chunk, false).await?;
            }
            stream.send_data(Bytes::new(), true)?;
        }
    }
    Ok(())
}

/// Write `data` as the peer grants send capacity.
async fn write_chunk(
    stream: &mut SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), Http2Error> {
    if data.is_empty() {
        if end_of_stream {
            stream.send_data(data, true)?;
        }
        return Ok(());
    }

    while !data.is_empty() {
        stream.reserve_capacity(data.len());
        let capacity = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(capacity) => capacity?,
            None => {
                return Err(Http2Error::Body(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "stream closed while sending body",
                )));
            }
        };

        if capacity == 0 {
            continue;
        }

        let chunk = data.split_to(capacity.min(data.len()));
        stream.send_data(chunk, end_of_stream && data.is_empty())?;
    }
    Ok(())
}

//! Request bodies for the HTTP/2 client.

use std::fmt;
use std::io;

use bytes::Bytes;
use futures::stream::{BoxStream, Stream, StreamExt as _};

/// The body of an outgoing request.
///
/// A body is either empty, a single buffer, or a stream of chunks. Streamed bodies are
/// written as the peer grants flow-control capacity, so a peer which stops reading only
/// stalls the stream the body belongs to.
pub struct Body {
    kind: Kind,
}

pub(crate) enum Kind {
    Empty,
    Full(Bytes),
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

impl Body {
    /// A body with no content.
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// A body consisting of a single buffer.
    pub fn full<B: Into<Bytes>>(data: B) -> Self {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }
        Self {
            kind: Kind::Full(data),
        }
    }

    /// A body produced by a stream of chunks. The body ends when the stream ends.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            kind: Kind::Stream(stream.boxed()),
        }
    }

    /// Is it known up front that this body has no content?
    pub fn is_end_stream(&self) -> bool {
        matches!(self.kind, Kind::Empty)
    }

    pub(crate) fn into_kind(self) -> Kind {
        self.kind
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.debug_tuple("Body").field(&"empty").finish(),
            Kind::Full(data) => f.debug_tuple("Body").field(&data.len()).finish(),
            Kind::Stream(_) => f.debug_tuple("Body").field(&"stream").finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Self {
        Self::full(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Self::full(data)
    }
}

impl From<String> for Body {
    fn from(data: String) -> Self {
        Self::full(data)
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Self {
        Self::full(data)
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

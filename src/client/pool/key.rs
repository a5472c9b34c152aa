//! Destinations identify the remote endpoint a pooled connection belongs to.

use std::fmt;
use std::str::FromStr;

use http::Uri;
use http::uri::{Authority, PathAndQuery, Scheme};
use thiserror::Error;

/// Error building a [`Destination`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DestinationError {
    /// The URI could not be parsed.
    #[error("invalid uri")]
    Uri(#[from] http::uri::InvalidUri),

    /// The URI is relative and does not name a scheme.
    #[error("uri has no scheme: {0}")]
    MissingScheme(Uri),

    /// The URI does not name a host.
    #[error("uri has no authority: {0}")]
    MissingAuthority(Uri),
}

/// The remote endpoint a connection is made to: a scheme and an authority.
///
/// Destinations are the key of the connection pool. Two requests share a connection
/// exactly when their destinations compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    authority: Authority,
}

impl Destination {
    /// Create a destination from its parts.
    pub fn new(scheme: Scheme, authority: Authority) -> Self {
        Self { scheme, authority }
    }

    /// The destination named by an absolute URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, DestinationError> {
        let scheme = uri
            .scheme()
            .cloned()
            .ok_or_else(|| DestinationError::MissingScheme(uri.clone()))?;
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| DestinationError::MissingAuthority(uri.clone()))?;
        Ok(Self { scheme, authority })
    }

    /// The URI scheme.
    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    /// The URI authority.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The host name or address, without brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        let host = self.authority.host();
        host.strip_prefix('[')
            .and_then(|host| host.strip_suffix(']'))
            .unwrap_or(host)
    }

    /// The explicit port, or the well-known port for the scheme.
    pub fn port(&self) -> u16 {
        self.authority.port_u16().unwrap_or_else(|| {
            if self.scheme == Scheme::HTTPS {
                443
            } else {
                80
            }
        })
    }

    /// The `host:port` pair handed to transports for name resolution.
    pub fn address(&self) -> (String, u16) {
        (self.host().to_owned(), self.port())
    }

    /// Complete a possibly relative URI so that it names this destination.
    ///
    /// Absolute URIs are returned unchanged.
    pub fn absolute_uri(&self, uri: Uri) -> Uri {
        if uri.scheme().is_some() && uri.authority().is_some() {
            return uri;
        }

        let mut parts = uri.into_parts();
        parts.scheme = Some(self.scheme.clone());
        parts.authority = Some(self.authority.clone());
        if parts.path_and_query.is_none() {
            parts.path_and_query = Some(PathAndQuery::from_static("/"));
        }

        // Scheme, authority and path are all present, which is every requirement
        // `Uri::from_parts` checks.
        Uri::from_parts(parts).unwrap_or_else(|_| {
            Uri::builder()
                .scheme(self.scheme.clone())
                .authority(self.authority.clone())
                .path_and_query("/")
                .build()
                .unwrap_or_default()
        })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority)
    }
}

impl FromStr for Destination {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s.parse()?;
        Self::from_uri(&uri)
    }
}

impl TryFrom<&Uri> for Destination {
    type Error = DestinationError;

    fn try_from(uri: &Uri) -> Result<Self, Self::Error> {
        Self::from_uri(uri)
    }
}

/// Requests which name the destination they should be sent to.
pub trait Routable {
    /// The destination this request is bound for.
    fn destination(&self) -> Result<Destination, DestinationError>;

    /// Address the request to `destination` before it is sent.
    fn route(&mut self, destination: &Destination) {
        let _ = destination;
    }
}

impl<B> Routable for http::Request<B> {
    fn destination(&self) -> Result<Destination, DestinationError> {
        Destination::from_uri(self.uri())
    }

    fn route(&mut self, destination: &Destination) {
        let uri = std::mem::take(self.uri_mut());
        *self.uri_mut() = destination.absolute_uri(uri);
    }
}

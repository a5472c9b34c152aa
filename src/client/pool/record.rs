//! Connection records: the pool's view of one established connection.
//!
//! A [`Record`] owns the protocol handle for a single connection to a single
//! [`Destination`], and tracks whether that connection may still be used, how many
//! callers hold it, and how many streams are open on it. Callers never see the record
//! directly; they hold a [`Lease`], and send requests over a [`Stream`] opened from it.

use std::fmt;
use std::future::IntoFuture;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace, warn};

use super::{Destination, PoolRef, PoolableConnection};
use crate::BoxError;
use crate::client::conn::ConnectionExt as _;
use crate::client::error::{Cause, Reason, StreamOpenError, TransferError, cause};
use crate::notify;

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a destination's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A dial is in progress and no connection exists yet.
    Connecting,

    /// The connection can be leased and can open streams.
    Ready,

    /// The connection failed, expired or was invalidated. It is never handed out again.
    Closed,
}

#[derive(Debug)]
struct RecordState {
    readiness: Readiness,
    leases: usize,
    idle_since: Option<Instant>,
    cause: Option<Cause>,
}

pub(crate) type Shared<C, R> = Arc<Record<C, R>>;

pub(crate) struct Record<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    id: ConnectionId,
    destination: Destination,

    /// Stream-open lock. Held only while deriving a new handle from the connection.
    handle: Mutex<C>,
    state: Mutex<RecordState>,

    streams: Arc<Semaphore>,
    limit: usize,

    trigger: notify::Trigger,
    closed: notify::Closed,

    pool: PoolRef<C, R>,
    _request: PhantomData<fn(R)>,
}

impl<C, R> fmt::Debug for Record<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("state", &self.state.try_lock())
            .field("streams", &self.open_streams())
            .field("limit", &self.limit)
            .finish()
    }
}

impl<C, R> Record<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    pub(crate) fn new(
        destination: Destination,
        connection: C,
        limit: usize,
        pool: PoolRef<C, R>,
    ) -> Shared<C, R> {
        let (trigger, closed) = notify::channel();
        let id = ConnectionId::next();
        trace!(%id, %destination, "new connection record");

        Arc::new(Self {
            id,
            destination,
            handle: Mutex::new(connection),
            state: Mutex::new(RecordState {
                readiness: Readiness::Ready,
                leases: 0,
                idle_since: Some(Instant::now()),
                cause: None,
            }),
            streams: Arc::new(Semaphore::new(limit)),
            limit,
            trigger,
            closed,
            pool,
            _request: PhantomData,
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn readiness(&self) -> Readiness {
        self.state.lock().readiness
    }

    pub(crate) fn leases(&self) -> usize {
        self.state.lock().leases
    }

    pub(crate) fn open_streams(&self) -> usize {
        self.limit.saturating_sub(self.streams.available_permits())
    }

    /// An unleased connection which has sat idle for at least `idle_timeout`.
    pub(crate) fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        let state = self.state.lock();
        state.leases == 0
            && state
                .idle_since
                .is_some_and(|since| now.saturating_duration_since(since) >= idle_timeout)
    }

    /// Lease the connection for a caller, if it is still fit to be handed out.
    ///
    /// Called with the pool locked.
    pub(crate) fn try_lease(
        self: &Arc<Self>,
        now: Instant,
        idle_timeout: Option<Duration>,
    ) -> Result<Lease<C, R>, Reason> {
        if !self.handle.lock().is_open() {
            return Err(Reason("connection closed by peer"));
        }

        if idle_timeout.is_some_and(|ttl| self.is_expired(now, ttl)) {
            return Err(Reason("connection idle timeout"));
        }

        let mut state = self.state.lock();
        if state.readiness == Readiness::Closed {
            return Err(Reason("connection closed"));
        }

        state.leases += 1;
        state.idle_since = None;
        Ok(Lease {
            record: self.clone(),
        })
    }

    /// Lease a connection which was just handed over by a dial.
    pub(crate) fn lease(self: &Arc<Self>) -> Lease<C, R> {
        let mut state = self.state.lock();
        state.leases += 1;
        state.idle_since = None;
        Lease {
            record: self.clone(),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 {
            state.idle_since = Some(Instant::now());
        }
        trace!(id = %self.id, leases = state.leases, "connection released");
    }

    /// Mark the connection closed and fail every stream still attached to it.
    ///
    /// Does not touch the pool, so it is safe to call with the pool locked. Returns
    /// `true` if this call closed the connection.
    pub(crate) fn close(&self, cause: Cause) -> bool {
        {
            let mut state = self.state.lock();
            if state.readiness == Readiness::Closed {
                return false;
            }
            state.readiness = Readiness::Closed;
            state.cause = Some(cause);
        }

        self.streams.close();
        self.trigger.fire();
        true
    }

    /// Close the connection and remove it from the pool.
    ///
    /// Must not be called with the pool locked.
    pub(crate) fn invalidate(&self, cause: Cause) {
        if self.close(cause.clone()) {
            debug!(id = %self.id, destination = %self.destination, error = %cause, "connection invalidated");
        }

        if let Some(mut pool) = self.pool.lock() {
            pool.remove_record(&self.destination, self.id);
        }
    }

    fn cause(&self) -> Cause {
        self.state
            .lock()
            .cause
            .clone()
            .unwrap_or_else(|| cause(Reason("connection closed")))
    }

    fn open_stream(self: &Arc<Self>) -> Result<Stream<C, R>, StreamOpenError> {
        let closed = StreamOpenError::Closed { id: self.id };

        if self.readiness() == Readiness::Closed {
            return Err(closed);
        }

        let permit = match self.streams.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                trace!(id = %self.id, limit = self.limit, "connection at stream capacity");
                return Err(StreamOpenError::AtCapacity {
                    id: self.id,
                    limit: self.limit,
                });
            }
            Err(TryAcquireError::Closed) => return Err(closed),
        };

        let connection = {
            let mut handle = self.handle.lock();
            if handle.is_open() { handle.reuse() } else { None }
        };

        let Some(connection) = connection else {
            drop(permit);
            self.invalidate(cause(Reason("connection closed by peer")));
            return Err(closed);
        };

        trace!(id = %self.id, streams = self.open_streams(), "stream opened");
        Ok(Stream {
            connection,
            record: self.clone(),
            _permit: permit,
        })
    }
}

/// A caller's hold on a pooled connection.
///
/// While a lease is held the connection counts as in use and is never expired for being
/// idle. Dropping the lease (or calling [`Lease::release`]) returns it to the pool; the
/// connection itself stays open for other callers.
pub struct Lease<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    record: Shared<C, R>,
}

impl<C, R> fmt::Debug for Lease<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.record.id)
            .field("destination", &self.record.destination)
            .finish()
    }
}

impl<C, R> Lease<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    /// The leased connection's identifier.
    pub fn id(&self) -> ConnectionId {
        self.record.id
    }

    /// The destination the leased connection is connected to.
    pub fn destination(&self) -> &Destination {
        &self.record.destination
    }

    /// The current state of the leased connection.
    pub fn readiness(&self) -> Readiness {
        self.record.readiness()
    }

    /// Has the leased connection been closed?
    pub fn is_closed(&self) -> bool {
        self.readiness() == Readiness::Closed
    }

    /// The number of streams currently open on the connection, across all leases.
    pub fn open_streams(&self) -> usize {
        self.record.open_streams()
    }

    /// Open a new logical stream on the connection.
    ///
    /// Fails immediately if the connection is closed, or if it already carries its
    /// maximum number of concurrent streams.
    pub fn open_stream(&self) -> Result<Stream<C, R>, StreamOpenError> {
        self.record.open_stream()
    }

    /// Mark the connection as broken.
    ///
    /// The connection is removed from the pool, every stream open on it fails with
    /// [`TransferError::Invalidated`], and the next acquire for its destination dials a
    /// new connection. Other destinations are not affected.
    pub fn invalidate<E>(&self, error: E)
    where
        E: Into<BoxError>,
    {
        self.record.invalidate(cause(error));
    }

    /// Return the connection to the pool. Equivalent to dropping the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl<C, R> Drop for Lease<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn drop(&mut self) {
        self.record.release();
    }
}

/// One logical stream on a pooled connection.
///
/// The stream occupies one of the connection's stream slots until it is dropped.
pub struct Stream<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    connection: C,
    record: Shared<C, R>,
    _permit: OwnedSemaphorePermit,
}

impl<C, R> fmt::Debug for Stream<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("connection", &self.record.id)
            .finish()
    }
}

impl<C, R> Stream<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    /// The identifier of the connection carrying this stream.
    pub fn connection_id(&self) -> ConnectionId {
        self.record.id
    }

    /// Send `request` and wait for its response.
    ///
    /// Failures the protocol attributes to the connection invalidate it; failures of
    /// this stream alone leave the connection in the pool. If another user invalidates
    /// the connection while the exchange is in flight, this returns
    /// [`TransferError::Invalidated`] with that user's cause.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(connection = %self.record.id), level = "trace"))]
    pub async fn send(self, request: R) -> Result<C::Response, TransferError> {
        let Stream {
            mut connection,
            record,
            _permit,
        } = self;

        if record.closed.is_closed() {
            return Err(TransferError::Invalidated(record.cause()));
        }

        let closed = record.closed.clone().into_future();
        let exchange = async {
            connection.when_ready().await?;
            connection.send_request(request).await
        };

        tokio::select! {
            biased;

            () = closed => Err(TransferError::Invalidated(record.cause())),
            result = exchange => match result {
                Ok(response) => Ok(response),
                Err(error) if C::is_transport_error(&error) => {
                    let error = cause(error);
                    warn!(id = %record.id, %error, "transport failure, invalidating connection");
                    record.invalidate(error.clone());
                    Err(TransferError::Transport(error))
                }
                Err(error) => {
                    trace!(id = %record.id, %error, "stream failed");
                    Err(TransferError::Stream(cause(error)))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    use crate::client::conn::protocol::mock::{
        MockConnection, MockProtocolError, MockRequest, MockResponse,
    };

    type TestRecord = Shared<MockConnection, MockRequest>;

    fn record(limit: usize) -> (TestRecord, MockConnection) {
        let connection = MockConnection::new();
        let record = Record::new(
            "http://mock.local".parse().unwrap(),
            connection.clone(),
            limit,
            PoolRef::none(),
        );
        (record, connection)
    }

    #[test]
    fn connection_id_display() {
        let id = ConnectionId::from_raw(3);
        assert_eq!(id.to_string(), "conn-3");
        assert_ne!(ConnectionId::next(), ConnectionId::next());
    }

    #[test]
    fn lease_and_release() {
        let (record, _) = record(4);
        assert_eq!(record.leases(), 0);

        let first = record.lease();
        let second = record
            .try_lease(Instant::now(), Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(record.leases(), 2);
        assert_eq!(first.id(), second.id());

        first.release();
        assert_eq!(record.leases(), 1);
        assert!(!record.is_expired(Instant::now(), Duration::ZERO));

        drop(second);
        assert_eq!(record.leases(), 0);
        assert!(record.is_expired(Instant::now(), Duration::ZERO));
        assert_eq!(record.readiness(), Readiness::Ready);
    }

    #[test]
    fn idle_expiry_refuses_lease() {
        let (record, _) = record(4);
        let later = Instant::now() + Duration::from_secs(10);
        let refused = record.try_lease(later, Some(Duration::from_secs(5)));
        assert_eq!(refused.unwrap_err().to_string(), "connection idle timeout");

        assert!(record.try_lease(later, None).is_ok());
    }

    #[test]
    fn peer_close_refuses_lease() {
        let (record, connection) = record(4);
        connection.close();
        let refused = record.try_lease(Instant::now(), None);
        assert_eq!(refused.unwrap_err().to_string(), "connection closed by peer");
    }

    #[test]
    fn stream_capacity_rejects() {
        let (record, _) = record(2);
        let lease = record.lease();

        let first = lease.open_stream().unwrap();
        let _second = lease.open_stream().unwrap();
        assert_eq!(lease.open_streams(), 2);

        let error = lease.open_stream().unwrap_err();
        assert_eq!(
            error,
            StreamOpenError::AtCapacity {
                id: lease.id(),
                limit: 2
            }
        );

        drop(first);
        assert!(lease.open_stream().is_ok());
    }

    #[test]
    fn closed_record_rejects_streams_and_leases() {
        let (record, _) = record(2);
        let lease = record.lease();

        assert!(record.close(cause(Reason("test"))));
        assert!(!record.close(cause(Reason("again"))));
        assert!(lease.is_closed());

        assert_eq!(
            lease.open_stream().unwrap_err(),
            StreamOpenError::Closed { id: lease.id() }
        );
        assert!(record.try_lease(Instant::now(), None).is_err());
    }

    #[test]
    fn peer_close_on_open_invalidates() {
        let (record, connection) = record(2);
        let lease = record.lease();
        connection.close();

        assert!(matches!(
            lease.open_stream(),
            Err(StreamOpenError::Closed { .. })
        ));
        assert_eq!(record.readiness(), Readiness::Closed);
        assert_eq!(record.open_streams(), 0);
    }

    #[tokio::test]
    async fn send_echo() {
        let (record, connection) = record(2);
        let lease = record.lease();

        let response = lease
            .open_stream()
            .unwrap()
            .send(MockRequest::echo("hello"))
            .await
            .unwrap();
        assert_eq!(response, MockResponse::new("hello"));
        assert_eq!(connection.requests(), 1);
        assert_eq!(lease.open_streams(), 0);
    }

    #[tokio::test]
    async fn stream_failure_keeps_connection() {
        let (record, _) = record(2);
        let lease = record.lease();

        let error = lease
            .open_stream()
            .unwrap()
            .send(MockRequest::fail(false))
            .await
            .unwrap_err();
        assert!(matches!(error, TransferError::Stream(_)));
        assert!(!lease.is_closed());
    }

    #[tokio::test]
    async fn transport_failure_invalidates_siblings() {
        let (record, _) = record(4);
        let lease = record.lease();

        let stalled = lease.open_stream().unwrap();
        let sibling = tokio::spawn(async move { stalled.send(MockRequest::Stall).await });
        tokio::task::yield_now().await;

        let error = lease
            .open_stream()
            .unwrap()
            .send(MockRequest::fail(true))
            .await
            .unwrap_err();
        assert!(matches!(error, TransferError::Transport(_)));
        assert!(lease.is_closed());

        let sibling = tokio::time::timeout(Duration::from_secs(1), sibling)
            .await
            .expect("sibling stream should be failed")
            .unwrap();
        match sibling {
            Err(TransferError::Invalidated(cause)) => {
                assert_eq!(
                    cause.to_string(),
                    MockProtocolError::transport().to_string()
                );
            }
            other => panic!("unexpected sibling result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalidate_fails_open_streams() {
        let (record, _) = record(4);
        let lease = record.lease();

        let stream = lease.open_stream().unwrap();
        let pending = tokio::spawn(async move { stream.send(MockRequest::Stall).await });
        tokio::task::yield_now().await;

        lease.invalidate(Reason("operator request"));
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();

        let error = result.unwrap_err();
        assert!(error.is_transport());
        assert_eq!(error.cause().to_string(), "operator request");
    }
}

//! Connection Pooling for Clients
//!
//! The pool keeps at most one connection per [`Destination`], and shares it between every
//! caller sending to that destination. It is designed for multiplexed protocols, where a
//! single connection carries many concurrent streams.
//!
//! All of the pool's state lives behind one lock, and that lock is only ever held to look
//! up or update the destination map. Dials run without it, so a slow or unresponsive
//! destination never stalls acquires for other destinations. While a dial is in progress
//! for a destination, further callers for that destination register as waiters instead of
//! dialing again, and all of them receive the outcome of the single dial.
//!
//! Pool configuration happens in the [`Config`] type, which sets the stream limit per
//! connection and the dial, idle and request timeouts.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

mod checkout;
mod key;
mod lock;
mod record;

pub use self::checkout::Checkout;
pub use self::key::{Destination, DestinationError, Routable};
pub use self::record::{ConnectionId, Lease, Readiness, Stream};

use self::lock::{TryLock, WeakLock};
use self::record::{Record, Shared};
use super::conn::{Connection, Connector, Protocol, Transport};
use super::error::{DialError, Reason, cause};

/// A [`crate::client::conn::Connection`] that can be pooled.
///
/// Pooled connections are shared: the pool calls [`PoolableConnection::reuse`] to derive
/// a new handle for every stream it opens, and each handle multiplexes over the same
/// underlying transport.
pub trait PoolableConnection<R>: Connection<R> + Unpin + Send + Sized + 'static
where
    R: Send + 'static,
{
    /// Returns `true` if the connection is open.
    fn is_open(&self) -> bool;

    /// Returns a new handle which multiplexes over this connection, or `None` if the
    /// connection can no longer open streams.
    fn reuse(&mut self) -> Option<Self>;

    /// Returns `true` if `error` means the connection itself is broken, rather than
    /// only the stream which reported it.
    fn is_transport_error(error: &<Self as Connection<R>>::Error) -> bool;
}

/// Configuration for a connection pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// The maximum number of concurrent streams opened on one connection. Opening a
    /// stream beyond this limit fails immediately.
    pub max_streams_per_connection: usize,

    /// Upper bound on connecting and handshaking a new connection.
    pub dial_timeout: Option<Duration>,

    /// How long a connection with no leases is kept before it is discarded.
    pub idle_timeout: Option<Duration>,

    /// Upper bound on a whole send, from acquiring the connection to receiving the
    /// response. Unbounded when unset.
    pub request_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_streams_per_connection: 100,
            dial_timeout: Some(Duration::from_secs(30)),
            idle_timeout: Some(Duration::from_secs(90)),
            request_timeout: None,
        }
    }
}

impl Config {
    /// Set the per-connection stream limit.
    pub fn with_max_streams_per_connection(mut self, limit: usize) -> Self {
        self.max_streams_per_connection = limit;
        self
    }

    /// Set the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the overall request timeout.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// A snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct PoolStats {
    /// Connections which are installed in the pool.
    pub connections: usize,

    /// Destinations with a dial in progress.
    pub pending_dials: usize,

    /// Callers waiting on a pending dial.
    pub waiters: usize,

    /// Outstanding leases across installed connections.
    pub leases: usize,

    /// Open streams across installed connections.
    pub streams: usize,
}

/// Identifier of one dial within a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DialId(u64);

impl fmt::Display for DialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dial-{}", self.0)
    }
}

type Waiter<C, R> = oneshot::Sender<Result<Lease<C, R>, DialError>>;

/// A dial in progress, and the callers coalesced onto it.
struct PendingDial<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    id: DialId,
    waiters: Vec<Waiter<C, R>>,
}

enum Entry<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    Dialing(PendingDial<C, R>),
    Ready(Shared<C, R>),
}

impl<C, R> fmt::Debug for Entry<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Dialing(pending) => f
                .debug_struct("Dialing")
                .field("id", &pending.id)
                .field("waiters", &pending.waiters.len())
                .finish(),
            Entry::Ready(record) => f.debug_tuple("Ready").field(record).finish(),
        }
    }
}

/// A pool of connections to remote destinations.
///
/// The pool hands out [`Checkout`] futures which resolve to a [`Lease`] on the
/// destination's connection. Cloning the pool is cheap; clones share state.
pub struct Pool<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    inner: TryLock<PoolInner<C, R>>,
    config: Arc<Config>,
}

impl<C, R> Clone for Pool<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C, R> fmt::Debug for Pool<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("stats", &self.try_stats())
            .finish()
    }
}

impl<C, R> Default for Pool<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl<C, R> Pool<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    /// Create an empty pool.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        Self {
            inner: TryLock::new(PoolInner {
                entries: HashMap::new(),
                config: config.clone(),
                next_dial: 0,
            }),
            config,
        }
    }

    /// The configuration this pool was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn as_ref(&self) -> PoolRef<C, R> {
        self.inner.downgrade()
    }

    /// Acquire the connection for `destination`.
    ///
    /// The returned checkout resolves in one of three ways:
    ///
    /// 1. A usable connection is installed: the checkout is already complete.
    /// 2. A dial is in progress: the checkout waits for its outcome.
    /// 3. Otherwise the checkout dials using `connector`, and every caller that arrives
    ///    for the same destination in the meantime waits on this dial.
    ///
    /// Installed connections which were closed by the peer, or which have been idle for
    /// longer than the idle timeout, are discarded and replaced by a new dial.
    #[cfg_attr(not(tarpaulin), tracing::instrument(skip_all, fields(%destination), level = "debug"))]
    pub fn checkout<T, P>(
        &self,
        destination: Destination,
        connector: Connector<T, P, R>,
    ) -> Checkout<C, R>
    where
        T: Transport + 'static,
        P: Protocol<T::IO, R, Connection = C> + Send + 'static,
    {
        let mut inner = self.inner.lock();

        if let Some(Entry::Ready(record)) = inner.entries.get(&destination) {
            match record.try_lease(Instant::now(), self.config.idle_timeout) {
                Ok(lease) => {
                    trace!(id = %lease.id(), "reusing connection");
                    return Checkout::ready(destination, lease);
                }
                Err(reason) => {
                    debug!(id = %record.id(), %reason, "discarding connection");
                    record.close(cause(reason));
                }
            }
            inner.entries.remove(&destination);
        }

        if let Some(Entry::Dialing(pending)) = inner.entries.get_mut(&destination) {
            let (tx, rx) = oneshot::channel();
            pending.waiters.retain(|waiter| !waiter.is_closed());
            pending.waiters.push(tx);
            trace!(dial = %pending.id, waiters = pending.waiters.len(), "waiting on pending dial");
            return Checkout::waiting(destination, self.as_ref(), rx, &self.config);
        }

        let dial = inner.next_dial_id();
        inner.entries.insert(
            destination.clone(),
            Entry::Dialing(PendingDial {
                id: dial,
                waiters: Vec::new(),
            }),
        );
        drop(inner);

        debug!(%dial, "dialing new connection");
        Checkout::dialing(
            destination,
            self.as_ref(),
            dial,
            Box::pin(connector.connect()),
            &self.config,
        )
    }

    /// The state of the connection for `destination`, if the pool knows about one.
    pub fn readiness(&self, destination: &Destination) -> Option<Readiness> {
        let inner = self.inner.lock();
        match inner.entries.get(destination)? {
            Entry::Dialing(_) => Some(Readiness::Connecting),
            Entry::Ready(record) => Some(record.readiness()),
        }
    }

    /// Discard every connection which has been idle for longer than the idle timeout.
    ///
    /// Returns the number of connections discarded. Idle connections are also discarded
    /// lazily, when a checkout finds one.
    pub fn evict_idle(&self) -> usize {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return 0;
        };

        let now = Instant::now();
        let mut evicted = Vec::new();
        self.inner.lock().entries.retain(|_, entry| match entry {
            Entry::Ready(record) if record.is_expired(now, idle_timeout) => {
                evicted.push(record.clone());
                false
            }
            _ => true,
        });

        for record in &evicted {
            debug!(id = %record.id(), "evicting idle connection");
            record.close(cause(Reason("connection idle timeout")));
        }
        evicted.len()
    }

    /// Occupancy of the pool. Waits for the pool lock.
    pub fn stats(&self) -> PoolStats {
        self.inner.lock().stats()
    }

    /// Occupancy of the pool, or `None` if the pool is locked right now.
    pub fn try_stats(&self) -> Option<PoolStats> {
        self.inner.try_lock().map(|inner| inner.stats())
    }
}

/// Non-owning reference to a pool's state, held by records and checkouts.
pub(crate) type PoolRef<C, R> = WeakLock<PoolInner<C, R>>;

pub(crate) struct PoolInner<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    entries: HashMap<Destination, Entry<C, R>>,
    config: Arc<Config>,
    next_dial: u64,
}

impl<C, R> fmt::Debug for PoolInner<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolInner")
            .field("entries", &self.entries)
            .finish()
    }
}

impl<C, R> PoolInner<C, R>
where
    C: PoolableConnection<R>,
    R: Send + 'static,
{
    fn next_dial_id(&mut self) -> DialId {
        self.next_dial += 1;
        DialId(self.next_dial)
    }

    /// Settle the dial `dial` for `destination`, and hand its outcome to every waiter.
    ///
    /// On success the new connection is installed, unless the destination was taken over
    /// by another dial in the meantime, in which case it is returned to the dialing
    /// caller only. Every live waiter and the dialing caller are leased the connection
    /// before the pool lock is released, so it cannot expire before they receive it.
    pub(crate) fn resolve(
        &mut self,
        destination: &Destination,
        dial: DialId,
        result: Result<C, DialError>,
        pool: &PoolRef<C, R>,
    ) -> Result<Lease<C, R>, DialError> {
        let (waiters, owned) = match self.entries.remove(destination) {
            Some(Entry::Dialing(pending)) if pending.id == dial => (pending.waiters, true),
            Some(other) => {
                trace!(%dial, "dial superseded, not installing connection");
                self.entries.insert(destination.clone(), other);
                (Vec::new(), false)
            }
            None => (Vec::new(), true),
        };

        match result {
            Ok(connection) => {
                let record = Record::new(
                    destination.clone(),
                    connection,
                    self.config.max_streams_per_connection,
                    pool.clone(),
                );

                if owned {
                    self.entries
                        .insert(destination.clone(), Entry::Ready(record.clone()));
                }

                debug!(%dial, id = %record.id(), waiters = waiters.len(), "connection established");
                let lease = record.lease();
                for waiter in waiters {
                    if waiter.is_closed() {
                        trace!("skipping closed waiter");
                        continue;
                    }

                    // A waiter which closes after the check drops its lease with the message.
                    if waiter.send(Ok(record.lease())).is_err() {
                        trace!("waiter closed, skipping");
                    }
                }

                Ok(lease)
            }
            Err(error) => {
                if !waiters.is_empty() {
                    warn!(%dial, %error, waiters = waiters.len(), "dial failed for waiting callers");
                }

                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    /// Drop the pending dial for `destination`. Its waiters observe
    /// [`DialError::Abandoned`].
    pub(crate) fn abandon(&mut self, destination: &Destination, dial: DialId) {
        if matches!(
            self.entries.get(destination),
            Some(Entry::Dialing(pending)) if pending.id == dial
        ) {
            trace!(%dial, "pending dial abandoned");
            self.entries.remove(destination);
        }
    }

    /// Remove the connection `id` if it is still installed for `destination`.
    pub(crate) fn remove_record(&mut self, destination: &Destination, id: ConnectionId) -> bool {
        if matches!(
            self.entries.get(destination),
            Some(Entry::Ready(record)) if record.id() == id
        ) {
            trace!(%id, "removing connection from pool");
            self.entries.remove(destination);
            return true;
        }
        false
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for entry in self.entries.values() {
            match entry {
                Entry::Dialing(pending) => {
                    stats.pending_dials += 1;
                    stats.waiters += pending
                        .waiters
                        .iter()
                        .filter(|waiter| !waiter.is_closed())
                        .count();
                }
                Entry::Ready(record) => {
                    stats.connections += 1;
                    stats.leases += record.leases();
                    stats.streams += record.open_streams();
                }
            }
        }
        stats
    }
}
